//! 热路径性能基准测试
//!
//! - 超时跟踪器的插入/弹出（接收线程每轮都要做）
//! - 分帧编码与解码
//! - 响应应用到状态存储

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use fpu_driver::{GridStateStore, TimeoutTracker};
use fpu_protocol::framer::{FrameDecoder, encode_frame, encode_frame_into};
use fpu_protocol::{
    Command, CommandKind, FpuState, MessageCode, MotionSegment, Response, ResponseData,
    ResponseStatus, StatusReport,
};
use std::time::{Duration, Instant};

fn bench_tracker(c: &mut Criterion) {
    let mut group = c.benchmark_group("timeout_tracker");
    for &num_fpus in &[76usize, 380, 1140] {
        group.bench_with_input(BenchmarkId::new("insert_all", num_fpus), &num_fpus, |b, &n| {
            let epoch = Instant::now();
            let mut tracker = TimeoutTracker::with_epoch(n, Duration::from_millis(1), epoch);
            b.iter(|| {
                for fpu in 0..n {
                    let at = epoch + Duration::from_millis(((fpu * 7919) % 5000) as u64);
                    tracker.insert_or_update(fpu, at);
                }
                black_box(tracker.peek_next_deadline())
            });
        });

        group.bench_with_input(BenchmarkId::new("insert_then_drain", num_fpus), &num_fpus, |b, &n| {
            let epoch = Instant::now();
            let mut tracker = TimeoutTracker::with_epoch(n, Duration::from_millis(1), epoch);
            b.iter(|| {
                for fpu in 0..n {
                    let at = epoch + Duration::from_millis(((fpu * 7919) % 5000) as u64);
                    tracker.insert_or_update(fpu, at);
                }
                let mut popped = 0;
                while tracker.pop_minimum().is_some() {
                    popped += 1;
                }
                black_box(popped)
            });
        });
    }
    group.finish();
}

fn bench_framer(c: &mut Criterion) {
    let frames: Vec<_> = (0..76u8)
        .map(|i| {
            Command::ConfigMotion(MotionSegment {
                alpha_steps: 0x1010 + i as i16,
                beta_steps: -(i as i16),
                first: i == 0,
                last: false,
            })
            .serialize(0, i + 1, i)
        })
        .collect();

    c.bench_function("framer/encode_76", |b| {
        let mut out = Vec::with_capacity(76 * 32);
        b.iter(|| {
            out.clear();
            for frame in &frames {
                encode_frame_into(frame, &mut out);
            }
            black_box(out.len())
        });
    });

    let stream: Vec<u8> = frames.iter().flat_map(encode_frame).collect();
    c.bench_function("framer/decode_76", |b| {
        let mut decoder = FrameDecoder::new();
        b.iter(|| {
            let mut count = 0usize;
            decoder.decode_slice(black_box(&stream), |_| count += 1);
            count
        });
    });
}

fn bench_apply_response(c: &mut Criterion) {
    let store = GridStateStore::new(76, Duration::from_millis(1), false);
    let frames: Vec<_> = (0..76u8)
        .map(|i| {
            Response {
                bus: 0,
                busid: i + 1,
                seq: 1,
                code: MessageCode::Command(CommandKind::PingFpu),
                report: Some(StatusReport {
                    state: FpuState::Resting,
                    status: ResponseStatus::Ok,
                    ..Default::default()
                }),
                data: ResponseData::Position {
                    alpha_steps: 100,
                    beta_steps: -100,
                },
            }
            .to_frame()
        })
        .collect();

    c.bench_function("store/ping_round_76", |b| {
        b.iter(|| {
            let deadline = Instant::now() + Duration::from_secs(10);
            for fpu in 0..76 {
                let _ = store.register_sent_single(fpu, CommandKind::PingFpu, 1, deadline, true);
            }
            for frame in &frames {
                let _ = black_box(store.apply_response(0, frame));
            }
        });
    });
}

criterion_group!(benches, bench_tracker, bench_framer, bench_apply_response);
criterion_main!(benches);
