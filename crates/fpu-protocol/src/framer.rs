//! 字节流分帧
//!
//! 网关 TCP 流中的每条消息被封装为：
//!
//! ```text
//! DLE STX <raw frame, DLE 加倍> DLE ETX
//! ```
//!
//! DLE 加倍是唯一的转义规则。解码器逐字节推进，遇到以下情况直接丢弃
//! 当前帧（不报错，噪声链路上的宽松策略）：
//! - 帧内出现 `DLE STX`：重新同步，丢弃已收集的部分
//! - 未知转义对（DLE 后跟非 STX/ETX/DLE）
//! - 帧长度超过 `MAX_FRAME_LEN`
//! - 帧长度不足帧头

use crate::GatewayFrame;
use crate::constants::*;

/// 编码一帧，追加到输出缓冲区
///
/// 输出缓冲区可以是 `Vec<u8>`，也可以是 `bytes::BytesMut` 等任何实现了
/// `Extend<u8>` 的类型。
pub fn encode_frame_into<B: Extend<u8>>(frame: &GatewayFrame, out: &mut B) {
    let mut raw = [0u8; MAX_FRAME_LEN];
    let n = frame.write_raw(&mut raw);

    out.extend([DLE, STX]);
    for &byte in &raw[..n] {
        if byte == DLE {
            out.extend([DLE, DLE]);
        } else {
            out.extend([byte]);
        }
    }
    out.extend([DLE, ETX]);
}

/// 编码一帧为新的字节向量
pub fn encode_frame(frame: &GatewayFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_ENCODED_FRAME_LEN);
    encode_frame_into(frame, &mut out);
    out
}

/// 流式解码器（每个网关连接一个实例）
#[derive(Debug)]
pub struct FrameDecoder {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
    /// 已看到 DLE STX，正在收集帧内容
    in_sync: bool,
    /// 上一个字节是 DLE
    escape_pending: bool,
    /// 被丢弃的畸形帧计数
    dropped: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: [0u8; MAX_FRAME_LEN],
            len: 0,
            in_sync: false,
            escape_pending: false,
            dropped: 0,
        }
    }

    /// 推入一个字节，如果完成一帧则返回
    pub fn decode_append(&mut self, byte: u8) -> Option<GatewayFrame> {
        if self.escape_pending {
            self.escape_pending = false;
            return match byte {
                STX => {
                    if self.in_sync && self.len > 0 {
                        self.dropped += 1;
                    }
                    self.in_sync = true;
                    self.len = 0;
                    None
                },
                ETX => self.finish_frame(),
                DLE => {
                    self.push(DLE);
                    None
                },
                _ => {
                    self.desync();
                    None
                },
            };
        }

        if byte == DLE {
            self.escape_pending = true;
        } else if self.in_sync {
            self.push(byte);
        }
        None
    }

    /// 推入一段字节，对每个完成的帧调用回调
    pub fn decode_slice(&mut self, bytes: &[u8], mut on_frame: impl FnMut(GatewayFrame)) {
        for &byte in bytes {
            if let Some(frame) = self.decode_append(byte) {
                on_frame(frame);
            }
        }
    }

    /// 被丢弃的畸形帧数量
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// 是否处于帧内
    pub fn is_in_sync(&self) -> bool {
        self.in_sync
    }

    /// 清空状态（连接重建时使用）
    pub fn reset(&mut self) {
        self.len = 0;
        self.in_sync = false;
        self.escape_pending = false;
    }

    fn push(&mut self, byte: u8) {
        if !self.in_sync {
            return;
        }
        if self.len == MAX_FRAME_LEN {
            // 超长帧：失步，等待下一个 DLE STX
            self.desync();
            return;
        }
        self.buf[self.len] = byte;
        self.len += 1;
    }

    fn finish_frame(&mut self) -> Option<GatewayFrame> {
        if !self.in_sync {
            return None;
        }
        let result = GatewayFrame::from_raw(&self.buf[..self.len]).ok();
        if result.is_none() {
            self.dropped += 1;
        }
        self.in_sync = false;
        self.len = 0;
        result
    }

    fn desync(&mut self) {
        if self.in_sync {
            self.dropped += 1;
        }
        self.in_sync = false;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_all(bytes: &[u8]) -> Vec<GatewayFrame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        decoder.decode_slice(bytes, |f| frames.push(f));
        frames
    }

    #[test]
    fn test_encode_layout_without_escape() {
        let frame = GatewayFrame::new(1, 0x0085, &[0x07, 0x01]);
        assert_eq!(
            encode_frame(&frame),
            vec![DLE, STX, 0x01, 0x85, 0x00, 0x07, 0x01, DLE, ETX]
        );
    }

    #[test]
    fn test_encode_doubles_escape() {
        // bus 号、标识符、负载中都出现 DLE
        let frame = GatewayFrame::new(DLE, 0x1010, &[DLE, 0x00, DLE]);
        let encoded = encode_frame(&frame);
        assert_eq!(
            encoded,
            vec![
                DLE, STX, DLE, DLE, DLE, DLE, DLE, DLE, DLE, DLE, 0x00, DLE, DLE, DLE, ETX
            ]
        );
        assert_eq!(decode_all(&encoded), vec![frame]);
    }

    #[test]
    fn test_resync_on_spurious_start() {
        let good = GatewayFrame::new(2, 0x0103, &[9, 8, 7]);
        let mut stream = vec![DLE, STX, 0x01, 0x02, 0x03];
        stream.extend(encode_frame(&good));

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        decoder.decode_slice(&stream, |f| frames.push(f));
        assert_eq!(frames, vec![good]);
        assert_eq!(decoder.dropped_frames(), 1);
    }

    #[test]
    fn test_garbage_before_first_frame_is_ignored() {
        let good = GatewayFrame::new(0, 0x0001, &[1]);
        let mut stream = vec![0xFF, 0x00, ETX, STX, 0x42];
        stream.extend(encode_frame(&good));
        assert_eq!(decode_all(&stream), vec![good]);
    }

    #[test]
    fn test_end_marker_out_of_sync_is_ignored() {
        assert!(decode_all(&[DLE, ETX, DLE, ETX]).is_empty());
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let good = GatewayFrame::new(3, 0x0042, &[1, 2]);
        let mut stream = vec![DLE, STX];
        stream.extend(std::iter::repeat_n(0x55, MAX_FRAME_LEN + 1));
        stream.extend([DLE, ETX]);
        stream.extend(encode_frame(&good));

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        decoder.decode_slice(&stream, |f| frames.push(f));
        assert_eq!(frames, vec![good]);
        assert_eq!(decoder.dropped_frames(), 1);
    }

    #[test]
    fn test_short_frame_is_dropped() {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        decoder.decode_slice(&[DLE, STX, 0x01, 0x02, DLE, ETX], |f| frames.push(f));
        assert!(frames.is_empty());
        assert_eq!(decoder.dropped_frames(), 1);
    }

    #[test]
    fn test_invalid_escape_desyncs() {
        let good = GatewayFrame::new(1, 0x0002, &[]);
        let mut stream = vec![DLE, STX, 0x01, DLE, 0x55, 0x02, 0x00, DLE, ETX];
        stream.extend(encode_frame(&good));
        assert_eq!(decode_all(&stream), vec![good]);
    }

    #[test]
    fn test_frames_split_across_reads() {
        let a = GatewayFrame::new(0, 0x0081, &[1, DLE, 3]);
        let b = GatewayFrame::new(4, 0x0200, &[DLE; 8]);
        let mut stream = encode_frame(&a);
        stream.extend(encode_frame(&b));

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            decoder.decode_slice(chunk, |f| frames.push(f));
        }
        assert_eq!(frames, vec![a, b]);
    }

    proptest! {
        /// 任意帧（含 0 个、1 个或多个 DLE）编码后解码得到原帧
        #[test]
        fn prop_roundtrip(
            bus in any::<u8>(),
            can_id in any::<u16>(),
            payload in proptest::collection::vec(
                prop_oneof![Just(DLE), any::<u8>()], 0..=MAX_PAYLOAD_LEN
            ),
        ) {
            let frame = GatewayFrame::new(bus, can_id, &payload);
            let frames = decode_all(&encode_frame(&frame));
            prop_assert_eq!(frames, vec![frame]);
        }

        /// 连续多帧的流逐帧还原
        #[test]
        fn prop_stream_of_frames(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN), 1..16
            ),
        ) {
            let frames: Vec<_> = payloads
                .iter()
                .enumerate()
                .map(|(i, p)| GatewayFrame::new(i as u8 % 5, 0x0080 | i as u16, p))
                .collect();
            let mut stream = Vec::new();
            for f in &frames {
                encode_frame_into(f, &mut stream);
            }
            prop_assert_eq!(decode_all(&stream), frames);
        }
    }
}
