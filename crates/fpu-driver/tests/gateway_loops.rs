//! 收发循环与网关模拟器的集成测试

use fpu_driver::{
    CommandTimeouts, DriverError, GatewayAddress, GridDriver, GridDriverBuilder, InterfaceState,
    Target, WaitStatus, WaitTarget,
};
use fpu_gateway::{GatewaySimulator, SimulatorConfig};
use fpu_protocol::{Command, CommandKind, FpuState, ResponseStatus};
use serial_test::serial;
use std::time::{Duration, Instant};

const NUM_FPUS: usize = 76;

fn start() -> (GatewaySimulator, GridDriver) {
    let sim = GatewaySimulator::start(SimulatorConfig {
        num_fpus: NUM_FPUS,
        ..Default::default()
    })
    .unwrap();
    let driver = GridDriverBuilder::new()
        .num_fpus(NUM_FPUS)
        .gateway(GatewayAddress::parse(&sim.address()).unwrap())
        .timeouts(CommandTimeouts::uniform(1_000))
        .tracker_granularity(Duration::from_millis(5))
        .build()
        .unwrap();
    driver.connect().unwrap();
    (sim, driver)
}

fn deadline(ms: u64) -> Option<Instant> {
    Some(Instant::now() + Duration::from_millis(ms))
}

#[test]
#[serial]
fn test_ping_every_fpu() {
    let (_sim, driver) = start();
    for fpu in 0..NUM_FPUS as u16 {
        driver.send(Command::PingFpu, Target::Fpu(fpu)).unwrap();
    }
    let (grid, status) = driver.wait_for(WaitTarget::NoMorePending, deadline(5_000));
    assert_eq!(status, WaitStatus::Satisfied);
    assert_eq!(grid.count(FpuState::Uninitialized), NUM_FPUS as u32);
    assert!(grid.counts_consistent());
    assert!(grid.fpus.iter().all(|f| f.last_status == ResponseStatus::Ok));

    let metrics = driver.metrics();
    assert_eq!(metrics.tx_frames, NUM_FPUS as u64);
    assert_eq!(metrics.rx_frames, NUM_FPUS as u64);
    assert_eq!(metrics.rx_unmatched, 0);
}

#[test]
#[serial]
fn test_broadcast_reaches_all_devices() {
    let (sim, driver) = start();
    driver
        .send(Command::PingFpu, Target::Broadcast { gateway: 0 })
        .unwrap();
    let (grid, status) = driver.wait_for(WaitTarget::NoMorePending, deadline(5_000));
    assert_eq!(status, WaitStatus::Satisfied);
    assert_eq!(grid.count(FpuState::Uninitialized), NUM_FPUS as u32);
    // 76 个 FPU 只在第一条总线上
    assert_eq!(sim.broadcast_count(), 1);
    assert_eq!(driver.metrics().broadcasts, 1);
}

#[test]
#[serial]
fn test_silent_device_times_out() {
    let (sim, driver) = start();
    sim.set_silent(5, Some(CommandKind::PingFpu), true);
    driver
        .send_with_timeout(Command::PingFpu, Target::Fpu(5), Duration::from_millis(50))
        .unwrap();
    driver.send(Command::PingFpu, Target::Fpu(6)).unwrap();

    let (grid, status) = driver.wait_for(WaitTarget::NoMorePending, deadline(5_000));
    assert_eq!(status, WaitStatus::Satisfied);
    assert_eq!(grid.count_timeout, 1);
    assert_eq!(grid.fpus[5].last_status, ResponseStatus::TimedOut);
    assert_eq!(grid.fpus[6].last_status, ResponseStatus::Ok);
    assert_eq!(driver.metrics().command_timeouts, 1);
}

#[test]
#[serial]
fn test_peer_close_marks_unconnected() {
    let (sim, driver) = start();
    sim.disconnect_client();
    let (grid, status) = driver.wait_until(|_| false, deadline(5_000));
    assert_eq!(status, WaitStatus::Disconnected);
    assert_eq!(grid.interface_state, InterfaceState::Unconnected);
    assert!(matches!(
        driver.send(Command::PingFpu, Target::Fpu(0)),
        Err(DriverError::NotConnected)
    ));

    // 可以重新连接
    driver.connect().unwrap();
    driver.send(Command::PingFpu, Target::Fpu(0)).unwrap();
    let (_, status) = driver.wait_for(WaitTarget::NoMorePending, deadline(5_000));
    assert_eq!(status, WaitStatus::Satisfied);
    assert!(sim.connection_count() >= 2);
}

#[test]
#[serial]
fn test_queued_command_resumes_after_reconnect() {
    let (sim, driver) = start();
    sim.disconnect_client();
    let (_, status) = driver.wait_until(|_| false, deadline(5_000));
    assert_eq!(status, WaitStatus::Disconnected);

    let pings_before = sim.command_count(CommandKind::PingFpu);
    let ticket = driver
        .pool()
        .acquire(Command::PingFpu, Target::Fpu(1), Duration::from_millis(1_000));
    driver.submit(ticket).unwrap();
    assert_eq!(driver.queue().total_len(), 1);
    assert_eq!(driver.snapshot().num_queued, 1);

    driver.connect().unwrap();
    let (grid, status) = driver.wait_for(WaitTarget::NoMorePending, deadline(5_000));
    assert_eq!(status, WaitStatus::Satisfied);
    assert_eq!(grid.num_queued, 0);
    assert_eq!(grid.fpus[1].last_status, ResponseStatus::Ok);
    assert_eq!(sim.command_count(CommandKind::PingFpu), pings_before + 1);
    assert!(driver.queue().is_empty());
}

#[test]
#[serial]
fn test_flush_discards_queued_commands() {
    let (sim, driver) = start();
    driver.disconnect().unwrap();
    for fpu in 0..3u16 {
        let ticket = driver
            .pool()
            .acquire(Command::PingFpu, Target::Fpu(fpu), Duration::from_millis(1_000));
        driver.submit(ticket).unwrap();
    }
    assert_eq!(driver.flush_queues(), 3);
    assert_eq!(driver.snapshot().num_queued, 0);

    let pings_before = sim.command_count(CommandKind::PingFpu);
    driver.connect().unwrap();
    let (_, status) = driver.wait_for(WaitTarget::NoMorePending, deadline(1_000));
    assert_eq!(status, WaitStatus::Satisfied);
    assert_eq!(sim.command_count(CommandKind::PingFpu), pings_before);
}

#[test]
#[serial]
fn test_connect_twice_and_disconnect() {
    let (_sim, driver) = start();
    assert!(matches!(driver.connect(), Err(DriverError::AlreadyConnected)));
    assert!(driver.is_healthy());
    driver.disconnect().unwrap();
    assert!(!driver.is_connected());
    assert!(matches!(driver.disconnect(), Err(DriverError::NotConnected)));
}

#[test]
#[serial]
fn test_invalid_targets_rejected() {
    let (_sim, driver) = start();
    assert!(matches!(
        driver.send(Command::PingFpu, Target::Fpu(NUM_FPUS as u16)),
        Err(DriverError::InvalidFpuId { .. })
    ));
    assert!(matches!(
        driver.send(Command::PingFpu, Target::Broadcast { gateway: 1 }),
        Err(DriverError::InvalidGateway { .. })
    ));
}

#[test]
#[serial]
fn test_connect_refused() {
    let driver = GridDriverBuilder::new()
        .num_fpus(NUM_FPUS)
        .gateway(GatewayAddress::new("127.0.0.1", 1))
        .connect_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    assert!(matches!(driver.connect(), Err(DriverError::Gateway(_))));
    assert!(!driver.is_connected());
}
