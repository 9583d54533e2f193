use core::time::Duration;
use std::{cell::RefCell, rc::Rc};

use lorawan_classb::{
    class::OperatingMode,
    config::device::{DevAddr, DeviceConfig},
    device::{DeviceSim, EndDevice, Submission},
    lorawan::{
        commands::{encode_commands, MacCommand},
        duty_cycle::DutyCycleHelper,
        mac::{DataFrame, Frame, FrameHeader, MType, PacketId, TxOutcome},
        phy::PhyConfig,
        region::DataRate,
        windows::WindowKind,
    },
    sim::SimTime,
};

use mock::{init_logger, MockPhy};

type Outcomes = Rc<RefCell<Vec<TxOutcome>>>;

// Test helper to create a Class A device on an unrestricted channel plan
fn create_test_device(config: DeviceConfig) -> (EndDevice<MockPhy>, DeviceSim<MockPhy>, Outcomes) {
    init_logger();
    let config = config.with_mode(OperatingMode::ClassA).with_seed(42);
    let mut device = EndDevice::new(MockPhy::new(), config)
        .unwrap()
        .with_channel_plan(DutyCycleHelper::unrestricted());
    let outcomes = Outcomes::default();
    let sink = outcomes.clone();
    device.set_completion_handler(move |outcome| sink.borrow_mut().push(outcome.clone()));
    (device, DeviceSim::new(), outcomes)
}

fn downlink(addr: DevAddr, commands: &[MacCommand]) -> Frame {
    let mut header = FrameHeader::new(addr, 1);
    header.f_ctrl.ack = true;
    header.f_opts = encode_commands(commands).unwrap();
    DataFrame::empty(MType::UnconfirmedDataDown, header).into_frame()
}

// Run until transmission `n` is handed to the radio and return its start
fn run_to_transmission(device: &mut EndDevice<MockPhy>, sim: &mut DeviceSim<MockPhy>, n: usize) -> SimTime {
    while device.phy().sent.len() < n {
        assert!(sim.step(device), "transmission {} never started", n);
    }
    sim.now()
}

fn noise_uplink() -> Frame {
    let header = FrameHeader::new(DevAddr::new(3, 500).unwrap(), 17);
    DataFrame::new(MType::UnconfirmedDataUp, header, 2, &[0xAA]).into_frame()
}

// Preamble at `start`, frame delivered at `end`
fn deliver(sim: &mut DeviceSim<MockPhy>, start: SimTime, end: SimTime, frame: Frame) {
    sim.schedule_at(start, |d, _| {
        d.on_preamble_detected();
    });
    sim.schedule_at(end, move |d, s| d.on_receive_complete(s, &frame));
}

#[test]
fn test_confirmed_gives_up_after_max_transmissions() {
    let (mut device, mut sim, outcomes) = create_test_device(DeviceConfig::default().with_confirmed(3));

    let submission = device.submit(&mut sim, 1, b"hello".to_vec()).unwrap();
    assert_eq!(submission, Submission::Accepted(PacketId(1)));
    sim.run_until(&mut device, SimTime::from_secs(60));

    assert_eq!(device.phy().sent.len(), 3);
    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].attempts, 3);
    assert!(!outcomes[0].success);
    assert_eq!(outcomes[0].first_attempt, SimTime::ZERO);
    assert!(device.mac().retransmission().is_none());
}

#[test]
fn test_retransmission_waits_for_ack_timeout() {
    let (mut device, mut sim, _outcomes) = create_test_device(DeviceConfig::default().with_confirmed(3));
    device.submit(&mut sim, 1, vec![1]).unwrap();

    // RX2 opens at 2.05 s, the retry follows it by at least one second
    sim.run_until(&mut device, SimTime::from_millis(3_049));
    assert_eq!(device.phy().sent.len(), 1);
    assert_eq!(device.mac().attempts_remaining(), Some(2));

    sim.run_until(&mut device, SimTime::from_millis(5_050));
    assert_eq!(device.phy().sent.len(), 2);
    assert_eq!(device.mac().attempts_remaining(), Some(1));
}

#[test]
fn test_rx1_downlink_acknowledges() {
    let (mut device, mut sim, outcomes) = create_test_device(DeviceConfig::default().with_confirmed(3));
    let addr = device.address();
    device.submit(&mut sim, 1, vec![1, 2, 3]).unwrap();

    // RX1 opens at 1.05 s for 8 symbols
    deliver(
        &mut sim,
        SimTime::from_millis(1_051),
        SimTime::from_millis(1_100),
        downlink(addr, &[]),
    );
    sim.run_until(&mut device, SimTime::from_secs(30));

    assert_eq!(device.phy().sent.len(), 1);
    // RX2 never opened
    assert_eq!(device.phy().listens.len(), 1);
    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].attempts, 1);
    assert!(outcomes[0].success);
}

#[test]
fn test_unconfirmed_completes_after_rx2() {
    let (mut device, mut sim, outcomes) = create_test_device(DeviceConfig::default());
    device.submit(&mut sim, 1, vec![7]).unwrap();

    sim.run_until(&mut device, SimTime::from_millis(2_300));
    assert!(outcomes.borrow().is_empty());

    sim.run_until(&mut device, SimTime::from_secs(30));
    assert_eq!(device.phy().sent.len(), 1);
    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].attempts, 1);
    assert!(outcomes[0].success);
}

#[test]
fn test_second_packet_deferred_past_rx2() {
    let (mut device, mut sim, outcomes) = create_test_device(DeviceConfig::default());
    device.submit(&mut sim, 1, vec![1]).unwrap();

    sim.run_until(&mut device, SimTime::from_millis(500));
    let submission = device.submit(&mut sim, 1, vec![2]).unwrap();
    // RX2 of the first packet closes at 50 ms + 2 s + 8 DR0 symbols
    assert_eq!(
        submission,
        Submission::Deferred {
            id: PacketId(2),
            delay: Duration::from_nanos(1_812_144_000),
        }
    );

    sim.run_until(&mut device, SimTime::from_millis(2_300));
    assert_eq!(device.phy().sent.len(), 1);

    sim.run_until(&mut device, SimTime::from_millis(2_400));
    assert_eq!(device.phy().sent.len(), 2);
    assert_eq!(outcomes.borrow().len(), 1);
    assert_eq!(outcomes.borrow()[0].packet.id, PacketId(1));

    sim.run_until(&mut device, SimTime::from_secs(10));
    assert_eq!(outcomes.borrow().len(), 2);
    assert!(outcomes.borrow().iter().all(|o| o.success));
}

#[test]
fn test_adr_backoff_on_retransmissions() {
    let mut config = DeviceConfig::default()
        .with_confirmed(4)
        .with_adr(true)
        .with_data_rate(DataRate::DR5);
    config.tx_power = 16;
    let (mut device, mut sim, outcomes) = create_test_device(config);
    device.submit(&mut sim, 1, vec![1]).unwrap();
    sim.run_until(&mut device, SimTime::from_secs(60));

    let sent = &device.phy().sent;
    let factors: Vec<u8> = sent.iter().map(|f| f.spreading_factor).collect();
    let powers: Vec<i8> = sent.iter().map(|f| f.power).collect();
    assert_eq!(factors, [7, 8, 8, 9]);
    assert_eq!(powers, [16, 14, 14, 14]);
    assert_eq!(outcomes.borrow()[0].attempts, 4);
}

#[test]
fn test_adr_backoff_on_first_transmission() {
    // with 3 transmissions the first one already leaves 2
    let mut config = DeviceConfig::default()
        .with_confirmed(3)
        .with_adr(true)
        .with_data_rate(DataRate::DR5);
    config.tx_power = 16;
    let (mut device, mut sim, _outcomes) = create_test_device(config);
    device.submit(&mut sim, 1, vec![1]).unwrap();
    sim.run_until(&mut device, SimTime::from_secs(60));

    let sent = &device.phy().sent;
    let factors: Vec<u8> = sent.iter().map(|f| f.spreading_factor).collect();
    let powers: Vec<i8> = sent.iter().map(|f| f.power).collect();
    assert_eq!(factors, [8, 8, 9]);
    assert_eq!(powers, [14, 14, 14]);
}

#[test]
fn test_rx1_rx2_swap() {
    let phy = PhyConfig {
        rx1_rx2_swap: true,
        ..PhyConfig::default()
    };
    let (mut device, mut sim, _outcomes) = create_test_device(DeviceConfig::default().with_phy(phy));
    device.submit(&mut sim, 1, vec![1]).unwrap();
    sim.run_until(&mut device, SimTime::from_secs(3));

    let tx_frequency = device.phy().sent[0].frequency;
    assert_eq!(
        device.phy().listens,
        [(869_525_000, 12), (tx_frequency, 7)]
    );
}

#[test]
fn test_rx_param_setup_moves_rx2() {
    let (mut device, mut sim, _outcomes) = create_test_device(DeviceConfig::default());
    let addr = device.address();
    device.submit(&mut sim, 1, vec![1]).unwrap();

    let request = MacCommand::RxParamSetupReq {
        rx1_dr_offset: 2,
        rx2_data_rate: DataRate::DR3,
        frequency: 869_100_000,
    };
    deliver(
        &mut sim,
        SimTime::from_millis(1_051),
        SimTime::from_millis(1_100),
        downlink(addr, &[request]),
    );
    sim.run_until(&mut device, SimTime::from_secs(5));
    assert_eq!(device.windows().config().rx2_frequency, 869_100_000);
    assert_eq!(device.windows().config().rx1_dr_offset, 2);

    device.submit(&mut sim, 1, vec![2]).unwrap();
    sim.run_until(&mut device, SimTime::from_secs(10));

    // the answer rides in FOpts of the next uplink: FCtrl carries its length
    let second = &device.phy().sent[1].bytes;
    assert_eq!(second[5] & 0x0F, 2);
    assert_eq!(&second[8..10], &[0x05, 0x07]);

    // RX1 of DR5 with offset 2 is DR3, RX2 is the new channel at DR3
    let listens = &device.phy().listens;
    let tx_frequency = device.phy().sent[1].frequency;
    assert_eq!(listens[listens.len() - 2], (tx_frequency, 9));
    assert_eq!(listens[listens.len() - 1], (869_100_000, 9));
}

#[test]
fn test_foreign_frame_in_rx2_triggers_retry() {
    let (mut device, mut sim, _outcomes) = create_test_device(DeviceConfig::default().with_confirmed(3));
    device.submit(&mut sim, 1, vec![1]).unwrap();

    let other = DevAddr::new(1, 99).unwrap();
    // RX2 opens at 2.05 s and closes while the radio still receives
    deliver(
        &mut sim,
        SimTime::from_millis(2_100),
        SimTime::from_millis(2_400),
        downlink(other, &[]),
    );
    sim.run_until(&mut device, SimTime::from_millis(2_401));
    assert!(device.mac().timers().retry.is_pending(&sim));

    sim.run_until(&mut device, SimTime::from_millis(5_100));
    assert_eq!(device.phy().sent.len(), 2);
}

#[test]
fn test_failed_reception_after_rx2_retries_then_fails() {
    let (mut device, mut sim, outcomes) = create_test_device(DeviceConfig::default().with_confirmed(2));
    device.submit(&mut sim, 1, vec![1]).unwrap();

    // RX2 opens at 2.05 s, the preamble keeps the radio past its close
    sim.schedule_at(SimTime::from_millis(2_100), |d, _| {
        d.on_preamble_detected();
    });
    sim.schedule_at(SimTime::from_millis(2_400), |d, s| d.on_receive_failed(s));
    sim.run_until(&mut device, SimTime::from_millis(2_399));
    assert!(!device.mac().timers().retry.is_pending(&sim));
    sim.run_until(&mut device, SimTime::from_millis(2_400));
    assert!(device.mac().timers().retry.is_pending(&sim));

    // same again in RX2 of the last transmission
    let start = run_to_transmission(&mut device, &mut sim, 2);
    sim.schedule_at(start + Duration::from_millis(2_100), |d, _| {
        d.on_preamble_detected();
    });
    sim.schedule_at(start + Duration::from_millis(2_400), |d, s| d.on_receive_failed(s));
    sim.run_until(&mut device, start + Duration::from_millis(2_399));
    assert!(outcomes.borrow().is_empty());

    sim.run_until(&mut device, SimTime::from_secs(60));
    assert_eq!(device.phy().sent.len(), 2);
    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].attempts, 2);
    assert!(!outcomes[0].success);
}

#[test]
fn test_uplink_noise_in_rx2_retries_then_fails() {
    let (mut device, mut sim, outcomes) = create_test_device(DeviceConfig::default().with_confirmed(2));
    device.submit(&mut sim, 1, vec![1]).unwrap();

    // another device's uplink outlasts RX2 of each transmission
    deliver(
        &mut sim,
        SimTime::from_millis(2_100),
        SimTime::from_millis(2_400),
        noise_uplink(),
    );
    sim.run_until(&mut device, SimTime::from_millis(2_400));
    assert!(device.mac().timers().retry.is_pending(&sim));
    assert_eq!(device.mac().attempts_remaining(), Some(1));

    let start = run_to_transmission(&mut device, &mut sim, 2);
    deliver(
        &mut sim,
        start + Duration::from_millis(2_100),
        start + Duration::from_millis(2_400),
        noise_uplink(),
    );
    sim.run_until(&mut device, SimTime::from_secs(60));

    assert_eq!(device.phy().sent.len(), 2);
    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].attempts, 2);
    assert!(!outcomes[0].success);
}

#[test]
fn test_long_rx1_still_reaches_retry_decision() {
    // 40 symbols at DR0 keep RX1 open for 1.31 s, past the RX2 open
    let phy = PhyConfig {
        window_symbols: 40,
        ..PhyConfig::default()
    };
    let config = DeviceConfig::default()
        .with_confirmed(3)
        .with_data_rate(DataRate::DR0)
        .with_phy(phy);
    assert!(config.validate().is_ok());
    let (mut device, mut sim, outcomes) = create_test_device(config);
    device.submit(&mut sim, 1, vec![1]).unwrap();

    sim.run_until(&mut device, SimTime::from_millis(2_100));
    assert_eq!(device.windows().active(), Some(WindowKind::Rx2));

    sim.run_until(&mut device, SimTime::from_secs(300));
    assert_eq!(device.phy().sent.len(), 3);
    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].attempts, 3);
    assert!(!outcomes[0].success);
}

#[test]
fn test_rx1_ack_frees_next_uplink() {
    let (mut device, mut sim, outcomes) = create_test_device(DeviceConfig::default().with_confirmed(3));
    let addr = device.address();
    device.submit(&mut sim, 1, vec![1]).unwrap();
    deliver(
        &mut sim,
        SimTime::from_millis(1_051),
        SimTime::from_millis(1_100),
        downlink(addr, &[]),
    );
    sim.run_until(&mut device, SimTime::from_millis(1_500));
    assert!(!device.windows().uplink_windows_pending(&sim));
    assert_eq!(device.windows().second_window_close_time(), None);

    // RX2 was cancelled, nothing holds the next packet back
    let submission = device.submit(&mut sim, 1, vec![2]).unwrap();
    assert_eq!(submission, Submission::Accepted(PacketId(2)));
    assert_eq!(device.phy().sent.len(), 2);
    assert!(outcomes.borrow()[0].success);
}

#[test]
fn test_reception_in_rx1_defers_decision() {
    let (mut device, mut sim, outcomes) = create_test_device(DeviceConfig::default().with_confirmed(2));
    device.submit(&mut sim, 1, vec![1]).unwrap();

    let other = DevAddr::new(1, 99).unwrap();
    deliver(
        &mut sim,
        SimTime::from_millis(1_051),
        SimTime::from_millis(1_100),
        downlink(other, &[]),
    );
    sim.run_until(&mut device, SimTime::from_millis(1_101));
    // RX2 still pending, no retry yet
    assert!(!device.mac().timers().retry.is_pending(&sim));
    assert!(device.windows().uplink_windows_pending(&sim));

    sim.run_until(&mut device, SimTime::from_secs(30));
    assert_eq!(device.phy().sent.len(), 2);
    assert_eq!(outcomes.borrow()[0].attempts, 2);
    assert!(!outcomes.borrow()[0].success);
}

#[test]
fn test_duty_cycle_defers_packet() {
    let config = DeviceConfig::default().with_mode(OperatingMode::ClassA);
    let mut device = EndDevice::new(MockPhy::new(), config).unwrap();
    let mut sim = DeviceSim::new();
    device.submit(&mut sim, 1, vec![1]).unwrap();

    sim.run_until(&mut device, SimTime::from_secs(3));
    // 50 ms on air in a 1% sub-band closes it for 5 s from the start
    let submission = device.submit(&mut sim, 1, vec![2]).unwrap();
    assert_eq!(
        submission,
        Submission::Deferred {
            id: PacketId(2),
            delay: Duration::from_secs(2),
        }
    );
    sim.run_until(&mut device, SimTime::from_millis(4_999));
    assert_eq!(device.phy().sent.len(), 1);
    sim.run_until(&mut device, SimTime::from_secs(5));
    assert_eq!(device.phy().sent.len(), 2);
}

#[test]
fn test_no_channel_reports_failure() {
    let (device, mut sim, outcomes) = create_test_device(DeviceConfig::default());
    let mut plan = DutyCycleHelper::eu868();
    for channel in plan.channels_mut().iter_mut() {
        channel.enabled = false;
    }
    let mut device = device.with_channel_plan(plan);

    let submission = device.submit(&mut sim, 1, vec![1]).unwrap();
    assert_eq!(submission, Submission::Accepted(PacketId(1)));
    assert!(device.phy().sent.is_empty());
    assert_eq!(outcomes.borrow().len(), 1);
    assert_eq!(outcomes.borrow()[0].attempts, 0);
    assert!(!outcomes.borrow()[0].success);
}

#[test]
fn test_unconfirmed_completes_after_late_reception() {
    let (mut device, mut sim, outcomes) = create_test_device(DeviceConfig::default());
    device.submit(&mut sim, 1, vec![1]).unwrap();

    // RX2 closes at 2.312 s while this frame is still arriving
    let other = DevAddr::new(1, 99).unwrap();
    deliver(
        &mut sim,
        SimTime::from_millis(2_100),
        SimTime::from_millis(2_400),
        downlink(other, &[]),
    );
    sim.run_until(&mut device, SimTime::from_millis(2_350));
    assert!(outcomes.borrow().is_empty());

    sim.run_until(&mut device, SimTime::from_millis(2_400));
    assert_eq!(outcomes.borrow().len(), 1);
    assert!(outcomes.borrow()[0].success);
}
