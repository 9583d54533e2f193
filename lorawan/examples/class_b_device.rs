//! Class B sensor node on the virtual clock
//!
//! A gateway broadcasts beacons on the 128 s grid while the node sends a
//! confirmed sensor reading every minute. The gateway acknowledges every
//! other reading in RX1; the rest are retransmitted until they give up.
//!
//! Run with `RUST_LOG=debug cargo run --example class_b_device`.

use core::time::Duration;

use lorawan_classb::{
    class::class_b::{beacon::BeaconTag, timing::schedule_beacon_broadcasts},
    config::device::DeviceConfig,
    device::{DeviceSim, EndDevice, Submission},
    lorawan::mac::{DataFrame, Frame, FrameHeader, MType},
    radio::{Phy, TxParams},
    sim::SimTime,
};

/// Radio model with LoRa time-on-air and no channel losses
#[derive(Default)]
struct AirtimePhy {
    frames_sent: usize,
}

impl Phy for AirtimePhy {
    fn send(&mut self, _frame: &Frame, _params: &TxParams, _frequency: u32, _power: i8) {
        self.frames_sent += 1;
    }

    fn on_air_time(&self, frame: &Frame, params: &TxParams) -> Duration {
        let m = params.modulation;
        let sf = f64::from(m.spreading_factor);
        let t_sym = f64::from(1u32 << m.spreading_factor) / f64::from(m.bandwidth);
        let de = if params.low_data_rate_optimize { 1.0 } else { 0.0 };
        let h = if params.header_disabled { 1.0 } else { 0.0 };
        let crc = if params.crc_enabled { 1.0 } else { 0.0 };
        let num = 8.0 * frame.len() as f64 - 4.0 * sf + 28.0 + 16.0 * crc - 20.0 * h;
        let payload_symbols =
            8.0 + ((num / (4.0 * (sf - 2.0 * de))).ceil() * f64::from(m.coding_rate + 4)).max(0.0);
        let preamble = f64::from(params.preamble_symbols) + 4.25;
        Duration::from_secs_f64((preamble + payload_symbols) * t_sym)
    }

    fn switch_to_standby(&mut self) {}

    fn switch_to_sleep(&mut self) {}

    fn set_frequency(&mut self, _frequency: u32) {}

    fn set_spreading_factor(&mut self, _spreading_factor: u8) {}
}

type Node = EndDevice<AirtimePhy>;

const READING_INTERVAL: Duration = Duration::from_secs(60);
const BEACON_AIRTIME: Duration = Duration::from_millis(150);
const ACK_AIRTIME: Duration = Duration::from_millis(40);

// Sensor data structure
#[derive(Default)]
struct SensorData {
    temperature: i16,
    humidity: u8,
    pressure: u16,
}

impl SensorData {
    fn to_bytes(&self) -> [u8; 5] {
        let mut bytes = [0u8; 5];
        bytes[0..2].copy_from_slice(&self.temperature.to_be_bytes());
        bytes[2] = self.humidity;
        bytes[3..5].copy_from_slice(&self.pressure.to_be_bytes());
        bytes
    }
}

fn gateway_beacon(node: &mut Node, sim: &mut DeviceSim<AirtimePhy>, tag: BeaconTag) {
    node.on_preamble_detected();
    sim.schedule(BEACON_AIRTIME, move |n, s| {
        n.on_receive_complete(s, &Frame::beacon(tag))
    });
}

fn send_reading(node: &mut Node, sim: &mut DeviceSim<AirtimePhy>, count: u16) {
    let reading = SensorData {
        temperature: 215 + (count % 7) as i16,
        humidity: 40 + (count % 20) as u8,
        pressure: 1013,
    };
    match node.submit(sim, 1, reading.to_bytes().to_vec()) {
        Ok(Submission::Accepted(id)) if count % 2 == 0 => {
            // the gateway answers 1 ms into RX1
            let sent = node.phy().frames_sent;
            log::info!("reading {} sent as frame {}, gateway will ack", id, sent);
            let header = {
                let mut header = FrameHeader::new(node.address(), count);
                header.f_ctrl.ack = true;
                header
            };
            let ack = DataFrame::empty(MType::UnconfirmedDataDown, header).into_frame();
            let timing = node.windows().config().timing;
            if let Some(rx2) = node.windows().second_window_open_time() {
                let rx1 = rx2 - (timing.rx2_delay - timing.rx1_delay) + Duration::from_millis(1);
                sim.schedule_at(rx1, |n, _| {
                    n.on_preamble_detected();
                });
                sim.schedule_at(rx1 + ACK_AIRTIME, move |n, s| n.on_receive_complete(s, &ack));
            }
        }
        Ok(submission) => log::info!("reading {:?}", submission),
        Err(err) => log::error!("reading rejected: {}", err),
    }
    sim.schedule(READING_INTERVAL, move |n, s| send_reading(n, s, count + 1));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = DeviceConfig::default().with_confirmed(4).with_adr(true);
    let mut node = EndDevice::new(AirtimePhy::default(), config)?;
    node.set_completion_handler(|outcome| {
        log::info!(
            "packet {} finished: success={} after {} transmissions",
            outcome.packet.id,
            outcome.success,
            outcome.attempts
        );
    });

    let mut sim = DeviceSim::new();
    node.start(&mut sim)?;
    schedule_beacon_broadcasts(&mut sim, gateway_beacon);
    sim.schedule(Duration::from_secs(5), |n, s| send_reading(n, s, 0));

    sim.run_until(&mut node, SimTime::from_secs(900));

    let tracker = node.class_b().map(|c| c.beacon_tracker());
    if let Some(tracker) = tracker {
        log::info!(
            "{} beacons received, {} frames sent",
            tracker.beacons_received(),
            node.phy().frames_sent
        );
    }
    Ok(())
}
