//! Simulated LoRaWAN end-device
//!
//! This module provides the device that runs on the virtual clock. It ties
//! together:
//! - The radio state supervisor
//! - The receive window timing engine
//! - The uplink/retransmission controller (MAC state)
//! - Beacon tracking and ping slots for Class B devices
//!
//! Every timer callback receives the device and the scheduler. The physical
//! layer model reports back through [`EndDevice::on_preamble_detected`],
//! [`EndDevice::on_receive_complete`] and [`EndDevice::on_receive_failed`].

use core::time::Duration;

use thiserror::Error;

use crate::{
    class::{
        class_b::{beacon::BeaconTag, timing::time_until_next_beacon},
        ClassB, OperatingMode,
    },
    config::device::{ConfigError, DevAddr, DeviceConfig},
    lorawan::{
        duty_cycle::{ChannelPlan, DutyCycleHelper},
        mac::{DataFrame, Frame, FrameClass, FrameError, MacLayer, PacketId, TxOutcome, Uplink, UplinkPhase},
        windows::{WindowClose, WindowEngine, WindowKind},
    },
    radio::{Phy, RadioState, RadioSupervisor},
    sim::Simulator,
};

/// Scheduler driving one end-device
pub type DeviceSim<P> = Simulator<EndDevice<P>>;

/// LoRaWAN device error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Payload cannot be framed
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    /// Operation needs a Class B device
    #[error("device runs in {0:?}, not Class B")]
    NotClassB(OperatingMode),
}

/// Result of handing a packet to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Transmission started now
    Accepted(PacketId),
    /// Transmission postponed by `delay`
    Deferred {
        /// Packet identifier
        id: PacketId,
        /// Delay before the next attempt to send it
        delay: Duration,
    },
}

impl Submission {
    /// Identifier of the submitted packet
    pub fn id(&self) -> PacketId {
        match *self {
            Submission::Accepted(id) | Submission::Deferred { id, .. } => id,
        }
    }
}

/// Transmission about to be attempted
enum Attempt {
    /// First transmission of an application packet
    New(Uplink),
    /// Retransmission of the packet in flight
    Retry,
}

type CompletionHandler = Box<dyn FnMut(&TxOutcome)>;
type DownlinkHandler = Box<dyn FnMut(&DataFrame)>;

/// LoRaWAN end-device
pub struct EndDevice<P: Phy> {
    /// Current operating mode
    mode: OperatingMode,
    radio: RadioSupervisor<P>,
    windows: WindowEngine,
    mac: MacLayer,
    /// Class B state, present in Class B mode
    class_b: Option<ClassB>,
    channels: Box<dyn ChannelPlan>,
    on_completion: Option<CompletionHandler>,
    on_downlink: Option<DownlinkHandler>,
}

impl<P: Phy + 'static> EndDevice<P> {
    /// Create a device on the default EU868 channel plan
    pub fn new(phy: P, config: DeviceConfig) -> Result<Self, DeviceError> {
        config.validate()?;
        let class_b = config.mode.is_class_b().then(|| ClassB::new(&config));
        info!("end-device {} created", config.address);
        Ok(Self {
            mode: config.mode,
            radio: RadioSupervisor::new(phy),
            windows: WindowEngine::new(config.phy),
            mac: MacLayer::new(&config),
            class_b,
            channels: Box::new(DutyCycleHelper::eu868()),
            on_completion: None,
            on_downlink: None,
        })
    }

    /// Replace the channel plan
    pub fn with_channel_plan<C: ChannelPlan + 'static>(mut self, plan: C) -> Self {
        self.channels = Box::new(plan);
        self
    }

    /// Register the consumer of packet outcomes
    pub fn set_completion_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&TxOutcome) + 'static,
    {
        self.on_completion = Some(Box::new(handler));
    }

    /// Register the consumer of downlinks addressed to this device
    pub fn set_downlink_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&DataFrame) + 'static,
    {
        self.on_downlink = Some(Box::new(handler));
    }

    /// Register the consumer of radio state changes
    pub fn set_radio_observer<F>(&mut self, observer: F)
    where
        F: FnMut(RadioState, RadioState) + 'static,
    {
        self.radio.set_observer(observer);
    }

    /// Get current operating mode
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Device address
    pub fn address(&self) -> DevAddr {
        self.mac.address()
    }

    /// Current radio state
    pub fn radio_state(&self) -> RadioState {
        self.radio.state()
    }

    /// Radio supervisor
    pub fn radio(&self) -> &RadioSupervisor<P> {
        &self.radio
    }

    /// Physical layer
    pub fn phy(&self) -> &P {
        self.radio.phy()
    }

    /// Mutable physical layer
    pub fn phy_mut(&mut self) -> &mut P {
        self.radio.phy_mut()
    }

    /// MAC state
    pub fn mac(&self) -> &MacLayer {
        &self.mac
    }

    /// Receive window engine
    pub fn windows(&self) -> &WindowEngine {
        &self.windows
    }

    /// Class B state
    pub fn class_b(&self) -> Option<&ClassB> {
        self.class_b.as_ref()
    }

    /// Start Class B operation: search for the beacon from the next epoch on
    pub fn start(&mut self, sim: &mut DeviceSim<P>) -> Result<(), DeviceError> {
        let class_b = self
            .class_b
            .as_mut()
            .ok_or(DeviceError::NotClassB(self.mode))?;
        class_b.start();
        let delay = time_until_next_beacon(sim.now());
        self.windows
            .schedule_beacon_window(sim, delay, |d: &mut Self, s| d.open_beacon_window(s));
        Ok(())
    }

    /// Hand an application payload to the device
    pub fn submit(
        &mut self,
        sim: &mut DeviceSim<P>,
        f_port: u8,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Submission, DeviceError> {
        let packet = self.mac.new_uplink(f_port, payload.into())?;
        let id = packet.id;
        let postponed = match self.blocking_delay(sim) {
            Some(delay) => {
                self.defer(sim, packet, delay);
                Some(delay)
            }
            None => self.transmit(sim, Attempt::New(packet)),
        };
        Ok(match postponed {
            Some(delay) => Submission::Deferred { id, delay },
            None => Submission::Accepted(id),
        })
    }

    /// Delay before a transmission may start, at least `proposed`
    pub fn next_transmission_delay(&mut self, sim: &DeviceSim<P>, proposed: Duration) -> Duration {
        self.mac.next_transmission_delay(&self.windows, sim, proposed)
    }

    /// Physical layer locked on a preamble
    pub fn on_preamble_detected(&mut self) -> bool {
        self.radio.on_preamble_detected()
    }

    /// Physical layer delivered a frame
    pub fn on_receive_complete(&mut self, sim: &mut DeviceSim<P>, frame: &Frame) {
        match self.mac.classify(frame) {
            FrameClass::ForUs(data) => {
                info!("downlink received, FCnt {}", data.header.f_cnt);
                self.windows.cancel_second_window(sim);
                self.mac.on_downlink(&data, self.windows.config_mut());
                if let Some(handler) = self.on_downlink.as_mut() {
                    handler(&data);
                }
                self.complete(true);
            }
            FrameClass::Beacon(tag) => self.on_beacon(sim, tag),
            FrameClass::Broadcast(_) => info!("broadcast frame ignored"),
            FrameClass::ForOther(addr) => {
                debug!("frame for {} ignored", addr);
                self.retry_after_second_window(sim);
            }
            FrameClass::Uplink => {
                debug!("uplink frame ignored");
                self.retry_after_second_window(sim);
            }
            FrameClass::Malformed(err) => {
                warn!("malformed frame: {}", err);
                self.retry_after_second_window(sim);
            }
        }
        // leaving RX is always allowed
        let _ = self.radio.request_sleep();
    }

    /// Physical layer gave up on a frame
    pub fn on_receive_failed(&mut self, sim: &mut DeviceSim<P>) {
        debug!("reception failed");
        let _ = self.radio.request_sleep();
        self.retry_after_second_window(sim);
    }

    /// `Some(delay)` if a new packet may not go out right now
    fn blocking_delay(&mut self, sim: &DeviceSim<P>) -> Option<Duration> {
        let waiting = self
            .channels
            .waiting_time(sim.now())
            .unwrap_or(Duration::ZERO);
        let delay = self.next_transmission_delay(sim, waiting);
        if delay.is_zero() && !self.windows.uplink_windows_pending(sim) {
            None
        } else {
            Some(delay)
        }
    }

    fn defer(&mut self, sim: &mut DeviceSim<P>, packet: Uplink, delay: Duration) {
        info!(
            "packet {} deferred by {} ms",
            packet.id,
            delay.as_millis() as u64
        );
        if let Some(dropped) = self.mac.set_deferred(packet) {
            warn!("deferred packet {} replaced", dropped.id);
        }
        self.mac
            .timers
            .deferred
            .arm(sim, delay, |d: &mut Self, s| d.send_deferred(s));
    }

    fn send_deferred(&mut self, sim: &mut DeviceSim<P>) {
        let Some(packet) = self.mac.take_deferred() else {
            return;
        };
        match self.blocking_delay(sim) {
            Some(delay) => self.defer(sim, packet, delay),
            None => {
                self.transmit(sim, Attempt::New(packet));
            }
        }
    }

    /// Send now, or postpone. Returns the postponement.
    fn transmit(&mut self, sim: &mut DeviceSim<P>, attempt: Attempt) -> Option<Duration> {
        let now = sim.now();
        if self.radio.is_busy() {
            let delay = self.mac.ack_timeout();
            debug!("radio in {}, transmission postponed", self.radio.state());
            self.postpone(sim, attempt, delay);
            return Some(delay);
        }
        let channel = match self.channels.select_channel(now, self.mac.rng()) {
            Some(channel) => channel,
            None => match self.channels.waiting_time(now) {
                Some(wait) if !wait.is_zero() => {
                    debug!("duty cycle, transmission postponed");
                    self.postpone(sim, attempt, wait);
                    return Some(wait);
                }
                _ => {
                    error!("no uplink channel available");
                    self.abandon(now, attempt);
                    return None;
                }
            },
        };

        match attempt {
            Attempt::New(packet) => {
                if let Some(outcome) = self.mac.begin(packet, now) {
                    self.mac.timers.retry.cancel(sim);
                    self.notify(&outcome);
                }
            }
            Attempt::Retry => {
                if !self.mac.consume_retry() {
                    return None;
                }
            }
        }
        self.mac.apply_adr_backoff();

        let params = self.mac.tx_params();
        let frame = self.mac.current_frame()?.clone();
        match self
            .radio
            .request_transmit(&frame, &params, channel.frequency, self.mac.tx_power())
        {
            Ok(airtime) => {
                self.channels.register_transmission(now, airtime, &channel);
                self.windows
                    .on_transmit_start(sim, now + airtime, channel.frequency, self.mac.data_rate());
                self.mac
                    .timers
                    .tx_done
                    .arm(sim, airtime, |d: &mut Self, s| d.on_transmit_complete(s));
                if let Some(r) = self.mac.retransmission() {
                    info!(
                        "packet {} transmission {} on {} Hz DR{}",
                        r.packet.id,
                        r.attempts_used(),
                        channel.frequency,
                        self.mac.data_rate().index()
                    );
                }
            }
            Err(err) => error!("transmission refused: {}", err),
        }
        None
    }

    fn postpone(&mut self, sim: &mut DeviceSim<P>, attempt: Attempt, delay: Duration) {
        match attempt {
            Attempt::New(packet) => self.defer(sim, packet, delay),
            Attempt::Retry => {
                self.mac
                    .timers
                    .retry
                    .arm(sim, delay, |d: &mut Self, s| d.fire_retry(s));
            }
        }
    }

    fn abandon(&mut self, now: crate::sim::SimTime, attempt: Attempt) {
        match attempt {
            Attempt::New(packet) => {
                let outcome = TxOutcome {
                    attempts: 0,
                    success: false,
                    first_attempt: now,
                    packet,
                };
                self.notify(&outcome);
            }
            Attempt::Retry => self.complete(false),
        }
    }

    fn on_transmit_complete(&mut self, sim: &mut DeviceSim<P>) {
        self.radio.on_transmit_finished();
        let _ = self.radio.request_sleep();
        self.windows.schedule_receive_windows(
            sim,
            |d: &mut Self, s| d.open_first_window(s),
            |d: &mut Self, s| d.open_second_window(s),
        );
    }

    fn open_first_window(&mut self, sim: &mut DeviceSim<P>) {
        let params = self.windows.rx1_params();
        self.windows.open(
            WindowKind::Rx1,
            params,
            &mut self.radio,
            sim,
            |d: &mut Self, _| d.close_first_window(),
        );
    }

    fn close_first_window(&mut self) {
        self.windows.close(WindowKind::Rx1, &mut self.radio);
        if self.mac.retransmission().is_some() {
            self.mac.set_phase(UplinkPhase::AwaitingSecondWindow);
        }
    }

    fn open_second_window(&mut self, sim: &mut DeviceSim<P>) {
        // RX1 may still be open and never close
        if self.mac.retransmission().is_some() {
            self.mac.set_phase(UplinkPhase::AwaitingSecondWindow);
        }
        let params = self.windows.rx2_params();
        self.windows.open(
            WindowKind::Rx2,
            params,
            &mut self.radio,
            sim,
            |d: &mut Self, s| d.close_second_window(s),
        );
    }

    fn close_second_window(&mut self, sim: &mut DeviceSim<P>) {
        if self.windows.close(WindowKind::Rx2, &mut self.radio) == WindowClose::Receiving {
            return;
        }
        match self.mac.retransmission().map(|r| r.waiting_for_ack) {
            Some(true) => self.retry_or_fail(sim),
            Some(false) => self.complete(true),
            None => {}
        }
    }

    /// A reception ended without an acknowledgement for us. Nothing is
    /// decided before RX2 of the last attempt has opened.
    fn retry_after_second_window(&mut self, sim: &mut DeviceSim<P>) {
        if !self.windows.second_window_expired(sim) {
            return;
        }
        match self.mac.retransmission().map(|r| r.waiting_for_ack) {
            Some(true) => self.retry_or_fail(sim),
            // the RX2 close already saw this reception in progress
            Some(false) if !self.windows.timers().second_close.is_pending(sim) => {
                self.complete(true)
            }
            _ => {}
        }
    }

    fn retry_or_fail(&mut self, sim: &mut DeviceSim<P>) {
        if self.mac.attempts_remaining().unwrap_or(0) > 0 {
            self.schedule_retry(sim);
        } else {
            warn!("no acknowledgement, giving up");
            self.complete(false);
        }
    }

    fn schedule_retry(&mut self, sim: &mut DeviceSim<P>) {
        let waiting = self
            .channels
            .waiting_time(sim.now())
            .unwrap_or(Duration::ZERO);
        let delay = self.next_transmission_delay(sim, waiting);
        self.mac
            .timers
            .retry
            .arm(sim, delay, |d: &mut Self, s| d.fire_retry(s));
        self.mac.set_phase(UplinkPhase::WaitingAckRetry);
        debug!("retransmission in {} ms", delay.as_millis() as u64);
    }

    fn fire_retry(&mut self, sim: &mut DeviceSim<P>) {
        if self.mac.waiting_for_ack() {
            self.transmit(sim, Attempt::Retry);
        }
    }

    fn complete(&mut self, success: bool) {
        if let Some(outcome) = self.mac.finish(success) {
            info!(
                "packet {} done after {} transmissions, success {}",
                outcome.packet.id, outcome.attempts, outcome.success
            );
            self.notify(&outcome);
        }
    }

    fn notify(&mut self, outcome: &TxOutcome) {
        if let Some(handler) = self.on_completion.as_mut() {
            handler(outcome);
        }
    }

    fn open_beacon_window(&mut self, sim: &mut DeviceSim<P>) {
        let Some(class_b) = self.class_b.as_mut() else {
            return;
        };
        class_b.on_beacon_window();
        let params = class_b.beacon_window();
        self.windows.open(
            WindowKind::Beacon,
            params,
            &mut self.radio,
            sim,
            |d: &mut Self, _| d.close_beacon_window(),
        );
        let delay = time_until_next_beacon(sim.now());
        self.windows
            .schedule_beacon_window(sim, delay, |d: &mut Self, s| d.open_beacon_window(s));
    }

    fn close_beacon_window(&mut self) {
        self.windows.close(WindowKind::Beacon, &mut self.radio);
    }

    fn on_beacon(&mut self, sim: &mut DeviceSim<P>, tag: BeaconTag) {
        let Some(class_b) = self.class_b.as_mut() else {
            debug!("beacon ignored outside Class B");
            return;
        };
        let offsets = class_b.on_beacon(tag, sim.now());
        self.windows
            .schedule_ping_slots(sim, &offsets, |d: &mut Self, s| d.open_ping_slot(s));
    }

    fn open_ping_slot(&mut self, sim: &mut DeviceSim<P>) {
        let Some(class_b) = self.class_b.as_ref() else {
            return;
        };
        let params = class_b.ping_slot_window();
        self.windows.open(
            WindowKind::PingSlot,
            params,
            &mut self.radio,
            sim,
            |d: &mut Self, _| d.close_ping_slot(),
        );
    }

    fn close_ping_slot(&mut self) {
        self.windows.close(WindowKind::PingSlot, &mut self.radio);
    }
}
