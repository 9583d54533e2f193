//! Receive window timing
//!
//! Opens and closes the four kinds of receive window on the virtual clock:
//! - RX1 and RX2, a fixed delay after the end of every uplink
//! - Ping slots, anchored on the last beacon (Class B)
//! - The beacon window, on every beacon epoch (Class B)
//!
//! One window owns the receiver at a time. RX1 and RX2 take the receiver
//! from a ping slot or the beacon window, and RX2 also from an RX1 still
//! open; the beacon window takes it from a ping slot. A window that would overlap an owner it cannot preempt, or
//! that opens while the radio transmits or receives, is skipped.

use core::fmt;
use core::time::Duration;

use heapless::Vec;

use super::phy::{PhyConfig, ReceiveWindowParams};
use super::region::DataRate;
use crate::class::class_b::ping_slot::MAX_PING_SLOTS;
use crate::radio::{Phy, RadioState, RadioSupervisor};
use crate::sim::{EventId, SimTime, Simulator, TimerHandle};

/// Kind of receive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WindowKind {
    /// First receive window after an uplink
    Rx1,
    /// Second receive window after an uplink
    Rx2,
    /// Class B ping slot
    PingSlot,
    /// Class B beacon window
    Beacon,
}

impl WindowKind {
    fn is_uplink_window(self) -> bool {
        matches!(self, WindowKind::Rx1 | WindowKind::Rx2)
    }

    /// Whether a window of this kind may take the receiver from `owner`
    fn preempts(self, owner: WindowKind) -> bool {
        match (self, owner) {
            (WindowKind::Rx1, _) => !owner.is_uplink_window(),
            // the retry decision hangs on the RX2 close
            (WindowKind::Rx2, _) => owner != WindowKind::Rx2,
            (WindowKind::Beacon, WindowKind::PingSlot) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WindowKind::Rx1 => "RX1",
            WindowKind::Rx2 => "RX2",
            WindowKind::PingSlot => "ping slot",
            WindowKind::Beacon => "beacon",
        };
        f.write_str(name)
    }
}

/// What a window found when its close timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WindowClose {
    /// Nothing was heard; the radio went back to sleep
    NothingHeard,
    /// A frame is being received; reception will finish on its own
    Receiving,
    /// The radio was already asleep (a frame was handled earlier)
    AlreadyHandled,
}

impl fmt::Display for WindowClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WindowClose::NothingHeard => "nothing heard",
            WindowClose::Receiving => "receiving",
            WindowClose::AlreadyHandled => "already handled",
        })
    }
}

/// Timer slots owned by the engine
#[derive(Debug, Clone, Default)]
pub struct WindowTimers {
    /// RX1 open
    pub first_open: TimerHandle,
    /// RX1 close
    pub first_close: TimerHandle,
    /// RX2 open
    pub second_open: TimerHandle,
    /// RX2 close
    pub second_close: TimerHandle,
    /// Close of the current ping slot
    pub ping_slot_close: TimerHandle,
    /// Next beacon window open
    pub beacon_open: TimerHandle,
    /// Beacon window close
    pub beacon_close: TimerHandle,
    /// Ping slot opens since the last beacon
    pub ping_slots: Vec<EventId, MAX_PING_SLOTS>,
}

/// Receive window timing engine
#[derive(Debug, Clone)]
pub struct WindowEngine {
    config: PhyConfig,
    timers: WindowTimers,
    active: Option<WindowKind>,
    tx_frequency: u32,
    uplink_data_rate: DataRate,
    second_window_open_at: Option<SimTime>,
    second_window_close_at: Option<SimTime>,
}

impl WindowEngine {
    /// Engine with the given receive configuration
    pub fn new(config: PhyConfig) -> Self {
        Self {
            config,
            timers: WindowTimers::default(),
            active: None,
            tx_frequency: 0,
            uplink_data_rate: DataRate::DR0,
            second_window_open_at: None,
            second_window_close_at: None,
        }
    }

    /// Receive configuration
    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    /// Mutable receive configuration, rewritten by MAC commands
    pub fn config_mut(&mut self) -> &mut PhyConfig {
        &mut self.config
    }

    /// Timer slots
    pub fn timers(&self) -> &WindowTimers {
        &self.timers
    }

    /// Window currently owning the receiver
    pub fn active(&self) -> Option<WindowKind> {
        self.active
    }

    /// RX1 parameters for the last uplink
    pub fn rx1_params(&self) -> ReceiveWindowParams {
        self.config
            .rx1_window(self.tx_frequency, self.uplink_data_rate)
    }

    /// RX2 parameters for the last uplink
    pub fn rx2_params(&self) -> ReceiveWindowParams {
        self.config
            .rx2_window(self.tx_frequency, self.uplink_data_rate)
    }

    /// Expected RX2 open time of the last uplink
    pub fn second_window_open_time(&self) -> Option<SimTime> {
        self.second_window_open_at
    }

    /// Expected RX2 close time of the last uplink
    pub fn second_window_close_time(&self) -> Option<SimTime> {
        self.second_window_close_at
    }

    /// Whether RX2 of the last uplink already opened, was skipped or
    /// cancelled
    pub fn second_window_expired<C>(&self, sim: &Simulator<C>) -> bool {
        self.timers.second_open.is_expired(sim)
    }

    /// End of the receive windows of the last uplink, while any of them is
    /// still ahead. Covers the transmission itself, before the windows are
    /// armed.
    pub fn uplink_windows_end<C>(&self, sim: &Simulator<C>) -> Option<SimTime> {
        let timers = &self.timers;
        if timers.second_open.is_pending(sim) || timers.second_close.is_pending(sim) {
            return self.second_window_close_at;
        }
        if timers.first_close.is_pending(sim) {
            return timers.first_close.scheduled_at();
        }
        if timers.first_open.is_pending(sim) {
            let duration = self.rx1_params().duration();
            return timers.first_open.scheduled_at().map(|open| open + duration);
        }
        self.second_window_close_at.filter(|&close| close > sim.now())
    }

    /// Whether any RX1/RX2 open or close timer is still waiting
    pub fn uplink_windows_pending<C>(&self, sim: &Simulator<C>) -> bool {
        [
            &self.timers.first_open,
            &self.timers.first_close,
            &self.timers.second_open,
            &self.timers.second_close,
        ]
        .iter()
        .any(|t| t.is_pending(sim))
    }

    /// An uplink is handed to the radio and ends at `tx_end`.
    ///
    /// Cancels every window left from earlier and records where the RX2 of
    /// this uplink will fall.
    pub fn on_transmit_start<C>(
        &mut self,
        sim: &mut Simulator<C>,
        tx_end: SimTime,
        tx_frequency: u32,
        data_rate: DataRate,
    ) {
        for timer in [
            &self.timers.first_open,
            &self.timers.first_close,
            &self.timers.second_open,
            &self.timers.second_close,
            &self.timers.ping_slot_close,
            &self.timers.beacon_close,
        ] {
            timer.cancel(sim);
        }
        self.active = None;
        self.tx_frequency = tx_frequency;
        self.uplink_data_rate = data_rate;
        self.record_second_window(tx_end);
    }

    fn record_second_window(&mut self, tx_end: SimTime) {
        let open = tx_end + self.config.timing.rx2_delay;
        self.second_window_open_at = Some(open);
        self.second_window_close_at = Some(open + self.rx2_params().duration());
    }

    /// Transmission finished: arm RX1 and RX2 relative to now
    pub fn schedule_receive_windows<C, F1, F2>(
        &mut self,
        sim: &mut Simulator<C>,
        open_first: F1,
        open_second: F2,
    ) where
        F1: FnOnce(&mut C, &mut Simulator<C>) + 'static,
        F2: FnOnce(&mut C, &mut Simulator<C>) + 'static,
    {
        let timing = self.config.timing;
        self.timers
            .first_open
            .arm(sim, timing.rx1_delay, open_first);
        self.timers
            .second_open
            .arm(sim, timing.rx2_delay, open_second);
        self.record_second_window(sim.now());
    }

    /// A frame for this device arrived: RX2 is no longer needed
    pub fn cancel_second_window<C>(&mut self, sim: &mut Simulator<C>) {
        if self.timers.second_open.cancel(sim) {
            self.second_window_close_at = None;
            debug!("RX2 cancelled");
        }
    }

    /// Arm the beacon window open timer
    pub fn schedule_beacon_window<C, F>(&mut self, sim: &mut Simulator<C>, delay: Duration, open: F)
    where
        F: FnOnce(&mut C, &mut Simulator<C>) + 'static,
    {
        self.timers.beacon_open.arm(sim, delay, open);
    }

    /// Replace the ping slot schedule with one slot per offset from now
    pub fn schedule_ping_slots<C, F>(&mut self, sim: &mut Simulator<C>, offsets: &[Duration], open: F)
    where
        F: FnOnce(&mut C, &mut Simulator<C>) + Clone + 'static,
    {
        self.cancel_ping_slots(sim);
        for &offset in offsets {
            let id = sim.schedule(offset, open.clone());
            if self.timers.ping_slots.push(id).is_err() {
                sim.cancel(id);
                warn!("ping slot table full");
                break;
            }
        }
        debug!("{} ping slots scheduled", self.timers.ping_slots.len());
    }

    /// Cancel every scheduled ping slot
    pub fn cancel_ping_slots<C>(&mut self, sim: &mut Simulator<C>) {
        for &id in self.timers.ping_slots.iter() {
            sim.cancel(id);
        }
        self.timers.ping_slots.clear();
    }

    /// Ping slots still waiting to open
    pub fn pending_ping_slots<C>(&self, sim: &Simulator<C>) -> usize {
        self.timers
            .ping_slots
            .iter()
            .filter(|&&id| sim.is_pending(id))
            .count()
    }

    /// Open a window and arm its close timer. Returns whether it opened.
    pub fn open<P, C, F>(
        &mut self,
        kind: WindowKind,
        params: ReceiveWindowParams,
        radio: &mut RadioSupervisor<P>,
        sim: &mut Simulator<C>,
        close: F,
    ) -> bool
    where
        P: Phy,
        F: FnOnce(&mut C, &mut Simulator<C>) + 'static,
    {
        if radio.is_busy() {
            debug!("{} skipped, radio in {}", kind, radio.state());
            return false;
        }
        if let Some(owner) = self.active {
            if !kind.preempts(owner) {
                debug!("{} skipped, {} window open", kind, owner);
                return false;
            }
            debug!("{} preempts {} window", kind, owner);
            self.close_timer(owner).cancel(sim);
        }
        if let Err(err) = radio.request_standby() {
            warn!("{} not opened: {}", kind, err);
            return false;
        }
        radio.tune(params.frequency, params.data_rate.spreading_factor());
        self.close_timer(kind).arm(sim, params.duration(), close);
        self.active = Some(kind);
        debug!(
            "{} open on {} Hz DR{} for {} us",
            kind,
            params.frequency,
            params.data_rate.index(),
            params.duration().as_micros() as u64
        );
        true
    }

    /// Close a window.
    ///
    /// # Panics
    ///
    /// Panics if the radio is transmitting: every uplink cancels the
    /// windows still armed, so a close firing during TX is a timing fault.
    pub fn close<P: Phy>(&mut self, kind: WindowKind, radio: &mut RadioSupervisor<P>) -> WindowClose {
        if self.active == Some(kind) {
            self.active = None;
        }
        let outcome = match radio.state() {
            RadioState::Tx => panic!("{} window closing while the radio transmits", kind),
            RadioState::Rx => WindowClose::Receiving,
            RadioState::Sleep => WindowClose::AlreadyHandled,
            RadioState::Standby => {
                // sleep from standby cannot be refused
                let _ = radio.request_sleep();
                WindowClose::NothingHeard
            }
        };
        debug!("{} closed: {}", kind, outcome);
        outcome
    }

    fn close_timer(&mut self, kind: WindowKind) -> &mut TimerHandle {
        match kind {
            WindowKind::Rx1 => &mut self.timers.first_close,
            WindowKind::Rx2 => &mut self.timers.second_close,
            WindowKind::PingSlot => &mut self.timers.ping_slot_close,
            WindowKind::Beacon => &mut self.timers.beacon_close,
        }
    }
}
