//! LoRaWAN Class B Implementation
//!
//! This module implements LoRaWAN Class B functionality including:
//! - Beacon synchronization and tracking
//! - Ping slot timing
//! - The beacon time grid and gateway beacon broadcasts
//! - Beacon loss detection

pub mod beacon;
pub mod ping_slot;
pub mod timing;

use crate::config::device::DeviceConfig;
use crate::lorawan::phy::ReceiveWindowParams;
use crate::sim::SimTime;

use self::{
    beacon::{BeaconState, BeaconTag, BeaconTracker},
    ping_slot::{ping_slot_offsets, PingSlotConfig, PingSlotOffsets},
};

/// Class B state of an end-device
#[derive(Debug, Clone)]
pub struct ClassB {
    /// Beacon tracking state
    beacon_tracker: BeaconTracker,
    /// Ping slot configuration
    ping_slot_config: PingSlotConfig,
    /// Beacon window parameters
    beacon_window: ReceiveWindowParams,
}

impl ClassB {
    /// Create new Class B state
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            beacon_tracker: BeaconTracker::new(),
            ping_slot_config: config.ping_slot,
            beacon_window: config.beacon,
        }
    }

    /// Start Class B operation
    pub fn start(&mut self) {
        self.beacon_tracker.start_acquisition();
    }

    /// Configure ping slot periodicity; applies from the next beacon on
    pub fn configure_ping_slots(&mut self, periodicity: u8) {
        self.ping_slot_config.set_periodicity(periodicity);
    }

    /// A beacon window opens
    pub fn on_beacon_window(&mut self) {
        self.beacon_tracker.on_window_open();
    }

    /// Record a beacon and return the ping slot offsets it anchors
    pub fn on_beacon(&mut self, tag: BeaconTag, now: SimTime) -> PingSlotOffsets {
        self.beacon_tracker.on_beacon(tag, now);
        ping_slot_offsets(self.ping_slot_config.periodicity())
    }

    /// Receive parameters of a ping slot
    pub fn ping_slot_window(&self) -> ReceiveWindowParams {
        self.ping_slot_config.window_params()
    }

    /// Receive parameters of the beacon window
    pub fn beacon_window(&self) -> ReceiveWindowParams {
        self.beacon_window
    }

    /// Ping slot configuration
    pub fn ping_slot_config(&self) -> &PingSlotConfig {
        &self.ping_slot_config
    }

    /// Beacon tracker
    pub fn beacon_tracker(&self) -> &BeaconTracker {
        &self.beacon_tracker
    }

    /// Current beacon state
    pub fn beacon_state(&self) -> BeaconState {
        self.beacon_tracker.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_anchors_ping_slots() {
        let config = DeviceConfig::default();
        let mut class_b = ClassB::new(&config);
        class_b.start();
        assert_eq!(class_b.beacon_state(), BeaconState::Searching);

        class_b.configure_ping_slots(4);
        class_b.on_beacon_window();
        let offsets = class_b.on_beacon(BeaconTag::new(128), SimTime::from_secs(128));
        assert_eq!(offsets.len(), 8);
        assert_eq!(class_b.beacon_state(), BeaconState::Synchronized);
        assert_eq!(class_b.ping_slot_window().frequency, config.ping_slot.frequency());
    }
}
