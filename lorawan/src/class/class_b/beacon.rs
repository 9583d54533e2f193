//! LoRaWAN Class B Beacon Tracking
//!
//! This module handles beacon synchronization and tracking including:
//! - The beacon tag carried by gateway broadcasts
//! - Beacon acquisition and synchronization
//! - Beacon loss detection

use core::time::Duration;

use crate::sim::SimTime;

/// Maximum beacons missed in a row before declaring loss
pub const MAX_BEACON_MISSED: u8 = 3;

/// Size of an encoded beacon tag
pub const BEACON_TAG_LEN: usize = 4;

/// Marker carried by a beacon frame: the beacon time in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BeaconTag {
    time: u32,
}

impl BeaconTag {
    /// Tag for a beacon sent at `time` seconds
    pub const fn new(time: u32) -> Self {
        Self { time }
    }

    /// Tag stamped with the whole seconds of `now`
    pub fn at(now: SimTime) -> Self {
        Self::new(now.since_start().as_secs() as u32)
    }

    /// Beacon time in seconds
    pub fn time(&self) -> u32 {
        self.time
    }

    /// Wire form, little-endian
    pub fn to_bytes(self) -> [u8; BEACON_TAG_LEN] {
        self.time.to_le_bytes()
    }

    /// Tag from its wire form
    pub fn from_bytes(bytes: [u8; BEACON_TAG_LEN]) -> Self {
        Self::new(u32::from_le_bytes(bytes))
    }
}

/// Beacon tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeaconState {
    /// Not tracking beacons
    Idle,
    /// Searching for initial beacon
    Searching,
    /// Synchronized with network beacons
    Synchronized,
    /// Lost beacon synchronization
    Lost,
}

/// Beacon tracking information
#[derive(Debug, Clone)]
pub struct BeaconTracker {
    /// Current beacon state
    state: BeaconState,
    /// Time of last received beacon
    last_beacon_time: Option<SimTime>,
    /// Tag of last received beacon
    last_beacon: Option<BeaconTag>,
    /// Number of consecutive missed beacons
    missed_beacons: u8,
    /// A beacon window opened and no beacon arrived yet
    window_pending: bool,
    /// Beacons received since start
    received: u32,
}

impl Default for BeaconTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconTracker {
    /// Create new beacon tracker
    pub fn new() -> Self {
        Self {
            state: BeaconState::Idle,
            last_beacon_time: None,
            last_beacon: None,
            missed_beacons: 0,
            window_pending: false,
            received: 0,
        }
    }

    /// Start beacon acquisition
    pub fn start_acquisition(&mut self) {
        if self.state == BeaconState::Idle {
            self.state = BeaconState::Searching;
            info!("searching for beacon");
        }
    }

    /// Account for a beacon window opening at an epoch.
    ///
    /// If the previous window ended without a beacon it counts as missed.
    pub fn on_window_open(&mut self) {
        if self.window_pending {
            self.on_beacon_missed();
        }
        self.window_pending = true;
    }

    /// Record a received beacon
    pub fn on_beacon(&mut self, tag: BeaconTag, now: SimTime) {
        if self.state != BeaconState::Synchronized {
            info!("beacon synchronized at {}", now);
        }
        self.state = BeaconState::Synchronized;
        self.last_beacon_time = Some(now);
        self.last_beacon = Some(tag);
        self.missed_beacons = 0;
        self.window_pending = false;
        self.received = self.received.saturating_add(1);
    }

    fn on_beacon_missed(&mut self) {
        self.missed_beacons = self.missed_beacons.saturating_add(1);
        warn!("beacon missed ({} in a row)", self.missed_beacons);
        if self.state == BeaconState::Synchronized && self.missed_beacons >= MAX_BEACON_MISSED {
            warn!("beacon lost after {} missed beacons", self.missed_beacons);
            self.state = BeaconState::Lost;
        }
    }

    /// Get current beacon state
    pub fn state(&self) -> BeaconState {
        self.state
    }

    /// Check if beacon is synchronized
    pub fn is_synchronized(&self) -> bool {
        self.state == BeaconState::Synchronized
    }

    /// Get last beacon time
    pub fn last_beacon_time(&self) -> Option<SimTime> {
        self.last_beacon_time
    }

    /// Get last beacon tag
    pub fn last_beacon(&self) -> Option<BeaconTag> {
        self.last_beacon
    }

    /// Consecutive beacons missed
    pub fn missed_beacons(&self) -> u8 {
        self.missed_beacons
    }

    /// Beacons received since start
    pub fn beacons_received(&self) -> u32 {
        self.received
    }

    /// Time since the last beacon
    pub fn time_since_beacon(&self, now: SimTime) -> Option<Duration> {
        self.last_beacon_time
            .map(|t| now.saturating_duration_since(t))
    }
}
