//! LoRaWAN Class B Ping Slot Management
//!
//! This module handles ping slot timing including:
//! - Ping slot configuration (periodicity, channel, window length)
//! - Slot offsets within one beacon period

use core::cmp::min;
use core::time::Duration;

use heapless::Vec;

use super::timing::BEACON_PERIOD;
use crate::lorawan::phy::{ReceiveWindowParams, DEFAULT_WINDOW_SYMBOLS};
use crate::lorawan::region::{self, DataRate};

/// Largest ping slot periodicity exponent
pub const MAX_PERIODICITY: u8 = 7;

/// Maximum number of ping slots per beacon period (periodicity 0)
pub const MAX_PING_SLOTS: usize = 133;

/// Ping period at periodicity 0
pub const BASE_PING_PERIOD: Duration = Duration::from_millis(960);

/// Slot offsets after a beacon
pub type PingSlotOffsets = Vec<Duration, MAX_PING_SLOTS>;

/// Ping slot configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PingSlotConfig {
    /// Ping slot periodicity (0-7)
    periodicity: u8,
    /// Data rate for ping slots
    data_rate: DataRate,
    /// Frequency for ping slots
    frequency: u32,
    /// Window length in symbols
    duration_symbols: u16,
}

impl PingSlotConfig {
    /// Create new ping slot configuration
    pub fn new(periodicity: u8, data_rate: DataRate, frequency: u32) -> Self {
        Self {
            periodicity: min(periodicity, MAX_PERIODICITY),
            data_rate,
            frequency,
            duration_symbols: DEFAULT_WINDOW_SYMBOLS,
        }
    }

    /// Set ping slot periodicity
    pub fn set_periodicity(&mut self, periodicity: u8) {
        self.periodicity = min(periodicity, MAX_PERIODICITY);
    }

    /// Set the window length in symbols
    pub fn with_duration_symbols(mut self, symbols: u16) -> Self {
        self.duration_symbols = symbols;
        self
    }

    /// Get ping slot periodicity
    pub fn periodicity(&self) -> u8 {
        self.periodicity
    }

    /// Get ping slot data rate
    pub fn data_rate(&self) -> DataRate {
        self.data_rate
    }

    /// Get ping slot frequency
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Get window length in symbols
    pub fn duration_symbols(&self) -> u16 {
        self.duration_symbols
    }

    /// Time between two ping slots: `0.96 s * 2^periodicity`
    pub fn period(&self) -> Duration {
        ping_period(self.periodicity)
    }

    /// Get number of ping slots per beacon period
    pub fn slots_per_beacon(&self) -> usize {
        slot_count(self.periodicity)
    }

    /// Receive parameters of one slot
    pub fn window_params(&self) -> ReceiveWindowParams {
        ReceiveWindowParams::new(self.frequency, self.data_rate, self.duration_symbols)
    }
}

impl Default for PingSlotConfig {
    fn default() -> Self {
        Self::new(
            0,
            region::PING_SLOT_DEFAULT_DATA_RATE,
            region::PING_SLOT_DEFAULT_FREQUENCY,
        )
    }
}

/// Ping period for a periodicity exponent
pub fn ping_period(periodicity: u8) -> Duration {
    BASE_PING_PERIOD * (1u32 << min(periodicity, MAX_PERIODICITY))
}

fn slot_count(periodicity: u8) -> usize {
    (BEACON_PERIOD.as_nanos() / ping_period(periodicity).as_nanos()) as usize
}

/// Offsets `i * period` after a beacon for `i = 1, 2, ...` while the offset
/// stays within one beacon period
pub fn ping_slot_offsets(periodicity: u8) -> PingSlotOffsets {
    let period = ping_period(periodicity);
    let mut offsets = Vec::new();
    let mut offset = period;
    while offset <= BEACON_PERIOD {
        if offsets.push(offset).is_err() {
            break;
        }
        offset += period;
    }
    offsets
}
