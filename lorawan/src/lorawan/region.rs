//! EU868 regional parameters
//!
//! Data rate to modulation mapping, the RX1 reply data rate matrix and the
//! default channels and receive parameters of the EU863-870 band.

use core::time::Duration;

use heapless::Vec;

use crate::radio::traits::ModulationParams;

/// Maximum number of uplink channels tracked by the device
pub const MAX_CHANNELS: usize = 16;

/// Default RX2 frequency in Hz
pub const RX2_DEFAULT_FREQUENCY: u32 = 869_525_000;
/// Default RX2 data rate
pub const RX2_DEFAULT_DATA_RATE: DataRate = DataRate::DR0;
/// Beacon frequency in Hz
pub const BEACON_DEFAULT_FREQUENCY: u32 = 869_525_000;
/// Beacon data rate (SF9/125 kHz)
pub const BEACON_DEFAULT_DATA_RATE: DataRate = DataRate::DR3;
/// Default ping slot frequency in Hz
pub const PING_SLOT_DEFAULT_FREQUENCY: u32 = 869_525_000;
/// Default ping slot data rate
pub const PING_SLOT_DEFAULT_DATA_RATE: DataRate = DataRate::DR3;

/// Highest valid RX1 data rate offset
pub const MAX_RX1_DR_OFFSET: u8 = 5;

const SPREADING_FACTORS: [u8; 7] = [12, 11, 10, 9, 8, 7, 7];
const BANDWIDTHS: [u32; 7] = [125_000, 125_000, 125_000, 125_000, 125_000, 125_000, 250_000];

/// RX1 data rate indexed by `[uplink data rate][rx1 offset]`
const REPLY_DATA_RATES: [[u8; 6]; 8] = [
    [0, 0, 0, 0, 0, 0],
    [1, 0, 0, 0, 0, 0],
    [2, 1, 0, 0, 0, 0],
    [3, 2, 1, 0, 0, 0],
    [4, 3, 2, 1, 0, 0],
    [5, 4, 3, 2, 1, 0],
    [6, 5, 4, 3, 2, 1],
    [7, 6, 5, 4, 3, 2],
];

/// Data rate index
///
/// Indices without a LoRa mapping (DR7 and above in EU868) report a
/// spreading factor and bandwidth of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataRate(u8);

impl DataRate {
    /// SF12 / 125 kHz
    pub const DR0: DataRate = DataRate(0);
    /// SF11 / 125 kHz
    pub const DR1: DataRate = DataRate(1);
    /// SF10 / 125 kHz
    pub const DR2: DataRate = DataRate(2);
    /// SF9 / 125 kHz
    pub const DR3: DataRate = DataRate(3);
    /// SF8 / 125 kHz
    pub const DR4: DataRate = DataRate(4);
    /// SF7 / 125 kHz
    pub const DR5: DataRate = DataRate(5);
    /// SF7 / 250 kHz
    pub const DR6: DataRate = DataRate(6);

    /// Data rate from its index
    pub const fn from_index(index: u8) -> Self {
        Self(index)
    }

    /// Index of the data rate
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Spreading factor, or 0 if the index has no LoRa mapping
    pub fn spreading_factor(self) -> u8 {
        SPREADING_FACTORS.get(usize::from(self.0)).copied().unwrap_or(0)
    }

    /// Bandwidth in Hz, or 0 if the index has no LoRa mapping
    pub fn bandwidth(self) -> u32 {
        BANDWIDTHS.get(usize::from(self.0)).copied().unwrap_or(0)
    }

    /// Whether the index maps to a non-zero spreading factor and bandwidth
    pub fn is_valid(self) -> bool {
        self.spreading_factor() != 0 && self.bandwidth() != 0
    }

    /// Modulation parameters with coding rate 4/5
    pub fn modulation(self) -> ModulationParams {
        ModulationParams {
            spreading_factor: self.spreading_factor(),
            bandwidth: self.bandwidth(),
            coding_rate: 1,
        }
    }

    /// Symbol duration `2^SF / BW`
    pub fn symbol_time(self) -> Option<Duration> {
        if !self.is_valid() {
            return None;
        }
        let nanos = (1u64 << self.spreading_factor()) * 1_000_000_000 / u64::from(self.bandwidth());
        Some(Duration::from_nanos(nanos))
    }

    /// Receive window length for `symbols` symbols; zero for an unmapped
    /// index
    pub fn window_duration(self, symbols: u16) -> Duration {
        self.symbol_time()
            .map_or(Duration::ZERO, |t_sym| t_sym * u32::from(symbols))
    }

    /// Data rate of the RX1 reply to an uplink at this data rate.
    ///
    /// Indices past the matrix saturate to its last row or column.
    pub fn rx1_reply(self, rx1_dr_offset: u8) -> DataRate {
        let row = usize::from(self.0).min(REPLY_DATA_RATES.len() - 1);
        let column = usize::from(rx1_dr_offset).min(usize::from(MAX_RX1_DR_OFFSET));
        DataRate(REPLY_DATA_RATES[row][column])
    }

    /// One step slower, saturating at DR0
    pub fn step_down(self) -> DataRate {
        DataRate(self.0.saturating_sub(1))
    }
}

/// Uplink channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Channel {
    /// Channel frequency in Hz
    pub frequency: u32,
    /// Minimum data rate
    pub min_dr: DataRate,
    /// Maximum data rate
    pub max_dr: DataRate,
    /// Whether the channel is enabled
    pub enabled: bool,
}

impl Channel {
    /// Enabled channel accepting DR0-DR5
    pub const fn new(frequency: u32) -> Self {
        Self {
            frequency,
            min_dr: DataRate::DR0,
            max_dr: DataRate::DR5,
            enabled: true,
        }
    }
}

/// The three mandatory EU868 channels
pub fn default_channels() -> Vec<Channel, MAX_CHANNELS> {
    [868_100_000, 868_300_000, 868_500_000]
        .into_iter()
        .map(Channel::new)
        .collect()
}
