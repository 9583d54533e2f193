use core::fmt;
use core::time::Duration;

use crate::lorawan::mac::Frame;

/// Transceiver mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioState {
    /// Lowest power, not listening
    Sleep,
    /// Awake and listening for a preamble
    Standby,
    /// Transmitting a frame
    Tx,
    /// Locked on a preamble, receiving a frame
    Rx,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RadioState::Sleep => "SLEEP",
            RadioState::Standby => "STANDBY",
            RadioState::Tx => "TX",
            RadioState::Rx => "RX",
        };
        f.write_str(name)
    }
}

/// Radio modulation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModulationParams {
    /// Spreading factor (SF7-SF12)
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth: u32,
    /// Coding rate denominator offset (1 = 4/5 ... 4 = 4/8)
    pub coding_rate: u8,
}

/// Parameters handed to the physical layer with every uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxParams {
    /// Modulation parameters
    pub modulation: ModulationParams,
    /// Preamble length in symbols
    pub preamble_symbols: u16,
    /// Implicit header mode
    pub header_disabled: bool,
    /// Payload CRC enabled
    pub crc_enabled: bool,
    /// Low data rate optimisation, required when a symbol lasts over 16 ms
    pub low_data_rate_optimize: bool,
}

impl TxParams {
    /// Explicit-header, CRC-on parameters with an 8-symbol preamble
    pub fn new(modulation: ModulationParams) -> Self {
        let symbol_nanos =
            (1u64 << modulation.spreading_factor) * 1_000_000_000 / u64::from(modulation.bandwidth.max(1));
        Self {
            modulation,
            preamble_symbols: 8,
            header_disabled: false,
            crc_enabled: true,
            low_data_rate_optimize: symbol_nanos > 16_000_000,
        }
    }
}

/// Physical layer consumed by the device core
///
/// Implementations model the transceiver. The device reports state through
/// its [`RadioSupervisor`](super::RadioSupervisor); the physical layer in
/// turn reports preamble detection and reception results back into the
/// device through [`EndDevice`](crate::device::EndDevice) upcalls.
pub trait Phy {
    /// Start transmitting a frame
    fn send(&mut self, frame: &Frame, params: &TxParams, frequency: u32, power: i8);

    /// Time the frame occupies the channel with the given parameters
    fn on_air_time(&self, frame: &Frame, params: &TxParams) -> Duration;

    /// Wake up and listen for a preamble
    fn switch_to_standby(&mut self);

    /// Stop listening
    fn switch_to_sleep(&mut self);

    /// Tune the receiver
    fn set_frequency(&mut self, frequency: u32);

    /// Select the spreading factor to listen for
    fn set_spreading_factor(&mut self, spreading_factor: u8);
}
