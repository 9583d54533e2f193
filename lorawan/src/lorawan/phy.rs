use core::time::Duration;

use super::region::{self, DataRate};

/// Receive window duration in symbols used by RX1 and RX2
pub const DEFAULT_WINDOW_SYMBOLS: u16 = 8;

/// Receive delays measured from the end of an uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimingParams {
    /// RX1 delay
    pub rx1_delay: Duration,
    /// RX2 delay
    pub rx2_delay: Duration,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            rx1_delay: Duration::from_secs(1),
            rx2_delay: Duration::from_secs(2),
        }
    }
}

impl TimingParams {
    /// Delays carried by an RXTimingSetupReq: 0 and 1 both mean one second,
    /// RX2 always follows RX1 by one second
    pub fn from_delay_setting(delay: u8) -> Self {
        let rx1 = Duration::from_secs(u64::from(delay.max(1)));
        Self {
            rx1_delay: rx1,
            rx2_delay: rx1 + Duration::from_secs(1),
        }
    }
}

/// Frequency, data rate and length of one receive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReceiveWindowParams {
    /// Frequency in Hz
    pub frequency: u32,
    /// Data rate
    pub data_rate: DataRate,
    /// Window length in symbols
    pub duration_symbols: u16,
}

impl ReceiveWindowParams {
    /// Window parameters
    pub const fn new(frequency: u32, data_rate: DataRate, duration_symbols: u16) -> Self {
        Self {
            frequency,
            data_rate,
            duration_symbols,
        }
    }

    /// Time the window stays open: `duration_symbols * 2^SF / BW`
    pub fn duration(&self) -> Duration {
        self.data_rate.window_duration(self.duration_symbols)
    }
}

/// Downlink receive configuration of the device
///
/// RX1 is derived from the uplink on every transmission; RX2 is stored and
/// rewritten by RXParamSetupReq.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhyConfig {
    /// Timing parameters
    pub timing: TimingParams,
    /// RX1 data rate offset into the reply matrix
    pub rx1_dr_offset: u8,
    /// RX2 frequency in Hz
    pub rx2_frequency: u32,
    /// RX2 data rate
    pub rx2_data_rate: DataRate,
    /// RX1 and RX2 window length in symbols
    pub window_symbols: u16,
    /// RX1 listens with the RX2 parameters and RX2 with the RX1 parameters
    pub rx1_rx2_swap: bool,
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            timing: TimingParams::default(),
            rx1_dr_offset: 0,
            rx2_frequency: region::RX2_DEFAULT_FREQUENCY,
            rx2_data_rate: region::RX2_DEFAULT_DATA_RATE,
            window_symbols: DEFAULT_WINDOW_SYMBOLS,
            rx1_rx2_swap: false,
        }
    }
}

impl PhyConfig {
    fn uplink_reply(&self, tx_frequency: u32, uplink_dr: DataRate) -> ReceiveWindowParams {
        ReceiveWindowParams::new(
            tx_frequency,
            uplink_dr.rx1_reply(self.rx1_dr_offset),
            self.window_symbols,
        )
    }

    fn stored_rx2(&self) -> ReceiveWindowParams {
        ReceiveWindowParams::new(self.rx2_frequency, self.rx2_data_rate, self.window_symbols)
    }

    /// Parameters RX1 listens with after an uplink on `tx_frequency`
    pub fn rx1_window(&self, tx_frequency: u32, uplink_dr: DataRate) -> ReceiveWindowParams {
        if self.rx1_rx2_swap {
            self.stored_rx2()
        } else {
            self.uplink_reply(tx_frequency, uplink_dr)
        }
    }

    /// Parameters RX2 listens with after an uplink on `tx_frequency`
    pub fn rx2_window(&self, tx_frequency: u32, uplink_dr: DataRate) -> ReceiveWindowParams {
        if self.rx1_rx2_swap {
            self.uplink_reply(tx_frequency, uplink_dr)
        } else {
            self.stored_rx2()
        }
    }
}
