//! Channel selection and duty cycle accounting
//!
//! Every uplink puts its sub-band off the air for `airtime / duty_cycle`
//! measured from the start of the transmission. The device asks the plan for
//! a channel that is free now, or how long it has to wait for one.

use core::time::Duration;

use heapless::Vec;

use super::region::{default_channels, Channel, MAX_CHANNELS};
use crate::sim::SimTime;

/// Maximum number of sub-bands in a plan
pub const MAX_SUB_BANDS: usize = 4;

/// Uplink channel plan consulted before every transmission
pub trait ChannelPlan {
    /// Pick an enabled channel that may transmit at `now`
    fn select_channel(&mut self, now: SimTime, rng: &mut fastrand::Rng) -> Option<Channel>;

    /// Account for a transmission of `airtime` starting at `now`
    fn register_transmission(&mut self, now: SimTime, airtime: Duration, channel: &Channel);

    /// Time until some enabled channel may transmit; `None` if the plan
    /// has no enabled channel at all
    fn waiting_time(&self, now: SimTime) -> Option<Duration>;
}

/// Frequency range sharing one duty cycle budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubBand {
    /// Lowest frequency in Hz
    pub low: u32,
    /// Highest frequency in Hz
    pub high: u32,
    /// Allowed fraction of time on air
    pub duty_cycle: f64,
    /// Earliest time the sub-band may transmit again
    next_tx: SimTime,
}

impl SubBand {
    /// Sub-band covering `low..=high`
    pub const fn new(low: u32, high: u32, duty_cycle: f64) -> Self {
        Self {
            low,
            high,
            duty_cycle,
            next_tx: SimTime::ZERO,
        }
    }

    /// Whether a frequency belongs to the sub-band
    pub fn contains(&self, frequency: u32) -> bool {
        (self.low..=self.high).contains(&frequency)
    }

    /// Earliest time the sub-band may transmit again
    pub fn next_transmission(&self) -> SimTime {
        self.next_tx
    }
}

/// Duty cycle tracker over a set of channels and sub-bands
#[derive(Debug, Clone)]
pub struct DutyCycleHelper {
    channels: Vec<Channel, MAX_CHANNELS>,
    sub_bands: Vec<SubBand, MAX_SUB_BANDS>,
    aggregated_duty_cycle: f64,
    next_aggregated_tx: SimTime,
}

impl Default for DutyCycleHelper {
    fn default() -> Self {
        Self::eu868()
    }
}

impl DutyCycleHelper {
    /// Plan over arbitrary channels and sub-bands
    pub fn new(channels: Vec<Channel, MAX_CHANNELS>, sub_bands: Vec<SubBand, MAX_SUB_BANDS>) -> Self {
        Self {
            channels,
            sub_bands,
            aggregated_duty_cycle: 1.0,
            next_aggregated_tx: SimTime::ZERO,
        }
    }

    /// The three default EU868 channels with the 868.0-868.6 MHz (1%),
    /// 868.7-869.2 MHz (0.1%) and 869.4-869.65 MHz (10%) sub-bands
    pub fn eu868() -> Self {
        let sub_bands = [
            SubBand::new(868_000_000, 868_600_000, 0.01),
            SubBand::new(868_700_000, 869_200_000, 0.001),
            SubBand::new(869_400_000, 869_650_000, 0.1),
        ]
        .into_iter()
        .collect();
        Self::new(default_channels(), sub_bands)
    }

    /// The default EU868 channels without any duty cycle restriction
    pub fn unrestricted() -> Self {
        let sub_bands = core::iter::once(SubBand::new(863_000_000, 870_000_000, 1.0)).collect();
        Self::new(default_channels(), sub_bands)
    }

    /// Limit the total time on air across all sub-bands
    pub fn set_aggregated_duty_cycle(&mut self, duty_cycle: f64) {
        self.aggregated_duty_cycle = duty_cycle;
    }

    /// Channels of the plan
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Mutable channels of the plan
    pub fn channels_mut(&mut self) -> &mut Vec<Channel, MAX_CHANNELS> {
        &mut self.channels
    }

    /// Sub-bands of the plan
    pub fn sub_bands(&self) -> &[SubBand] {
        &self.sub_bands
    }

    fn sub_band(&self, frequency: u32) -> Option<&SubBand> {
        self.sub_bands.iter().find(|b| b.contains(frequency))
    }

    fn available_at(&self, channel: &Channel) -> Option<SimTime> {
        let band = self.sub_band(channel.frequency)?;
        Some(band.next_tx.max(self.next_aggregated_tx))
    }
}

/// Time a transmission of `airtime` keeps a band closed under `duty_cycle`
fn off_time(airtime: Duration, duty_cycle: f64) -> Duration {
    if duty_cycle <= 0.0 || duty_cycle >= 1.0 {
        return airtime;
    }
    airtime.div_f64(duty_cycle)
}

impl ChannelPlan for DutyCycleHelper {
    fn select_channel(&mut self, now: SimTime, rng: &mut fastrand::Rng) -> Option<Channel> {
        let free: Vec<Channel, MAX_CHANNELS> = self
            .channels
            .iter()
            .filter(|c| c.enabled)
            .filter(|c| self.available_at(c).map_or(false, |at| at <= now))
            .copied()
            .collect();
        if free.is_empty() {
            return None;
        }
        Some(free[rng.usize(..free.len())])
    }

    fn register_transmission(&mut self, now: SimTime, airtime: Duration, channel: &Channel) {
        if let Some(band) = self
            .sub_bands
            .iter_mut()
            .find(|b| b.contains(channel.frequency))
        {
            band.next_tx = now + off_time(airtime, band.duty_cycle);
            trace!("sub-band {} closed until {}", band.low, band.next_tx);
        }
        self.next_aggregated_tx = now + off_time(airtime, self.aggregated_duty_cycle);
    }

    fn waiting_time(&self, now: SimTime) -> Option<Duration> {
        self.channels
            .iter()
            .filter(|c| c.enabled)
            .filter_map(|c| self.available_at(c))
            .min()
            .map(|at| at.saturating_duration_since(now))
    }
}
