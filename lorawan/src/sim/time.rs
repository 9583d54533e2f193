//! Virtual time
//!
//! Simulation time is kept as a [`Duration`] elapsed since the start of the
//! run, which gives exact nanosecond arithmetic for the symbol and beacon
//! periods used by the protocol (e.g. 0.96 s, 32.768 ms, 128.0015 s).

use core::fmt;
use core::ops::{Add, AddAssign, Sub};
use core::time::Duration;

/// Point on the virtual clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SimTime(Duration);

impl SimTime {
    /// Start of the simulation
    pub const ZERO: SimTime = SimTime(Duration::ZERO);

    /// Time elapsed since the start of the simulation
    pub const fn from_duration(since_start: Duration) -> Self {
        Self(since_start)
    }

    /// Whole seconds since the start of the simulation
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Milliseconds since the start of the simulation
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Nanoseconds since the start of the simulation
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(Duration::from_nanos(nanos))
    }

    /// Fractional seconds since the start of the simulation
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::from_secs_f64(secs))
    }

    /// Elapsed time as a [`Duration`]
    pub const fn since_start(self) -> Duration {
        self.0
    }

    /// Elapsed time in nanoseconds
    pub const fn as_nanos(self) -> u128 {
        self.0.as_nanos()
    }

    /// Elapsed time in fractional seconds
    pub fn as_secs_f64(self) -> f64 {
        self.0.as_secs_f64()
    }

    /// Time from `earlier` to `self`, or zero if `earlier` is later
    pub fn saturating_duration_since(self, earlier: SimTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// Time from `earlier` to `self`, if `earlier` is not later
    pub fn checked_duration_since(self, earlier: SimTime) -> Option<Duration> {
        self.0.checked_sub(earlier.0)
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        SimTime(self.0 + rhs)
    }
}

impl AddAssign<Duration> for SimTime {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

impl Sub<Duration> for SimTime {
    type Output = SimTime;

    /// # Panics
    ///
    /// Panics if the result would lie before the start of the simulation.
    fn sub(self, rhs: Duration) -> SimTime {
        SimTime(self.0 - rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.0.as_secs(), self.0.subsec_nanos())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for SimTime {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=u64}ns", self.0.as_nanos() as u64)
    }
}
