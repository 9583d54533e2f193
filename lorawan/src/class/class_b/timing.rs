//! LoRaWAN Class B Beacon Timing
//!
//! This module handles the beacon time grid including:
//! - Beacon period and transmission offset
//! - Next beacon epoch calculation
//! - Periodic gateway beacon broadcasts

use core::time::Duration;

use super::beacon::BeaconTag;
use crate::sim::{EventId, SimTime, Simulator};

/// Beacon period
pub const BEACON_PERIOD: Duration = Duration::from_secs(128);

/// Offset of each beacon transmission into its period
pub const BEACON_OFFSET: Duration = Duration::from_micros(1_500);

/// Start of the beacon period after `now`.
///
/// The period index is `floor(now / 128 s) + 1`, so a time sitting exactly
/// on the grid moves on to the following period.
pub fn next_beacon_period(now: SimTime) -> SimTime {
    let period = BEACON_PERIOD.as_nanos();
    let index = now.as_nanos() / period + 1;
    SimTime::from_nanos((index * period) as u64)
}

/// Next beacon transmission time strictly after the current period start
pub fn next_beacon_epoch(now: SimTime) -> SimTime {
    next_beacon_period(now) + BEACON_OFFSET
}

/// Delay from `now` until [`next_beacon_epoch`]
pub fn time_until_next_beacon(now: SimTime) -> Duration {
    next_beacon_epoch(now).saturating_duration_since(now)
}

/// Schedule a beacon broadcast on every beacon epoch.
///
/// `emit` runs at each epoch with the tag stamped for it and the broadcast
/// re-arms itself for the following epoch.
pub fn schedule_beacon_broadcasts<C: 'static>(
    sim: &mut Simulator<C>,
    emit: fn(&mut C, &mut Simulator<C>, BeaconTag),
) -> EventId {
    let delay = time_until_next_beacon(sim.now());
    sim.schedule(delay, move |ctx, sim| broadcast_beacon(ctx, sim, emit))
}

fn broadcast_beacon<C: 'static>(
    ctx: &mut C,
    sim: &mut Simulator<C>,
    emit: fn(&mut C, &mut Simulator<C>, BeaconTag),
) {
    let tag = BeaconTag::at(sim.now());
    debug!("beacon broadcast at {}", sim.now());
    emit(ctx, sim, tag);
    schedule_beacon_broadcasts(sim, emit);
}
