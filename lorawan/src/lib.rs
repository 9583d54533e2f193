//! Timing and control core of a LoRaWAN Class B end-device
//!
//! This crate models the behaviour of an end-device on a virtual clock:
//! when the radio may transmit, when receive windows open and close, how
//! unacknowledged uplinks are retransmitted, and how beacons anchor the
//! Class B ping slots.
//!
//! # Features
//! - Radio state supervision (SLEEP, STANDBY, TX, RX)
//! - RX1/RX2 receive windows with MAC-command driven parameters
//! - Confirmed uplinks with retransmission and ADR back-off
//! - Beacon synchronization on the 128 s grid and ping slot scheduling
//! - Duty cycle accounting on the EU868 sub-bands
//! - Deterministic discrete-event scheduler
//!
//! # Example
//! ```no_run
//! use lorawan_classb::{
//!     config::device::DeviceConfig,
//!     device::{DeviceSim, EndDevice},
//!     radio::Phy,
//! };
//!
//! fn run<P: Phy + 'static>(phy: P) -> Result<(), lorawan_classb::device::DeviceError> {
//!     let config = DeviceConfig::default().with_confirmed(3);
//!     let mut device = EndDevice::new(phy, config)?;
//!     device.set_completion_handler(|outcome| {
//!         println!("{} delivered: {}", outcome.packet.id, outcome.success);
//!     });
//!
//!     let mut sim = DeviceSim::new();
//!     device.start(&mut sim)?;
//!     device.submit(&mut sim, 1, b"hello".to_vec())?;
//!     sim.run_for(&mut device, core::time::Duration::from_secs(600));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

// This mod MUST go first, so that the others see its macros.
#[macro_use]
mod fmt;

/// Device operating modes and Class B state
pub mod class;

/// Device and session configuration
pub mod config;

/// Simulated end-device
pub mod device;

/// LoRaWAN protocol implementation
pub mod lorawan;

/// Radio hardware abstraction layer
pub mod radio;

/// Virtual-time scheduler
pub mod sim;
