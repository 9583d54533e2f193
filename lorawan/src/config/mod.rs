//! Device configuration
//!
//! This module contains the types used to configure a simulated end-device:
//! - Device address and session counters
//! - Uplink, retransmission and receive window settings
//! - Class B ping slot and beacon parameters

/// Device configuration and session state
pub mod device;

pub use device::{ConfigError, DevAddr, DeviceConfig, SessionState};
