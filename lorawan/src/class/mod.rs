//! LoRaWAN device class support
//!
//! This module contains the device operating modes:
//! - Class A: Two receive windows after each uplink
//! - Class B: Class A plus beacon synchronized ping slots
//! - Class C: Declared for completeness, rejected by configuration validation

/// Class B device implementation
pub mod class_b;
pub use class_b::ClassB;

/// Device operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperatingMode {
    /// Class A: Basic bi-directional communication
    ClassA,
    /// Class B: Scheduled receive slots
    ClassB,
    /// Class C: Continuous receive
    ClassC,
}

impl OperatingMode {
    /// Whether the mode listens for beacons and ping slots
    pub fn is_class_b(self) -> bool {
        self == OperatingMode::ClassB
    }
}
