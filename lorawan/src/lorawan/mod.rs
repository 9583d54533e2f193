//! LoRaWAN protocol implementation
//!
//! This module contains the core LoRaWAN protocol implementation, including:
//! - MAC layer state and the frame codec
//! - Receive window parameters and timing
//! - Regional parameters and duty cycle accounting
//! - Command handling

/// MAC command handling
pub mod commands;

/// Channel selection and duty cycle accounting
pub mod duty_cycle;

/// MAC layer implementation
pub mod mac;

/// Receive window parameters
pub mod phy;

/// Regional parameters and configurations
pub mod region;

/// Receive window timing engine
pub mod windows;

pub use duty_cycle::{ChannelPlan, DutyCycleHelper};
pub use mac::{Frame, MacLayer, PacketId, TxOutcome};
pub use phy::{PhyConfig, ReceiveWindowParams, TimingParams};
pub use region::DataRate;
pub use windows::{WindowEngine, WindowKind};
