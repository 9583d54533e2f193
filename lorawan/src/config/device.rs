use core::fmt;

use thiserror::Error;

use crate::class::class_b::ping_slot::{PingSlotConfig, MAX_PERIODICITY};
use crate::class::OperatingMode;
use crate::lorawan::phy::{PhyConfig, ReceiveWindowParams, DEFAULT_WINDOW_SYMBOLS};
use crate::lorawan::region::{self, DataRate, MAX_RX1_DR_OFFSET};

/// Largest network identifier (7 bits)
pub const MAX_NWK_ID: u8 = 0x7F;
/// Largest network address (25 bits)
pub const MAX_NWK_ADDR: u32 = 0x01FF_FFFF;

/// Configuration rejected by [`DeviceConfig::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Data rate without a LoRa mapping
    #[error("data rate DR{0} has no spreading factor/bandwidth mapping")]
    InvalidDataRate(u8),
    /// RX1 offset past the reply matrix
    #[error("RX1 data rate offset {0} out of range 0..=5")]
    InvalidRx1Offset(u8),
    /// Ping slot periodicity exponent above 7
    #[error("ping slot periodicity {0} out of range 0..=7")]
    InvalidPingSlotPeriodicity(u8),
    /// No transmission allowed at all
    #[error("maximum number of transmissions must be at least 1")]
    ZeroTransmissions,
    /// Receive window of zero symbols
    #[error("receive window length must be at least one symbol")]
    ZeroWindowSymbols,
    /// Address fields wider than 7/25 bits
    #[error("device address {nwk_id}:{nwk_addr} out of range")]
    InvalidAddress {
        /// Network identifier
        nwk_id: u8,
        /// Network address
        nwk_addr: u32,
    },
    /// Operating mode without an implementation
    #[error("operating mode {0:?} is not supported")]
    UnsupportedMode(OperatingMode),
}

/// Device address: 7-bit network identifier and 25-bit network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DevAddr {
    nwk_id: u8,
    nwk_addr: u32,
}

impl DevAddr {
    /// Reserved all-zero broadcast address
    pub const BROADCAST: DevAddr = DevAddr {
        nwk_id: 0,
        nwk_addr: 0,
    };

    /// Address from its two fields
    pub fn new(nwk_id: u8, nwk_addr: u32) -> Result<Self, ConfigError> {
        if nwk_id > MAX_NWK_ID || nwk_addr > MAX_NWK_ADDR {
            return Err(ConfigError::InvalidAddress { nwk_id, nwk_addr });
        }
        Ok(Self { nwk_id, nwk_addr })
    }

    /// Address from its 32-bit wire value
    pub fn from_u32(raw: u32) -> Self {
        Self {
            nwk_id: (raw >> 25) as u8,
            nwk_addr: raw & MAX_NWK_ADDR,
        }
    }

    /// 32-bit wire value
    pub fn to_u32(self) -> u32 {
        (u32::from(self.nwk_id) << 25) | self.nwk_addr
    }

    /// Little-endian bytes as carried in the frame header
    pub fn to_bytes(self) -> [u8; 4] {
        self.to_u32().to_le_bytes()
    }

    /// Address from frame header bytes
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::from_u32(u32::from_le_bytes(bytes))
    }

    /// Network identifier
    pub fn nwk_id(self) -> u8 {
        self.nwk_id
    }

    /// Network address
    pub fn nwk_addr(self) -> u32 {
        self.nwk_addr
    }

    /// Whether this is the broadcast address
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.to_u32())
    }
}

/// Frame counters of an activated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionState {
    /// Device address
    pub dev_addr: DevAddr,
    /// Uplink frame counter
    pub fcnt_up: u32,
    /// Last downlink frame counter seen
    pub fcnt_down: u32,
}

impl SessionState {
    /// Fresh session for an address
    pub fn new(dev_addr: DevAddr) -> Self {
        Self {
            dev_addr,
            fcnt_up: 0,
            fcnt_down: 0,
        }
    }

    /// Increment the uplink frame counter
    pub fn increment_fcnt_up(&mut self) {
        self.fcnt_up = self.fcnt_up.wrapping_add(1);
    }

    /// Record the counter of a received downlink
    pub fn update_fcnt_down(&mut self, fcnt: u32) {
        self.fcnt_down = fcnt;
    }
}

/// Device configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceConfig {
    /// Device address
    pub address: DevAddr,
    /// Operating mode
    pub mode: OperatingMode,
    /// Send confirmed uplinks
    pub confirmed: bool,
    /// Transmissions per confirmed packet, first attempt included
    pub max_transmissions: u8,
    /// Step the data rate down on alternating retransmissions
    pub adr_enabled: bool,
    /// Initial uplink data rate
    pub data_rate: DataRate,
    /// Transmit power in dBm
    pub tx_power: i8,
    /// Receive window configuration
    pub phy: PhyConfig,
    /// Ping slot configuration (Class B)
    pub ping_slot: PingSlotConfig,
    /// Beacon window parameters (Class B)
    pub beacon: ReceiveWindowParams,
    /// Seed of the device's random source (ACK timeout, channel choice)
    pub seed: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: DevAddr {
                nwk_id: 54,
                nwk_addr: 1864,
            },
            mode: OperatingMode::ClassB,
            confirmed: false,
            max_transmissions: 8,
            adr_enabled: false,
            data_rate: DataRate::DR5,
            tx_power: 14,
            phy: PhyConfig::default(),
            ping_slot: PingSlotConfig::default(),
            beacon: ReceiveWindowParams::new(
                region::BEACON_DEFAULT_FREQUENCY,
                region::BEACON_DEFAULT_DATA_RATE,
                DEFAULT_WINDOW_SYMBOLS,
            ),
            seed: 0,
        }
    }
}

impl DeviceConfig {
    /// Default configuration for an address
    pub fn new(address: DevAddr) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    /// Set the operating mode
    pub fn with_mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Send confirmed uplinks with up to `max_transmissions` attempts
    pub fn with_confirmed(mut self, max_transmissions: u8) -> Self {
        self.confirmed = true;
        self.max_transmissions = max_transmissions;
        self
    }

    /// Enable or disable the retransmission data rate back-off
    pub fn with_adr(mut self, enabled: bool) -> Self {
        self.adr_enabled = enabled;
        self
    }

    /// Set the initial uplink data rate
    pub fn with_data_rate(mut self, data_rate: DataRate) -> Self {
        self.data_rate = data_rate;
        self
    }

    /// Set the receive window configuration
    pub fn with_phy(mut self, phy: PhyConfig) -> Self {
        self.phy = phy;
        self
    }

    /// Set the ping slot configuration
    pub fn with_ping_slot(mut self, ping_slot: PingSlotConfig) -> Self {
        self.ping_slot = ping_slot;
        self
    }

    /// Set the random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check every field against the regional parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == OperatingMode::ClassC {
            return Err(ConfigError::UnsupportedMode(self.mode));
        }
        if self.address.nwk_id > MAX_NWK_ID || self.address.nwk_addr > MAX_NWK_ADDR {
            return Err(ConfigError::InvalidAddress {
                nwk_id: self.address.nwk_id,
                nwk_addr: self.address.nwk_addr,
            });
        }
        if self.max_transmissions == 0 {
            return Err(ConfigError::ZeroTransmissions);
        }
        for dr in [
            self.data_rate,
            self.phy.rx2_data_rate,
            self.ping_slot.data_rate(),
            self.beacon.data_rate,
        ] {
            if !dr.is_valid() {
                return Err(ConfigError::InvalidDataRate(dr.index()));
            }
        }
        if self.phy.rx1_dr_offset > MAX_RX1_DR_OFFSET {
            return Err(ConfigError::InvalidRx1Offset(self.phy.rx1_dr_offset));
        }
        if self.ping_slot.periodicity() > MAX_PERIODICITY {
            return Err(ConfigError::InvalidPingSlotPeriodicity(
                self.ping_slot.periodicity(),
            ));
        }
        if self.phy.window_symbols == 0
            || self.beacon.duration_symbols == 0
            || self.ping_slot.duration_symbols() == 0
        {
            return Err(ConfigError::ZeroWindowSymbols);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_fields() {
        let addr = DevAddr::new(54, 1864).unwrap();
        assert_eq!(addr.to_u32(), (54 << 25) | 1864);
        assert_eq!(DevAddr::from_bytes(addr.to_bytes()), addr);
        assert!(!addr.is_broadcast());
        assert!(DevAddr::from_u32(0).is_broadcast());
        assert_eq!(
            DevAddr::new(128, 0),
            Err(ConfigError::InvalidAddress {
                nwk_id: 128,
                nwk_addr: 0
            })
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = DeviceConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.max_transmissions, 8);
        assert_eq!(config.phy.rx2_frequency, 869_525_000);
    }

    #[test]
    fn test_validation_errors() {
        let config = DeviceConfig::default().with_mode(OperatingMode::ClassC);
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnsupportedMode(OperatingMode::ClassC))
        );

        let config = DeviceConfig::default().with_confirmed(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroTransmissions));

        let config = DeviceConfig::default().with_data_rate(DataRate::from_index(9));
        assert_eq!(config.validate(), Err(ConfigError::InvalidDataRate(9)));

        let mut config = DeviceConfig::default();
        config.phy.rx1_dr_offset = 6;
        assert_eq!(config.validate(), Err(ConfigError::InvalidRx1Offset(6)));
    }

    #[test]
    fn test_session_counters() {
        let mut session = SessionState::new(DevAddr::BROADCAST);
        session.increment_fcnt_up();
        session.increment_fcnt_up();
        session.update_fcnt_down(7);
        assert_eq!(session.fcnt_up, 2);
        assert_eq!(session.fcnt_down, 7);
    }
}
