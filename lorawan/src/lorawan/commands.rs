//! MAC command codec
//!
//! Commands travel in the FOpts field of data frames. Requests flow down
//! from the network, answers flow up with the next uplink. Both directions
//! share one command identifier.

use heapless::Vec;
use thiserror::Error;

use super::region::DataRate;

/// Maximum FOpts length in bytes
pub const MAX_FOPTS_LEN: usize = 15;

/// Maximum number of commands carried by one frame
pub const MAX_COMMANDS: usize = 8;

/// Commands parsed from, or queued for, one frame
pub type CommandList = Vec<MacCommand, MAX_COMMANDS>;

/// Encoded FOpts field
pub type FOpts = Vec<u8, MAX_FOPTS_LEN>;

/// MAC command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandIdentifier {
    /// RX2 frequency, RX2 data rate and RX1 offset
    RxParamSetup = 0x05,
    /// RX1 delay
    RxTimingSetup = 0x08,
}

impl CommandIdentifier {
    fn from_byte(cid: u8) -> Option<Self> {
        match cid {
            0x05 => Some(CommandIdentifier::RxParamSetup),
            0x08 => Some(CommandIdentifier::RxTimingSetup),
            _ => None,
        }
    }
}

/// MAC command encoding or decoding failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Payload shorter than the command requires
    #[error("command 0x{cid:02x} needs {expected} payload bytes, found {found}")]
    Truncated {
        /// Command identifier
        cid: u8,
        /// Payload length required
        expected: usize,
        /// Payload length available
        found: usize,
    },
    /// Identifier not supported in this direction
    #[error("unknown command identifier 0x{0:02x}")]
    UnknownCommand(u8),
    /// Field cannot be represented in its wire width
    #[error("{field} value {value} cannot be encoded")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u32,
    },
    /// FOpts would exceed 15 bytes
    #[error("FOpts full")]
    BufferFull,
}

/// MAC command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MacCommand {
    /// RX parameter setup request
    RxParamSetupReq {
        /// RX1 data rate offset (3 bits)
        rx1_dr_offset: u8,
        /// RX2 data rate (4 bits)
        rx2_data_rate: DataRate,
        /// RX2 frequency in Hz, a multiple of 100 Hz
        frequency: u32,
    },
    /// RX parameter setup answer
    RxParamSetupAns {
        /// RX1 data rate offset ACK
        rx1_dr_offset_ack: bool,
        /// RX2 data rate ACK
        rx2_data_rate_ack: bool,
        /// Channel ACK
        channel_ack: bool,
    },
    /// RX timing setup request
    RxTimingSetupReq {
        /// Delay (0-15), in seconds
        delay: u8,
    },
    /// RX timing setup answer
    RxTimingSetupAns,
}

impl MacCommand {
    /// Command identifier
    pub fn cid(&self) -> CommandIdentifier {
        match self {
            MacCommand::RxParamSetupReq { .. } | MacCommand::RxParamSetupAns { .. } => {
                CommandIdentifier::RxParamSetup
            }
            MacCommand::RxTimingSetupReq { .. } | MacCommand::RxTimingSetupAns => {
                CommandIdentifier::RxTimingSetup
            }
        }
    }

    /// Payload length in bytes, excluding the identifier
    pub fn len(&self) -> usize {
        match self {
            MacCommand::RxParamSetupReq { .. } => 4,
            MacCommand::RxParamSetupAns { .. } => 1,
            MacCommand::RxTimingSetupReq { .. } => 1,
            MacCommand::RxTimingSetupAns => 0,
        }
    }

    /// Whether the command has no payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a network-to-device command
    pub fn from_downlink(cid: u8, payload: &[u8]) -> Result<Self, CommandError> {
        match CommandIdentifier::from_byte(cid) {
            Some(CommandIdentifier::RxParamSetup) => {
                let p = expect_len(cid, payload, 4)?;
                Ok(MacCommand::RxParamSetupReq {
                    rx1_dr_offset: (p[0] >> 4) & 0x07,
                    rx2_data_rate: DataRate::from_index(p[0] & 0x0F),
                    frequency: u32::from_le_bytes([p[1], p[2], p[3], 0]) * 100,
                })
            }
            Some(CommandIdentifier::RxTimingSetup) => {
                let p = expect_len(cid, payload, 1)?;
                Ok(MacCommand::RxTimingSetupReq { delay: p[0] & 0x0F })
            }
            None => Err(CommandError::UnknownCommand(cid)),
        }
    }

    /// Parse a device-to-network command
    pub fn from_uplink(cid: u8, payload: &[u8]) -> Result<Self, CommandError> {
        match CommandIdentifier::from_byte(cid) {
            Some(CommandIdentifier::RxParamSetup) => {
                let p = expect_len(cid, payload, 1)?;
                Ok(MacCommand::RxParamSetupAns {
                    rx1_dr_offset_ack: (p[0] & 0x04) != 0,
                    rx2_data_rate_ack: (p[0] & 0x02) != 0,
                    channel_ack: (p[0] & 0x01) != 0,
                })
            }
            Some(CommandIdentifier::RxTimingSetup) => Ok(MacCommand::RxTimingSetupAns),
            None => Err(CommandError::UnknownCommand(cid)),
        }
    }

    /// Append identifier and payload to `out`
    pub fn encode(&self, out: &mut FOpts) -> Result<(), CommandError> {
        let mut bytes: Vec<u8, 5> = Vec::new();
        // capacity 5 always fits the largest command
        let _ = bytes.push(self.cid() as u8);
        match *self {
            MacCommand::RxParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                frequency,
            } => {
                if rx1_dr_offset > 0x07 {
                    return Err(CommandError::OutOfRange {
                        field: "rx1_dr_offset",
                        value: u32::from(rx1_dr_offset),
                    });
                }
                if rx2_data_rate.index() > 0x0F {
                    return Err(CommandError::OutOfRange {
                        field: "rx2_data_rate",
                        value: u32::from(rx2_data_rate.index()),
                    });
                }
                let channel = frequency / 100;
                if frequency % 100 != 0 || channel > 0x00FF_FFFF {
                    return Err(CommandError::OutOfRange {
                        field: "frequency",
                        value: frequency,
                    });
                }
                let _ = bytes.push((rx1_dr_offset << 4) | rx2_data_rate.index());
                let _ = bytes.extend_from_slice(&channel.to_le_bytes()[..3]);
            }
            MacCommand::RxParamSetupAns {
                rx1_dr_offset_ack,
                rx2_data_rate_ack,
                channel_ack,
            } => {
                let mut status = 0u8;
                if rx1_dr_offset_ack {
                    status |= 0x04;
                }
                if rx2_data_rate_ack {
                    status |= 0x02;
                }
                if channel_ack {
                    status |= 0x01;
                }
                let _ = bytes.push(status);
            }
            MacCommand::RxTimingSetupReq { delay } => {
                if delay > 0x0F {
                    return Err(CommandError::OutOfRange {
                        field: "delay",
                        value: u32::from(delay),
                    });
                }
                let _ = bytes.push(delay);
            }
            MacCommand::RxTimingSetupAns => {}
        }
        out.extend_from_slice(&bytes)
            .map_err(|_| CommandError::BufferFull)
    }
}

fn expect_len(cid: u8, payload: &[u8], expected: usize) -> Result<&[u8], CommandError> {
    payload.get(..expected).ok_or(CommandError::Truncated {
        cid,
        expected,
        found: payload.len(),
    })
}

/// Parse the FOpts of a downlink. Parsing stops at the first unknown or
/// truncated command; everything before it is returned.
pub fn parse_downlink_commands(fopts: &[u8]) -> CommandList {
    parse_commands(fopts, MacCommand::from_downlink)
}

/// Parse the FOpts of an uplink, with the same stopping rule as
/// [`parse_downlink_commands`]
pub fn parse_uplink_commands(fopts: &[u8]) -> CommandList {
    parse_commands(fopts, MacCommand::from_uplink)
}

fn parse_commands(
    fopts: &[u8],
    parse: fn(u8, &[u8]) -> Result<MacCommand, CommandError>,
) -> CommandList {
    let mut commands = CommandList::new();
    let mut rest = fopts;
    while let Some((&cid, payload)) = rest.split_first() {
        match parse(cid, payload) {
            Ok(command) => {
                rest = &payload[command.len()..];
                if commands.push(command).is_err() {
                    warn!("dropping MAC commands past {}", MAX_COMMANDS);
                    break;
                }
            }
            Err(err) => {
                warn!("stopped parsing FOpts: {}", err);
                break;
            }
        }
    }
    commands
}

/// Encode a list of commands into an FOpts field
pub fn encode_commands(commands: &[MacCommand]) -> Result<FOpts, CommandError> {
    let mut fopts = FOpts::new();
    for command in commands {
        command.encode(&mut fopts)?;
    }
    Ok(fopts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_param_setup_req_wire_layout() {
        let req = MacCommand::RxParamSetupReq {
            rx1_dr_offset: 3,
            rx2_data_rate: DataRate::DR2,
            frequency: 869_525_000,
        };
        let fopts = encode_commands(&[req]).unwrap();
        // 869.525 MHz is channel 8_695_250 = 0x84add2
        assert_eq!(fopts.as_slice(), &[0x05, 0x32, 0xd2, 0xad, 0x84]);
        let parsed = parse_downlink_commands(&fopts);
        assert_eq!(parsed.as_slice(), &[req]);
    }

    #[test]
    fn test_rx_param_setup_ans_bits() {
        let ans = MacCommand::RxParamSetupAns {
            rx1_dr_offset_ack: false,
            rx2_data_rate_ack: true,
            channel_ack: true,
        };
        let fopts = encode_commands(&[ans]).unwrap();
        assert_eq!(fopts.as_slice(), &[0x05, 0x03]);
        assert_eq!(parse_uplink_commands(&fopts).as_slice(), &[ans]);
    }

    #[test]
    fn test_encode_rejects_unrepresentable_fields() {
        let offset = MacCommand::RxParamSetupReq {
            rx1_dr_offset: 9,
            rx2_data_rate: DataRate::DR0,
            frequency: 869_525_000,
        };
        assert_eq!(
            offset.encode(&mut FOpts::new()),
            Err(CommandError::OutOfRange {
                field: "rx1_dr_offset",
                value: 9
            })
        );

        let frequency = MacCommand::RxParamSetupReq {
            rx1_dr_offset: 0,
            rx2_data_rate: DataRate::DR0,
            frequency: 869_525_050,
        };
        assert!(matches!(
            frequency.encode(&mut FOpts::new()),
            Err(CommandError::OutOfRange { field: "frequency", .. })
        ));
    }

    #[test]
    fn test_parsing_stops_at_unknown_or_truncated() {
        let fopts = [0x08, 0x03, 0x7f, 0x05, 0x00];
        let parsed = parse_downlink_commands(&fopts);
        assert_eq!(parsed.as_slice(), &[MacCommand::RxTimingSetupReq { delay: 3 }]);

        let truncated = [0x05, 0x00, 0x01];
        assert!(parse_downlink_commands(&truncated).is_empty());
        assert_eq!(
            MacCommand::from_downlink(0x05, &truncated[1..]),
            Err(CommandError::Truncated {
                cid: 0x05,
                expected: 4,
                found: 2
            })
        );
    }

    #[test]
    fn test_fopts_capacity() {
        let ans = MacCommand::RxParamSetupAns {
            rx1_dr_offset_ack: true,
            rx2_data_rate_ack: true,
            channel_ack: true,
        };
        let mut fopts = FOpts::new();
        for _ in 0..7 {
            ans.encode(&mut fopts).unwrap();
        }
        assert_eq!(fopts.len(), 14);
        assert_eq!(ans.encode(&mut fopts), Err(CommandError::BufferFull));
    }
}
