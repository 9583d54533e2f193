//! MAC layer
//!
//! Frame codec and the state of the uplink/retransmission controller:
//! - Data frame header (MHDR, FHDR) encoding and parsing
//! - Classification of received frames
//! - Retransmission bookkeeping, ACK timeout and the data rate back-off
//! - Handling of downlink MAC commands and queuing of their answers
//!
//! The scheduling side (when to transmit, when to retry) lives in
//! [`EndDevice`](crate::device::EndDevice); everything here is plain state.

use core::fmt;
use core::time::Duration;

use thiserror::Error;

use super::commands::{parse_downlink_commands, CommandList, FOpts, MacCommand};
use super::phy::{PhyConfig, TimingParams};
use super::region::{DataRate, MAX_RX1_DR_OFFSET};
use super::windows::WindowEngine;
use crate::class::class_b::beacon::BeaconTag;
use crate::config::device::{DevAddr, DeviceConfig, SessionState};
use crate::radio::TxParams;
use crate::sim::{SimTime, Simulator, TimerHandle};

/// Maximum MAC payload size
pub const MAX_MAC_PAYLOAD_SIZE: usize = 242;

/// Transmit power used after a data rate back-off, in dBm
pub const BACKOFF_TX_POWER: i8 = 14;

/// Lower bound of the ACK timeout
pub const ACK_TIMEOUT_MIN: Duration = Duration::from_secs(1);

/// Width of the ACK timeout range
pub const ACK_TIMEOUT_SPREAD: Duration = Duration::from_secs(2);

/// MAC header types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MType {
    /// Join request
    JoinRequest = 0x00,
    /// Join accept
    JoinAccept = 0x20,
    /// Unconfirmed data uplink
    UnconfirmedDataUp = 0x40,
    /// Unconfirmed data downlink
    UnconfirmedDataDown = 0x60,
    /// Confirmed data uplink
    ConfirmedDataUp = 0x80,
    /// Confirmed data downlink
    ConfirmedDataDown = 0xA0,
    /// Rejoin request
    RejoinRequest = 0xC0,
    /// Proprietary
    Proprietary = 0xE0,
}

impl MType {
    /// Message type of an MHDR byte
    pub fn from_mhdr(mhdr: u8) -> Self {
        match mhdr & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    /// Whether the message travels from device to network
    pub fn is_uplink(self) -> bool {
        matches!(
            self,
            MType::JoinRequest
                | MType::UnconfirmedDataUp
                | MType::ConfirmedDataUp
                | MType::RejoinRequest
        )
    }

    /// Whether the message is a data frame with an FHDR
    pub fn is_data(self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }
}

/// Frame codec failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Fewer bytes than the header requires
    #[error("frame of {len} bytes is shorter than {min}")]
    TooShort {
        /// Bytes available
        len: usize,
        /// Bytes required
        min: usize,
    },
    /// Not a data frame
    #[error("unsupported message type 0x{0:02x}")]
    UnsupportedMType(u8),
    /// Application payload over the MAC payload limit
    #[error("payload of {len} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Largest accepted payload
        max: usize,
    },
}

/// Frame header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FCtrl {
    /// ADR enabled
    pub adr: bool,
    /// ADR acknowledgement request
    pub adr_ack_req: bool,
    /// Acknowledges the last confirmed frame
    pub ack: bool,
    /// More downlink data pending
    pub f_pending: bool,
    /// Length of FOpts
    pub f_opts_len: u8,
}

impl FCtrl {
    /// Encode to the FCtrl byte
    pub fn to_byte(&self) -> u8 {
        let mut byte = self.f_opts_len & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    /// Decode an FCtrl byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Device address
    pub dev_addr: DevAddr,
    /// Flags; `f_opts_len` is taken from `f_opts` when encoding
    pub f_ctrl: FCtrl,
    /// Frame counter, 16 least significant bits
    pub f_cnt: u16,
    /// MAC commands
    pub f_opts: FOpts,
}

impl FrameHeader {
    /// Length of a header without FOpts
    pub const MIN_LEN: usize = 7;

    /// Header for `dev_addr` with no flags and no commands
    pub fn new(dev_addr: DevAddr, f_cnt: u16) -> Self {
        Self {
            dev_addr,
            f_ctrl: FCtrl::default(),
            f_cnt,
            f_opts: FOpts::new(),
        }
    }

    /// Append the encoded header to `out`
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let f_ctrl = FCtrl {
            f_opts_len: self.f_opts.len() as u8,
            ..self.f_ctrl
        };
        out.extend_from_slice(&self.dev_addr.to_bytes());
        out.push(f_ctrl.to_byte());
        out.extend_from_slice(&self.f_cnt.to_le_bytes());
        out.extend_from_slice(&self.f_opts);
    }

    /// Parse a header. Returns the header and the bytes it used.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), FrameError> {
        if bytes.len() < Self::MIN_LEN {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                min: Self::MIN_LEN,
            });
        }
        let dev_addr = DevAddr::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let f_ctrl = FCtrl::from_byte(bytes[4]);
        let f_cnt = u16::from_le_bytes([bytes[5], bytes[6]]);
        let end = Self::MIN_LEN + usize::from(f_ctrl.f_opts_len);
        let opts = bytes.get(Self::MIN_LEN..end).ok_or(FrameError::TooShort {
            len: bytes.len(),
            min: end,
        })?;
        let mut f_opts = FOpts::new();
        // at most 15 bytes, the FOpts capacity
        let _ = f_opts.extend_from_slice(opts);
        Ok((
            Self {
                dev_addr,
                f_ctrl,
                f_cnt,
                f_opts,
            },
            end,
        ))
    }
}

/// Data frame: MHDR, FHDR, optional port and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Message type
    pub mtype: MType,
    /// Frame header
    pub header: FrameHeader,
    /// Port, absent when the frame carries no payload
    pub f_port: Option<u8>,
    /// Application payload (MAC commands when the port is 0)
    pub payload: Vec<u8>,
}

impl DataFrame {
    /// Data frame with a payload on `f_port`
    pub fn new(mtype: MType, header: FrameHeader, f_port: u8, payload: &[u8]) -> Self {
        Self {
            mtype,
            header,
            f_port: Some(f_port),
            payload: payload.to_vec(),
        }
    }

    /// Data frame with no port and no payload
    pub fn empty(mtype: MType, header: FrameHeader) -> Self {
        Self {
            mtype,
            header,
            f_port: None,
            payload: Vec::new(),
        }
    }

    /// Encode to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + FrameHeader::MIN_LEN + 16 + self.payload.len());
        out.push(self.mtype as u8);
        self.header.serialize(&mut out);
        if let Some(port) = self.f_port {
            out.push(port);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// Parse a data frame
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&mhdr, rest) = bytes
            .split_first()
            .ok_or(FrameError::TooShort { len: 0, min: 1 })?;
        let mtype = MType::from_mhdr(mhdr);
        if !mtype.is_data() {
            return Err(FrameError::UnsupportedMType(mhdr));
        }
        let (header, used) = FrameHeader::parse(rest)?;
        let (f_port, payload) = match rest[used..].split_first() {
            Some((&port, payload)) => (Some(port), payload.to_vec()),
            None => (None, Vec::new()),
        };
        Ok(Self {
            mtype,
            header,
            f_port,
            payload,
        })
    }

    /// Downlink MAC commands, from FOpts and from a port 0 payload
    pub fn commands(&self) -> CommandList {
        let mut commands = parse_downlink_commands(&self.header.f_opts);
        if self.f_port == Some(0) {
            for command in parse_downlink_commands(&self.payload) {
                if commands.push(command).is_err() {
                    warn!("dropping MAC commands of port 0 payload");
                    break;
                }
            }
        }
        commands
    }

    /// Wrap into a frame
    pub fn into_frame(self) -> Frame {
        Frame::new(self.encode())
    }
}

/// Frame exchanged with the physical layer
///
/// Beacons carry their [`BeaconTag`] next to the bytes, the way the channel
/// model marks them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
    beacon: Option<BeaconTag>,
}

impl Frame {
    /// Frame from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            beacon: None,
        }
    }

    /// Gateway beacon: a broadcast downlink tagged with `tag`
    pub fn beacon(tag: BeaconTag) -> Self {
        let header = FrameHeader::new(DevAddr::BROADCAST, 0);
        let mut frame = DataFrame::empty(MType::UnconfirmedDataDown, header).into_frame();
        frame.beacon = Some(tag);
        frame
    }

    /// Attach a beacon tag
    pub fn with_beacon_tag(mut self, tag: BeaconTag) -> Self {
        self.beacon = Some(tag);
        self
    }

    /// Encoded bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the frame has no bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Beacon tag, if the frame is a beacon
    pub fn beacon_tag(&self) -> Option<BeaconTag> {
        self.beacon
    }

    /// Message type from the MHDR
    pub fn mtype(&self) -> Option<MType> {
        self.bytes.first().map(|&b| MType::from_mhdr(b))
    }
}

/// What a received frame means to this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameClass {
    /// Downlink addressed to this device
    ForUs(DataFrame),
    /// Broadcast carrying a beacon tag
    Beacon(BeaconTag),
    /// Broadcast without a beacon tag
    Broadcast(DataFrame),
    /// Downlink for another device
    ForOther(DevAddr),
    /// Uplink from another device
    Uplink,
    /// Could not be parsed
    Malformed(FrameError),
}

/// Classify a received frame for the device at `own`
pub fn classify(frame: &Frame, own: DevAddr) -> FrameClass {
    match frame.mtype() {
        Some(mtype) if mtype.is_uplink() => return FrameClass::Uplink,
        Some(_) => {}
        None => return FrameClass::Malformed(FrameError::TooShort { len: 0, min: 1 }),
    }
    let data = match DataFrame::parse(frame.bytes()) {
        Ok(data) => data,
        Err(err) => return FrameClass::Malformed(err),
    };
    let addr = data.header.dev_addr;
    if addr == own {
        FrameClass::ForUs(data)
    } else if addr.is_broadcast() {
        match frame.beacon_tag() {
            Some(tag) => FrameClass::Beacon(tag),
            None => FrameClass::Broadcast(data),
        }
    } else {
        FrameClass::ForOther(addr)
    }
}

/// Identifier of an application packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketId(pub u64);

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Application packet handed to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    /// Identifier
    pub id: PacketId,
    /// Application port
    pub f_port: u8,
    /// Application payload
    pub payload: Vec<u8>,
}

/// Final report for an application packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutcome {
    /// Transmissions spent on the packet
    pub attempts: u8,
    /// Acknowledged (confirmed) or sent (unconfirmed)
    pub success: bool,
    /// Start of the first transmission
    pub first_attempt: SimTime,
    /// The packet
    pub packet: Uplink,
}

/// Controller phase for the packet in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UplinkPhase {
    /// Nothing sent yet
    Idle,
    /// Transmitting, or waiting for RX1
    AwaitingFirstWindow,
    /// RX1 closed, waiting for RX2
    AwaitingSecondWindow,
    /// No acknowledgement yet, retransmission scheduled
    WaitingAckRetry,
    /// Outcome reported
    Done,
}

/// Retransmission state of the packet in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmissionState {
    /// Packet being sent
    pub packet: Uplink,
    /// Encoded frame, resent unchanged on every attempt
    pub frame: Frame,
    /// Transmissions still allowed
    pub attempts_remaining: u8,
    /// Transmission budget, first attempt included
    pub max_attempts: u8,
    /// Start of the first transmission
    pub first_attempt: SimTime,
    /// Confirmed packet still expecting its acknowledgement
    pub waiting_for_ack: bool,
}

impl RetransmissionState {
    /// Transmissions made so far
    pub fn attempts_used(&self) -> u8 {
        if self.waiting_for_ack {
            self.max_attempts - self.attempts_remaining
        } else {
            1
        }
    }

    fn into_outcome(self, success: bool) -> TxOutcome {
        TxOutcome {
            attempts: self.attempts_used(),
            success,
            first_attempt: self.first_attempt,
            packet: self.packet,
        }
    }
}

/// Timers of the controller
#[derive(Debug, Clone, Default)]
pub struct UplinkTimers {
    /// End of the transmission in progress
    pub tx_done: TimerHandle,
    /// Next retransmission
    pub retry: TimerHandle,
    /// Deferred application packet
    pub deferred: TimerHandle,
}

/// MAC layer state
#[derive(Debug, Clone)]
pub struct MacLayer {
    session: SessionState,
    confirmed: bool,
    adr_enabled: bool,
    data_rate: DataRate,
    tx_power: i8,
    max_transmissions: u8,
    retransmission: Option<RetransmissionState>,
    deferred: Option<Uplink>,
    phase: UplinkPhase,
    pending_answers: CommandList,
    next_packet_id: u64,
    rng: fastrand::Rng,
    pub(crate) timers: UplinkTimers,
}

impl MacLayer {
    /// Create new MAC layer state
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            session: SessionState::new(config.address),
            confirmed: config.confirmed,
            adr_enabled: config.adr_enabled,
            data_rate: config.data_rate,
            tx_power: config.tx_power,
            max_transmissions: config.max_transmissions,
            retransmission: None,
            deferred: None,
            phase: UplinkPhase::Idle,
            pending_answers: CommandList::new(),
            next_packet_id: 0,
            rng: fastrand::Rng::with_seed(config.seed),
            timers: UplinkTimers::default(),
        }
    }

    /// Get session state
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Device address
    pub fn address(&self) -> DevAddr {
        self.session.dev_addr
    }

    /// Current uplink data rate
    pub fn data_rate(&self) -> DataRate {
        self.data_rate
    }

    /// Set the uplink data rate
    pub fn set_data_rate(&mut self, data_rate: DataRate) {
        self.data_rate = data_rate;
    }

    /// Current transmit power in dBm
    pub fn tx_power(&self) -> i8 {
        self.tx_power
    }

    /// Whether uplinks are confirmed
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Packet in flight
    pub fn retransmission(&self) -> Option<&RetransmissionState> {
        self.retransmission.as_ref()
    }

    /// Whether a confirmed packet awaits its acknowledgement
    pub fn waiting_for_ack(&self) -> bool {
        self.retransmission
            .as_ref()
            .map_or(false, |r| r.waiting_for_ack)
    }

    /// Transmissions left for the packet in flight
    pub fn attempts_remaining(&self) -> Option<u8> {
        self.retransmission.as_ref().map(|r| r.attempts_remaining)
    }

    /// Controller phase
    pub fn phase(&self) -> UplinkPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: UplinkPhase) {
        self.phase = phase;
    }

    /// Controller timers
    pub fn timers(&self) -> &UplinkTimers {
        &self.timers
    }

    /// Answers waiting for the next uplink
    pub fn pending_answers(&self) -> &[MacCommand] {
        &self.pending_answers
    }

    /// Packet waiting for a deferred transmission
    pub fn deferred(&self) -> Option<&Uplink> {
        self.deferred.as_ref()
    }

    pub(crate) fn set_deferred(&mut self, packet: Uplink) -> Option<Uplink> {
        self.deferred.replace(packet)
    }

    pub(crate) fn take_deferred(&mut self) -> Option<Uplink> {
        self.deferred.take()
    }

    /// Wrap an application payload into a packet with a fresh identifier
    pub fn new_uplink(&mut self, f_port: u8, payload: Vec<u8>) -> Result<Uplink, FrameError> {
        if payload.len() > MAX_MAC_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_MAC_PAYLOAD_SIZE,
            });
        }
        self.next_packet_id += 1;
        Ok(Uplink {
            id: PacketId(self.next_packet_id),
            f_port,
            payload,
        })
    }

    /// Sample the ACK timeout, uniform in `[1 s, 3 s)`
    pub fn ack_timeout(&mut self) -> Duration {
        ACK_TIMEOUT_MIN + ACK_TIMEOUT_SPREAD.mul_f64(self.rng.f64())
    }

    /// Random source shared with channel selection
    pub(crate) fn rng(&mut self) -> &mut fastrand::Rng {
        &mut self.rng
    }

    /// Delay before the next transmission may start, at least `proposed`.
    ///
    /// - Waiting for an ACK: until RX2 of the last attempt opened plus a
    ///   fresh ACK timeout
    /// - Otherwise, while RX1/RX2 of the last uplink are still ahead: until
    ///   the last of them closes
    pub fn next_transmission_delay<C>(
        &mut self,
        windows: &WindowEngine,
        sim: &Simulator<C>,
        proposed: Duration,
    ) -> Duration {
        let now = sim.now();
        if self.waiting_for_ack() {
            let rx2_open = windows.second_window_open_time().unwrap_or(now);
            let ack_timeout = self.ack_timeout();
            return proposed.max((rx2_open + ack_timeout).saturating_duration_since(now));
        }
        match windows.uplink_windows_end(sim) {
            Some(end) => proposed.max(end.saturating_duration_since(now)),
            None => proposed,
        }
    }

    /// Start a new packet. Returns the outcome of the packet it replaces,
    /// if one was still in flight.
    pub(crate) fn begin(&mut self, packet: Uplink, now: SimTime) -> Option<TxOutcome> {
        let superseded = self.retransmission.take().map(|old| {
            let delivered = !old.waiting_for_ack;
            warn!(
                "packet {} superseded after {} transmissions",
                old.packet.id,
                old.attempts_used()
            );
            old.into_outcome(delivered)
        });
        let frame = self.build_frame(&packet);
        let (attempts_remaining, waiting_for_ack) = if self.confirmed {
            (self.max_transmissions - 1, true)
        } else {
            (self.max_transmissions, false)
        };
        self.retransmission = Some(RetransmissionState {
            packet,
            frame,
            attempts_remaining,
            max_attempts: self.max_transmissions,
            first_attempt: now,
            waiting_for_ack,
        });
        self.phase = UplinkPhase::AwaitingFirstWindow;
        superseded
    }

    fn build_frame(&mut self, packet: &Uplink) -> Frame {
        let mut header = FrameHeader::new(self.session.dev_addr, self.session.fcnt_up as u16);
        header.f_ctrl.adr = self.adr_enabled;
        for answer in self.pending_answers.iter() {
            if let Err(err) = answer.encode(&mut header.f_opts) {
                warn!("MAC answer not sent: {}", err);
                break;
            }
        }
        self.pending_answers.clear();
        self.session.increment_fcnt_up();
        let mtype = if self.confirmed {
            MType::ConfirmedDataUp
        } else {
            MType::UnconfirmedDataUp
        };
        DataFrame::new(mtype, header, packet.f_port, &packet.payload).into_frame()
    }

    /// Spend one retransmission. Returns false when none is left.
    pub(crate) fn consume_retry(&mut self) -> bool {
        match self.retransmission.as_mut() {
            Some(r) if r.waiting_for_ack && r.attempts_remaining > 0 => {
                r.attempts_remaining -= 1;
                self.phase = UplinkPhase::AwaitingFirstWindow;
                true
            }
            _ => false,
        }
    }

    /// Step the data rate down on retransmissions with an even number of
    /// attempts left. Returns whether it did.
    pub(crate) fn apply_adr_backoff(&mut self) -> bool {
        let Some(r) = self.retransmission.as_ref() else {
            return false;
        };
        if self.adr_enabled
            && self.data_rate.index() > 0
            && r.attempts_remaining < r.max_attempts
            && r.attempts_remaining % 2 == 0
        {
            self.tx_power = BACKOFF_TX_POWER;
            self.data_rate = self.data_rate.step_down();
            info!(
                "data rate lowered to DR{} ({} attempts left)",
                self.data_rate.index(),
                r.attempts_remaining
            );
            return true;
        }
        false
    }

    /// Transmission parameters at the current data rate
    pub fn tx_params(&self) -> TxParams {
        TxParams::new(self.data_rate.modulation())
    }

    /// Frame of the packet in flight
    pub fn current_frame(&self) -> Option<&Frame> {
        self.retransmission.as_ref().map(|r| &r.frame)
    }

    /// End the packet in flight and produce its outcome
    pub(crate) fn finish(&mut self, success: bool) -> Option<TxOutcome> {
        let outcome = self.retransmission.take()?.into_outcome(success);
        self.phase = UplinkPhase::Done;
        Some(outcome)
    }

    /// Classify a received frame
    pub fn classify(&self, frame: &Frame) -> FrameClass {
        classify(frame, self.session.dev_addr)
    }

    /// Process a downlink addressed to this device
    pub fn on_downlink(&mut self, frame: &DataFrame, phy: &mut PhyConfig) {
        self.session.update_fcnt_down(u32::from(frame.header.f_cnt));
        if self.waiting_for_ack() && !frame.header.f_ctrl.ack {
            debug!("downlink without ACK bit accepted as acknowledgement");
        }
        for command in frame.commands() {
            self.handle_command(command, phy);
        }
    }

    /// Apply a downlink MAC command and queue its answer
    pub fn handle_command(&mut self, command: MacCommand, phy: &mut PhyConfig) {
        match command {
            MacCommand::RxParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                frequency,
            } => {
                self.on_rx_param_setup(rx1_dr_offset, rx2_data_rate, frequency, phy);
            }
            MacCommand::RxTimingSetupReq { delay } => {
                phy.timing = TimingParams::from_delay_setting(delay);
                info!("RX1 delay set to {} s", delay.max(1));
                self.queue_answer(MacCommand::RxTimingSetupAns);
            }
            MacCommand::RxParamSetupAns { .. } | MacCommand::RxTimingSetupAns => {
                debug!("ignoring uplink command in downlink");
            }
        }
    }

    /// RXParamSetupReq: the new parameters are applied as received and the
    /// answer reports which of them are valid
    pub fn on_rx_param_setup(
        &mut self,
        rx1_dr_offset: u8,
        rx2_data_rate: DataRate,
        frequency: u32,
        phy: &mut PhyConfig,
    ) -> MacCommand {
        let offset_ok = rx1_dr_offset <= MAX_RX1_DR_OFFSET;
        let data_rate_ok = rx2_data_rate.is_valid();
        if !(offset_ok && data_rate_ok) {
            warn!(
                "RXParamSetupReq out of range (offset {}, DR{}), applied anyway",
                rx1_dr_offset,
                rx2_data_rate.index()
            );
        }
        phy.rx1_dr_offset = rx1_dr_offset;
        phy.rx2_data_rate = rx2_data_rate;
        phy.rx2_frequency = frequency;
        info!(
            "RX2 set to {} Hz DR{}, RX1 offset {}",
            frequency,
            rx2_data_rate.index(),
            rx1_dr_offset
        );
        let answer = MacCommand::RxParamSetupAns {
            rx1_dr_offset_ack: offset_ok,
            rx2_data_rate_ack: data_rate_ok,
            channel_ack: true,
        };
        self.queue_answer(answer);
        answer
    }

    fn queue_answer(&mut self, answer: MacCommand) {
        if self.pending_answers.push(answer).is_err() {
            warn!("MAC answer queue full");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::commands::encode_commands;

    fn downlink(addr: DevAddr, f_opts: &[MacCommand]) -> DataFrame {
        let mut header = FrameHeader::new(addr, 3);
        header.f_ctrl.ack = true;
        header.f_opts = encode_commands(f_opts).unwrap();
        DataFrame::empty(MType::UnconfirmedDataDown, header)
    }

    #[test]
    fn test_fctrl_byte() {
        let f_ctrl = FCtrl {
            adr: true,
            adr_ack_req: false,
            ack: true,
            f_pending: false,
            f_opts_len: 5,
        };
        assert_eq!(f_ctrl.to_byte(), 0xA5);
        assert_eq!(FCtrl::from_byte(0xA5), f_ctrl);
    }

    #[test]
    fn test_data_frame_layout() {
        let addr = DevAddr::from_u32(0x0102_0304);
        let frame = DataFrame::new(
            MType::ConfirmedDataUp,
            FrameHeader::new(addr, 0x0A0B),
            10,
            &[0xAA, 0xBB],
        );
        let bytes = frame.encode();
        assert_eq!(
            bytes,
            vec![0x80, 0x04, 0x03, 0x02, 0x01, 0x00, 0x0B, 0x0A, 10, 0xAA, 0xBB]
        );
        assert_eq!(DataFrame::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            DataFrame::parse(&[0x60, 1, 2]),
            Err(FrameError::TooShort { len: 2, min: 7 })
        );
        assert_eq!(
            DataFrame::parse(&[0x20, 0, 0, 0, 0, 0, 0, 0]),
            Err(FrameError::UnsupportedMType(0x20))
        );
        // FOpts length beyond the frame
        assert_eq!(
            DataFrame::parse(&[0x60, 1, 0, 0, 0, 0x03, 0, 0]),
            Err(FrameError::TooShort { len: 7, min: 10 })
        );
    }

    #[test]
    fn test_classification() {
        let own = DevAddr::from_u32(0x0000_0748);
        let other = DevAddr::from_u32(0x0000_0749);

        let frame = downlink(own, &[]).into_frame();
        assert!(matches!(classify(&frame, own), FrameClass::ForUs(_)));

        let frame = downlink(other, &[]).into_frame();
        assert_eq!(classify(&frame, own), FrameClass::ForOther(other));

        let beacon = Frame::beacon(BeaconTag::new(128));
        assert_eq!(
            classify(&beacon, own),
            FrameClass::Beacon(BeaconTag::new(128))
        );

        let broadcast = downlink(DevAddr::BROADCAST, &[]).into_frame();
        assert!(matches!(classify(&broadcast, own), FrameClass::Broadcast(_)));

        let uplink = DataFrame::empty(MType::UnconfirmedDataUp, FrameHeader::new(own, 0)).into_frame();
        assert_eq!(classify(&uplink, own), FrameClass::Uplink);

        assert!(matches!(
            classify(&Frame::new(vec![0x60, 0x01]), own),
            FrameClass::Malformed(_)
        ));
    }

    #[test]
    fn test_ack_timeout_range() {
        let mut mac = MacLayer::new(&DeviceConfig::default().with_seed(42));
        for _ in 0..1000 {
            let t = mac.ack_timeout();
            assert!(t >= Duration::from_secs(1) && t < Duration::from_secs(3));
        }
    }

    #[test]
    fn test_confirmed_attempt_accounting() {
        let config = DeviceConfig::default().with_confirmed(3);
        let mut mac = MacLayer::new(&config);
        let packet = mac.new_uplink(1, vec![1, 2, 3]).unwrap();
        assert!(mac.begin(packet, SimTime::from_secs(1)).is_none());
        assert_eq!(mac.attempts_remaining(), Some(2));
        assert!(mac.waiting_for_ack());
        assert_eq!(mac.current_frame().unwrap().mtype(), Some(MType::ConfirmedDataUp));
        assert_eq!(mac.session().fcnt_up, 1);

        assert!(mac.consume_retry());
        assert!(mac.consume_retry());
        assert!(!mac.consume_retry());
        assert_eq!(mac.attempts_remaining(), Some(0));

        let outcome = mac.finish(false).unwrap();
        assert_eq!(outcome.attempts, 3);
        assert!(!outcome.success);
        assert_eq!(outcome.first_attempt, SimTime::from_secs(1));
        assert_eq!(outcome.packet.payload, vec![1, 2, 3]);
        assert_eq!(mac.phase(), UplinkPhase::Done);
        // retransmissions do not advance the frame counter
        assert_eq!(mac.session().fcnt_up, 1);
    }

    #[test]
    fn test_unconfirmed_outcome() {
        let mut mac = MacLayer::new(&DeviceConfig::default());
        let packet = mac.new_uplink(1, vec![]).unwrap();
        mac.begin(packet, SimTime::ZERO);
        assert!(!mac.waiting_for_ack());
        assert!(!mac.consume_retry());
        let outcome = mac.finish(true).unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.success);
    }

    #[test]
    fn test_new_packet_supersedes_old() {
        let mut mac = MacLayer::new(&DeviceConfig::default().with_confirmed(4));
        let first = mac.new_uplink(1, vec![1]).unwrap();
        let second = mac.new_uplink(1, vec![2]).unwrap();
        mac.begin(first.clone(), SimTime::ZERO);
        mac.consume_retry();
        let outcome = mac.begin(second, SimTime::from_secs(10)).unwrap();
        assert_eq!(outcome.packet, first);
        assert_eq!(outcome.attempts, 2);
        assert!(!outcome.success);
        assert_eq!(mac.attempts_remaining(), Some(3));
    }

    #[test]
    fn test_adr_backoff_on_even_attempts_left() {
        let config = DeviceConfig::default()
            .with_confirmed(8)
            .with_adr(true)
            .with_data_rate(DataRate::DR5);
        let mut mac = MacLayer::new(&config);
        let packet = mac.new_uplink(1, vec![]).unwrap();
        mac.begin(packet, SimTime::ZERO);
        // 7 left: no back-off
        assert!(!mac.apply_adr_backoff());
        assert_eq!(mac.data_rate(), DataRate::DR5);
        // 6 left
        mac.consume_retry();
        assert!(mac.apply_adr_backoff());
        assert_eq!(mac.data_rate(), DataRate::DR4);
        assert_eq!(mac.tx_power(), BACKOFF_TX_POWER);
        // 5 left
        mac.consume_retry();
        assert!(!mac.apply_adr_backoff());
        // 4 left
        mac.consume_retry();
        assert!(mac.apply_adr_backoff());
        assert_eq!(mac.data_rate(), DataRate::DR3);
    }

    #[test]
    fn test_adr_backoff_stops_at_dr0() {
        let config = DeviceConfig::default()
            .with_confirmed(3)
            .with_adr(true)
            .with_data_rate(DataRate::DR0);
        let mut mac = MacLayer::new(&config);
        let packet = mac.new_uplink(1, vec![]).unwrap();
        mac.begin(packet, SimTime::ZERO);
        assert!(!mac.apply_adr_backoff());
        assert_eq!(mac.data_rate(), DataRate::DR0);
    }

    #[test]
    fn test_rx_param_setup_answer() {
        let mut mac = MacLayer::new(&DeviceConfig::default());
        let mut phy = PhyConfig::default();
        let answer = mac.on_rx_param_setup(2, DataRate::DR3, 869_100_000, &mut phy);
        assert_eq!(
            answer,
            MacCommand::RxParamSetupAns {
                rx1_dr_offset_ack: true,
                rx2_data_rate_ack: true,
                channel_ack: true,
            }
        );
        assert_eq!(phy.rx2_frequency, 869_100_000);
        assert_eq!(phy.rx2_data_rate, DataRate::DR3);
        assert_eq!(phy.rx1_dr_offset, 2);
        assert_eq!(mac.pending_answers(), &[answer]);

        let answer = mac.on_rx_param_setup(3, DataRate::from_index(9), 869_525_000, &mut phy);
        assert_eq!(
            answer,
            MacCommand::RxParamSetupAns {
                rx1_dr_offset_ack: true,
                rx2_data_rate_ack: false,
                channel_ack: true,
            }
        );
    }

    #[test]
    fn test_answers_ride_next_uplink() {
        let mut mac = MacLayer::new(&DeviceConfig::default());
        let mut phy = PhyConfig::default();
        let request = downlink(
            mac.address(),
            &[MacCommand::RxTimingSetupReq { delay: 3 }],
        );
        mac.on_downlink(&request, &mut phy);
        assert_eq!(phy.timing.rx1_delay, Duration::from_secs(3));
        assert_eq!(mac.session().fcnt_down, 3);
        assert_eq!(mac.pending_answers(), &[MacCommand::RxTimingSetupAns]);

        let packet = mac.new_uplink(2, vec![9]).unwrap();
        mac.begin(packet, SimTime::ZERO);
        let sent = DataFrame::parse(mac.current_frame().unwrap().bytes()).unwrap();
        assert_eq!(sent.header.f_opts.as_slice(), &[0x08]);
        assert!(mac.pending_answers().is_empty());
    }

    #[test]
    fn test_payload_limit() {
        let mut mac = MacLayer::new(&DeviceConfig::default());
        assert_eq!(
            mac.new_uplink(1, vec![0; 243]),
            Err(FrameError::PayloadTooLarge { len: 243, max: 242 })
        );
        assert!(mac.new_uplink(1, vec![0; 242]).is_ok());
    }
}
