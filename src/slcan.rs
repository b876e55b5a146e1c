//! SLCAN command parsing and reply/report encoding.
//!
//! Commands arrive as CR-terminated ASCII lines. The first byte selects the
//! command, the rest is a hex payload. Replies are CR-terminated as well; a
//! rejected command is answered with a single BELL byte by the caller.

use core::fmt::Write as _;

use bitflags::bitflags;
use embedded_can::{ExtendedId, Id, StandardId};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::bitrate::{BitrateConfig, BitrateError, DataBitrate, NominalBitrate};
use crate::can::{BusEvent, CanDevice, CanError, CanMode, CanTransport, FilterConfig};
use crate::codec::{hex_digit_to_u8, nibbles_to_u32, push_hex_bytes, push_hex_u16, push_hex_u32, push_hex_u8, to_hex_digit};
use crate::error::{ErrorRegister, StatusFlags};
use crate::frame::{Can2Frame, CanFdFrame, CanFrame, FdDataLengthCode, FrameFormat, IdExt, IdKind};
use crate::nvm::{Nvm, NvmError, NvmStore};

/// Longest line the protocol produces: echo prefix and type tag, extended
/// identifier, DLC digit, 64 data bytes in hex, microsecond timestamp, ESI
/// digit and the terminating CR.
pub const SLCAN_MTU: usize = 2 + 8 + 1 + 128 + 8 + 1 + 1;

pub const OK: &[u8] = b"\r";
pub const BELL: u8 = 0x07;

const VERSION_REPLY: &[u8] = b"V0101\r";
const VERSION_DETAIL_REPLY: &[u8] =
    concat!("v: hardware=\"rev A\", software=\"", env!("CARGO_PKG_VERSION"), "\"\r").as_bytes();
const CONTROLLER_REPLY: &[u8] = b"I30A0\r";
const CONTROLLER_DETAIL_REPLY: &[u8] = b"i: protocol=\"ISO-CANFD\", clock_mhz=160\r";

/// Timestamp field appended to reported frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = SlcanParseError, constructor = SlcanParseError::InvalidTimestampMode))]
#[repr(u8)]
pub enum TimestampMode {
    #[default]
    Off = 0,
    /// Wall-clock milliseconds, four hex digits, wraps at one minute.
    Milliseconds = 1,
    /// Bus-time microseconds, eight hex digits, wraps at one hour.
    Microseconds = 2,
}

/// Channel mode restored automatically at power-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = SlcanParseError, constructor = SlcanParseError::InvalidStartupMode))]
#[repr(u8)]
pub enum AutoStartupMode {
    #[default]
    Off = 0,
    Normal = 1,
    ListenOnly = 2,
}

bitflags! {
    /// What gets forwarded to the host while the channel is open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReportFlags: u8 {
        const RX = 1 << 0;
        const TX = 1 << 1;
        const ESI = 1 << 4;
    }
}

impl Default for ReportFlags {
    fn default() -> Self {
        ReportFlags::RX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlcanParseError {
    #[error("empty command line")]
    Empty,
    #[error("unrecognized command ({0:?})")]
    UnrecognizedCommand(u8),
    #[error("command line has the wrong length ({0:?})")]
    InvalidLength(usize),
    #[error("illegal hex digit ({0:?})")]
    IllegalHexDigit(u8),
    #[error("standard identifier ({0:?}) out of range")]
    StandardIdOutOfRange(u16),
    #[error("extended identifier ({0:?}) out of range")]
    ExtendedIdOutOfRange(u32),
    #[error("invalid data length code ({0:?})")]
    InvalidDataLengthCode(u8),
    #[error("invalid timestamp mode ({0:?})")]
    InvalidTimestampMode(u8),
    #[error("invalid auto-startup mode ({0:?})")]
    InvalidStartupMode(u8),
    #[error("unsupported filter mode ({0:?})")]
    UnsupportedFilterMode(u8),
    #[error(transparent)]
    Bitrate(#[from] BitrateError),
}

/// A fully decoded command line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlcanCommand {
    Open(CanMode),
    Close,
    SetNominalPreset(NominalBitrate),
    SetNominalTiming(BitrateConfig),
    SetDataPreset(DataBitrate),
    SetDataTiming(BitrateConfig),
    Transmit(CanFrame),
    Version,
    VersionDetail,
    ControllerInfo,
    ControllerInfoDetail,
    GetSerial,
    SetSerial(u16),
    Status,
    StatusDetail,
    SetTimestampMode(TimestampMode),
    SetReportConfig {
        timestamp: TimestampMode,
        #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
        report: ReportFlags,
    },
    SetDualFilterMode,
    SetFilterCode(u32),
    SetFilterMask(u32),
    SetAutoStartup(AutoStartupMode),
    Debug,
}

fn expect_nibbles(nibbles: &[u8], count: usize, line_len: usize) -> Result<(), SlcanParseError> {
    if nibbles.len() == count {
        Ok(())
    } else {
        Err(SlcanParseError::InvalidLength(line_len))
    }
}

fn timing_from_nibbles(n: &[u8]) -> BitrateConfig {
    BitrateConfig::new(
        ((n[0] as u16) << 4) | n[1] as u16,
        ((n[2] as u16) << 4) | n[3] as u16,
        ((n[4] as u16) << 4) | n[5] as u16,
        ((n[6] as u16) << 4) | n[7] as u16,
    )
}

/// Decodes one command line (without the CR).
pub fn parse_command(line: &[u8]) -> Result<SlcanCommand, SlcanParseError> {
    let (&tag, payload) = line.split_first().ok_or(SlcanParseError::Empty)?;

    // The debug query carries no hex payload.
    if tag == b'?' {
        return if payload.is_empty() {
            Ok(SlcanCommand::Debug)
        } else {
            Err(SlcanParseError::InvalidLength(line.len()))
        };
    }

    let mut nibbles: heapless::Vec<u8, SLCAN_MTU> = heapless::Vec::new();
    for &byte in payload {
        let nibble = hex_digit_to_u8(byte).ok_or(SlcanParseError::IllegalHexDigit(byte))?;
        nibbles
            .push(nibble)
            .map_err(|_| SlcanParseError::InvalidLength(line.len()))?;
    }
    let n = &nibbles[..];

    match tag {
        b'O' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::Open(CanMode::Normal))
        }
        b'L' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::Open(CanMode::ListenOnly))
        }
        b'+' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::Open(CanMode::LoopbackExternal))
        }
        b'=' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::Open(CanMode::LoopbackInternal))
        }
        b'C' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::Close)
        }
        b'S' => {
            expect_nibbles(n, 1, line.len())?;
            Ok(SlcanCommand::SetNominalPreset(NominalBitrate::try_from(n[0])?))
        }
        b'Y' => {
            expect_nibbles(n, 1, line.len())?;
            Ok(SlcanCommand::SetDataPreset(DataBitrate::try_from(n[0])?))
        }
        b's' => {
            expect_nibbles(n, 8, line.len())?;
            Ok(SlcanCommand::SetNominalTiming(timing_from_nibbles(n)))
        }
        b'y' => {
            expect_nibbles(n, 8, line.len())?;
            Ok(SlcanCommand::SetDataTiming(timing_from_nibbles(n)))
        }
        b't' | b'T' | b'r' | b'R' | b'd' | b'D' | b'b' | b'B' => parse_transmit(tag, n, line.len()),
        b'V' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::Version)
        }
        b'v' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::VersionDetail)
        }
        b'I' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::ControllerInfo)
        }
        b'i' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::ControllerInfoDetail)
        }
        b'N' => match n.len() {
            0 => Ok(SlcanCommand::GetSerial),
            4 => Ok(SlcanCommand::SetSerial(nibbles_to_u32(n) as u16)),
            _ => Err(SlcanParseError::InvalidLength(line.len())),
        },
        b'F' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::Status)
        }
        b'f' => {
            expect_nibbles(n, 0, line.len())?;
            Ok(SlcanCommand::StatusDetail)
        }
        b'Z' => {
            expect_nibbles(n, 1, line.len())?;
            Ok(SlcanCommand::SetTimestampMode(TimestampMode::try_from(n[0])?))
        }
        b'z' => {
            // Second digit is reserved, the last two form the report byte.
            expect_nibbles(n, 4, line.len())?;
            Ok(SlcanCommand::SetReportConfig {
                timestamp: TimestampMode::try_from(n[0])?,
                report: ReportFlags::from_bits_retain((n[2] << 4) | n[3]),
            })
        }
        b'W' => {
            expect_nibbles(n, 1, line.len())?;
            if n[0] != 2 {
                return Err(SlcanParseError::UnsupportedFilterMode(n[0]));
            }
            Ok(SlcanCommand::SetDualFilterMode)
        }
        b'M' => {
            expect_nibbles(n, 8, line.len())?;
            Ok(SlcanCommand::SetFilterCode(nibbles_to_u32(n)))
        }
        b'm' => {
            expect_nibbles(n, 8, line.len())?;
            Ok(SlcanCommand::SetFilterMask(nibbles_to_u32(n)))
        }
        b'Q' => {
            expect_nibbles(n, 1, line.len())?;
            Ok(SlcanCommand::SetAutoStartup(AutoStartupMode::try_from(n[0])?))
        }
        _ => Err(SlcanParseError::UnrecognizedCommand(tag)),
    }
}

fn parse_transmit(tag: u8, n: &[u8], line_len: usize) -> Result<SlcanCommand, SlcanParseError> {
    let extended = tag.is_ascii_uppercase();
    let id_nibbles = if extended { 8 } else { 3 };

    if n.len() < id_nibbles + 1 {
        return Err(SlcanParseError::InvalidLength(line_len));
    }

    let raw_id = nibbles_to_u32(&n[..id_nibbles]);
    let id: Id = if extended {
        ExtendedId::new(raw_id)
            .ok_or(SlcanParseError::ExtendedIdOutOfRange(raw_id))?
            .into()
    } else {
        StandardId::new(raw_id as u16)
            .ok_or(SlcanParseError::StandardIdOutOfRange(raw_id as u16))?
            .into()
    };

    let dlc = n[id_nibbles];
    let payload = &n[id_nibbles + 1..];

    let frame: CanFrame = match tag {
        b't' | b'T' => {
            if dlc > 8 {
                return Err(SlcanParseError::InvalidDataLengthCode(dlc));
            }
            if payload.len() != dlc as usize * 2 {
                return Err(SlcanParseError::InvalidLength(line_len));
            }
            let mut data: heapless::Vec<u8, 8> = heapless::Vec::new();
            for pair in payload.chunks_exact(2) {
                let _ = data.push((pair[0] << 4) | pair[1]);
            }
            Can2Frame::new_data(id, &data)
                .ok_or(SlcanParseError::InvalidDataLengthCode(dlc))?
                .into()
        }
        b'r' | b'R' => {
            // Remote frames carry their raw DLC but no data bytes.
            if !payload.is_empty() {
                return Err(SlcanParseError::InvalidLength(line_len));
            }
            Can2Frame::new_remote(id, dlc as usize)
                .ok_or(SlcanParseError::InvalidDataLengthCode(dlc))?
                .into()
        }
        _ => {
            let code = FdDataLengthCode::try_from(dlc)
                .map_err(|_| SlcanParseError::InvalidDataLengthCode(dlc))?;
            if payload.len() != code.get_num_bytes() * 2 {
                return Err(SlcanParseError::InvalidLength(line_len));
            }
            let mut data: heapless::Vec<u8, 64> = heapless::Vec::new();
            for pair in payload.chunks_exact(2) {
                let _ = data.push((pair[0] << 4) | pair[1]);
            }
            CanFdFrame::new(id, &data)
                .ok_or(SlcanParseError::InvalidDataLengthCode(dlc))?
                .with_bit_rate_switched(matches!(tag, b'b' | b'B'))
                .into()
        }
    };

    Ok(SlcanCommand::Transmit(frame))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlcanExecuteError {
    #[error("command requires a closed channel")]
    ChannelOpen,
    #[error("command requires an open channel")]
    ChannelClosed,
    #[error(transparent)]
    Can(#[from] CanError),
    #[error(transparent)]
    Nvm(#[from] NvmError),
}

/// Wall-clock accumulators behind the reported timestamps.
///
/// The millisecond clock wraps at one minute. The microsecond clock wraps at
/// one hour and is derived from the 16-bit bus time counter: the counter
/// wraps every 65.536 ms, so the elapsed milliseconds pick the number of
/// whole counter periods to add back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampClock {
    wall_ms: u32,
    wall_us: u32,
    last_tick_ms: u32,
    last_stamp_us: u16,
}

impl TimestampClock {
    pub const fn new() -> Self {
        Self {
            wall_ms: 0,
            wall_us: 0,
            last_tick_ms: 0,
            last_stamp_us: 0,
        }
    }

    pub fn reset(&mut self, now_ms: u32, stamp_us: u16) {
        self.wall_ms = 0;
        self.wall_us = 0;
        self.last_tick_ms = now_ms;
        self.last_stamp_us = stamp_us;
    }

    fn next_ms(&mut self, now_ms: u32) -> u16 {
        let delta = now_ms.wrapping_sub(self.last_tick_ms);
        self.wall_ms = (self.wall_ms + delta) % 60_000;
        self.last_tick_ms = now_ms;
        self.wall_ms as u16
    }

    fn next_us(&mut self, now_ms: u32, stamp_us: u16) -> u32 {
        let raw_us = stamp_us.wrapping_sub(self.last_stamp_us) as u32;
        let elapsed_ms = now_ms.wrapping_sub(self.last_tick_ms);

        // Whole 16-bit counter periods elapsed since the previous frame,
        // rounded to the nearest period. Clamped for a tick that lags the
        // bus counter.
        let periods = ((elapsed_ms as i64 * 1000 - raw_us as i64 + 0x8000) / 0x10000).max(0);
        let delta_us = raw_us as u64 + periods as u64 * 0x10000;

        self.wall_us = ((self.wall_us as u64 + delta_us) % 3_600_000_000) as u32;
        self.last_tick_ms = now_ms;
        self.last_stamp_us = stamp_us;
        self.wall_us
    }
}

/// Host-facing protocol state: report configuration, timestamp clock and the
/// staged filter code/mask pair.
pub struct SlcanInterface {
    timestamp_mode: TimestampMode,
    report: ReportFlags,
    clock: TimestampClock,
    filter_code: u32,
    filter_mask: u32,
}

impl SlcanInterface {
    pub const fn new() -> Self {
        Self {
            timestamp_mode: TimestampMode::Off,
            report: ReportFlags::RX,
            clock: TimestampClock::new(),
            filter_code: 0,
            filter_mask: 0xFFFF_FFFF,
        }
    }

    pub fn timestamp_mode(&self) -> TimestampMode {
        self.timestamp_mode
    }

    pub fn set_timestamp_mode(&mut self, mode: TimestampMode) {
        self.timestamp_mode = mode;
    }

    pub fn report(&self) -> ReportFlags {
        self.report
    }

    /// Runs one decoded command against the channel and settings store.
    /// Successful commands answer through `reply` with one or more
    /// CR-terminated lines, except a transmit while TX reporting is on,
    /// which is acknowledged by its later echo. A returned error means the
    /// caller answers with BELL.
    pub fn execute<D: CanDevice, S: NvmStore>(
        &mut self,
        command: SlcanCommand,
        can: &mut CanTransport<D>,
        nvm: &mut Nvm<S>,
        errors: &mut ErrorRegister,
        now_ms: u32,
        reply: &mut impl FnMut(&[u8]),
    ) -> Result<(), SlcanExecuteError> {
        match command {
            SlcanCommand::Open(mode) => {
                errors.clear();
                can.clear_cycle_time();
                can.set_mode(mode)?;
                can.open()?;
                self.clock.reset(now_ms, can.device().timestamp_counter());
                reply(OK);
            }
            SlcanCommand::Close => {
                can.close()?;
                errors.clear();
                can.clear_cycle_time();
                reply(OK);
            }
            SlcanCommand::SetNominalPreset(preset) => {
                can.set_nominal_preset(preset)?;
                reply(OK);
            }
            SlcanCommand::SetNominalTiming(timing) => {
                can.set_nominal_timing(timing)?;
                reply(OK);
            }
            SlcanCommand::SetDataPreset(preset) => {
                can.set_data_preset(preset)?;
                reply(OK);
            }
            SlcanCommand::SetDataTiming(timing) => {
                can.set_data_timing(timing)?;
                reply(OK);
            }
            SlcanCommand::Transmit(frame) => {
                let extended = frame.id().kind() == IdKind::Extended;
                can.enqueue(frame, errors, now_ms)?;
                // With TX reporting on, nothing is sent now; the echo after
                // transmission acts as the acknowledgement
                if !self.report.contains(ReportFlags::TX) {
                    reply(if extended { b"Z\r" } else { b"z\r" });
                }
            }
            SlcanCommand::Version => reply(VERSION_REPLY),
            SlcanCommand::VersionDetail => reply(VERSION_DETAIL_REPLY),
            SlcanCommand::ControllerInfo => reply(CONTROLLER_REPLY),
            SlcanCommand::ControllerInfoDetail => reply(CONTROLLER_DETAIL_REPLY),
            SlcanCommand::GetSerial => {
                let serial = nvm.serial_number().unwrap_or(0xFFFF);
                let mut out: heapless::Vec<u8, 8> = heapless::Vec::new();
                let _ = out.push(b'N');
                push_hex_u16(&mut out, serial);
                let _ = out.push(b'\r');
                reply(&out);
            }
            SlcanCommand::SetSerial(serial) => {
                nvm.set_serial_number(serial)?;
                reply(OK);
            }
            SlcanCommand::Status => {
                if !can.is_open() {
                    return Err(SlcanExecuteError::ChannelClosed);
                }
                let status = StatusFlags::from_register(errors);
                let mut out: heapless::Vec<u8, 8> = heapless::Vec::new();
                let _ = out.push(b'F');
                push_hex_u8(&mut out, status.bits());
                let _ = out.push(b'\r');
                reply(&out);
                // Reading the status byte acknowledges the errors
                errors.clear();
            }
            SlcanCommand::StatusDetail => {
                if !can.is_open() {
                    return Err(SlcanExecuteError::ChannelClosed);
                }
                let health = *can.health();
                let node = if health.bus_off {
                    "BUS_OFF"
                } else if health.error_passive {
                    "ER_PSSV"
                } else {
                    "ER_ACTV"
                };
                let load_ppm = can.bus_load_ppm();
                let percent = if load_ppm >= 990_000 {
                    99
                } else {
                    (load_ppm / 50_000) * 5
                };
                let mut text: heapless::String<128> = heapless::String::new();
                let _ = write!(
                    text,
                    "f: node_sts={}, last_err_code={}, err_cnt_tx_rx=[0x{:02X}, 0x{:02X}], est_bus_load_percent={:02}\r",
                    node,
                    health.last_error.mnemonic(),
                    health.tec,
                    health.rec,
                    percent,
                );
                reply(text.as_bytes());
            }
            SlcanCommand::SetTimestampMode(mode) => {
                if can.is_open() {
                    return Err(SlcanExecuteError::ChannelOpen);
                }
                self.timestamp_mode = mode;
                self.report = ReportFlags::RX;
                self.clock.reset(now_ms, can.device().timestamp_counter());
                reply(OK);
            }
            SlcanCommand::SetReportConfig { timestamp, report } => {
                if can.is_open() {
                    return Err(SlcanExecuteError::ChannelOpen);
                }
                self.timestamp_mode = timestamp;
                self.report = report;
                self.clock.reset(now_ms, can.device().timestamp_counter());
                reply(OK);
            }
            SlcanCommand::SetDualFilterMode => {
                // Dual filter is the only supported arrangement
                if can.is_open() {
                    return Err(SlcanExecuteError::ChannelOpen);
                }
                reply(OK);
            }
            SlcanCommand::SetFilterCode(code) => {
                if can.is_open() {
                    return Err(SlcanExecuteError::ChannelOpen);
                }
                self.filter_code = code;
                self.apply_filters(can)?;
                reply(OK);
            }
            SlcanCommand::SetFilterMask(mask) => {
                if can.is_open() {
                    return Err(SlcanExecuteError::ChannelOpen);
                }
                self.filter_mask = mask;
                self.apply_filters(can)?;
                reply(OK);
            }
            SlcanCommand::SetAutoStartup(mode) => {
                // Armed from the running configuration, so the channel must
                // already be open with the settings to restore.
                if !can.is_open() {
                    return Err(SlcanExecuteError::ChannelClosed);
                }
                nvm.save_startup(
                    mode,
                    self.timestamp_mode,
                    can.nominal_timing(),
                    can.data_timing(),
                    can.std_filter(),
                    can.ext_filter(),
                )?;
                reply(OK);
            }
            SlcanCommand::Debug => {
                let avg_us = (can.cycle_avg_time_ns() / 1000).min(255) as u8;
                let max_us = (can.cycle_max_time_ns() / 1000).min(255) as u8;
                let mut out: heapless::Vec<u8, 8> = heapless::Vec::new();
                let _ = out.push(b'?');
                push_hex_u8(&mut out, avg_us);
                let _ = out.push(b'-');
                push_hex_u8(&mut out, max_us);
                let _ = out.push(b'\r');
                reply(&out);
                can.clear_cycle_time();
            }
        }

        Ok(())
    }

    /// Maps the staged SJA1000-style code/mask pair onto the two hardware
    /// filters. The top bit of the pair routes it: when the mask marks the
    /// top bit as relevant, a set code bit leaves only the standard filter
    /// active and a clear one only the extended filter. The mask is inverted
    /// on the way down (protocol: 1 = don't care, hardware: 1 = must match).
    fn apply_filters<D: CanDevice>(&self, can: &mut CanTransport<D>) -> Result<(), CanError> {
        let top_relevant = self.filter_mask >> 31 == 0;
        let code_top = self.filter_code >> 31 != 0;

        can.set_std_filter(FilterConfig {
            enabled: !(top_relevant && !code_top),
            code: self.filter_code & 0x7FF,
            mask: !self.filter_mask & 0x7FF,
        })?;
        can.set_ext_filter(FilterConfig {
            enabled: !(top_relevant && code_top),
            code: self.filter_code & 0x1FFF_FFFF,
            mask: !self.filter_mask & 0x1FFF_FFFF,
        })?;
        Ok(())
    }

    /// Formats one bus event for the host, or `None` when the report
    /// configuration suppresses it.
    pub fn encode_bus_event(
        &mut self,
        event: &BusEvent,
        now_ms: u32,
    ) -> Option<heapless::Vec<u8, SLCAN_MTU>> {
        let (frame, timestamp, echo) = match event {
            BusEvent::Received { frame, timestamp } => {
                if !self.report.contains(ReportFlags::RX) {
                    return None;
                }
                (frame, *timestamp, false)
            }
            BusEvent::Transmitted { frame, timestamp } => {
                if !self.report.contains(ReportFlags::TX) {
                    return None;
                }
                (frame, *timestamp, true)
            }
        };

        let extended = frame.id().kind() == IdKind::Extended;
        let mut out: heapless::Vec<u8, SLCAN_MTU> = heapless::Vec::new();

        if echo {
            let _ = out.push(if extended { b'Z' } else { b'z' });
        }

        let tag = match frame.format() {
            FrameFormat::Normal => b't',
            FrameFormat::Remote => b'r',
            FrameFormat::FdNoBrs => b'd',
            FrameFormat::FdWithBrs => b'b',
        };
        let _ = out.push(if extended { tag.to_ascii_uppercase() } else { tag });

        match frame.id() {
            Id::Standard(id) => {
                let raw = id.as_raw();
                let _ = out.push(to_hex_digit((raw >> 8) as u32));
                let _ = out.push(to_hex_digit((raw >> 4) as u32));
                let _ = out.push(to_hex_digit(raw as u32));
            }
            Id::Extended(id) => push_hex_u32(&mut out, id.as_raw()),
        }

        let _ = out.push(to_hex_digit(frame.dlc() as u32));
        if let Some(data) = frame.data() {
            push_hex_bytes(&mut out, data);
        }

        match self.timestamp_mode {
            TimestampMode::Off => {}
            TimestampMode::Milliseconds => push_hex_u16(&mut out, self.clock.next_ms(now_ms)),
            TimestampMode::Microseconds => {
                push_hex_u32(&mut out, self.clock.next_us(now_ms, timestamp))
            }
        }

        if let CanFrame::CanFd(fd) = frame {
            if self.report.contains(ReportFlags::ESI) {
                let _ = out.push(if fd.error_state_indicator() { b'1' } else { b'0' });
            }
        }

        let _ = out.push(b'\r');
        Some(out)
    }
}

impl Default for SlcanInterface {
    fn default() -> Self {
        Self::new()
    }
}
