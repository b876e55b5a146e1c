use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::frame::{CanFrame, FrameFormat, IdExt, IdKind};

/// Kernel clock feeding the CAN bit-time prescaler, in MHz.
pub const CAN_CLOCK_MHZ: u32 = 160;

// Bit count for each frame type with zero data bytes
const BITS_CLASSIC_STD: u32 = 47;
const BITS_CLASSIC_EXT: u32 = 67;
const BITS_FD_STD_ARBITRATION: u32 = 30;
const BITS_FD_EXT_ARBITRATION: u32 = 49;
const BITS_FD_DATA_SHORT_CRC: u32 = 26; // payloads up to 16 bytes
const BITS_FD_DATA_LONG_CRC: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitrateError {
    #[error("unknown nominal bitrate preset ({0:?})")]
    InvalidNominalPreset(u8),
    #[error("unknown data bitrate preset ({0:?})")]
    InvalidDataPreset(u8),
    #[error("bit-time prescaler ({0:?}) out of range")]
    PrescalerOutOfRange(u16),
    #[error("time segment 1 ({0:?}) out of range")]
    Seg1OutOfRange(u16),
    #[error("time segment 2 ({0:?}) out of range")]
    Seg2OutOfRange(u16),
    #[error("synchronization jump width ({0:?}) out of range")]
    SjwOutOfRange(u16),
}

/// Raw bit timing for one phase (arbitration or data) of the CAN peripheral.
///
/// One bit lasts `(1 + time_seg1 + time_seg2) * prescaler` clock cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitrateConfig {
    pub prescaler: u16,
    pub time_seg1: u16,
    pub time_seg2: u16,
    pub sjw: u16,
}

impl BitrateConfig {
    pub const fn new(prescaler: u16, time_seg1: u16, time_seg2: u16, sjw: u16) -> Self {
        Self {
            prescaler,
            time_seg1,
            time_seg2,
            sjw,
        }
    }

    /// Duration of one bit in nanoseconds at the 160 MHz kernel clock.
    pub const fn bit_time_ns(&self) -> u32 {
        // MAX: (1 + 256 + 128) * 512 * 1000 / 160
        (1 + self.time_seg1 as u32 + self.time_seg2 as u32) * self.prescaler as u32 * 1000
            / CAN_CLOCK_MHZ
    }

    /// Checks the timing against the peripheral limits for the arbitration
    /// phase.
    pub fn validate_nominal(&self) -> Result<(), BitrateError> {
        if !(1..=512).contains(&self.prescaler) {
            return Err(BitrateError::PrescalerOutOfRange(self.prescaler));
        }
        if !(1..=256).contains(&self.time_seg1) {
            return Err(BitrateError::Seg1OutOfRange(self.time_seg1));
        }
        if !(1..=128).contains(&self.time_seg2) {
            return Err(BitrateError::Seg2OutOfRange(self.time_seg2));
        }
        if !(1..=128).contains(&self.sjw) {
            return Err(BitrateError::SjwOutOfRange(self.sjw));
        }
        Ok(())
    }

    /// Checks the timing against the peripheral limits for the data phase.
    pub fn validate_data(&self) -> Result<(), BitrateError> {
        if !(1..=32).contains(&self.prescaler) {
            return Err(BitrateError::PrescalerOutOfRange(self.prescaler));
        }
        if !(1..=32).contains(&self.time_seg1) {
            return Err(BitrateError::Seg1OutOfRange(self.time_seg1));
        }
        if !(1..=16).contains(&self.time_seg2) {
            return Err(BitrateError::Seg2OutOfRange(self.time_seg2));
        }
        if !(1..=16).contains(&self.sjw) {
            return Err(BitrateError::SjwOutOfRange(self.sjw));
        }
        Ok(())
    }
}

/// Nominal (arbitration phase) bitrate presets, selected by the digit of the
/// `S` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = BitrateError, constructor = BitrateError::InvalidNominalPreset))]
#[repr(u8)]
pub enum NominalBitrate {
    Rate10k = 0,
    Rate20k = 1,
    Rate50k = 2,
    Rate100k = 3,
    Rate125k = 4,
    Rate250k = 5,
    Rate500k = 6,
    Rate800k = 7,
    Rate1M = 8,
    Rate83_3k = 9,
}

impl NominalBitrate {
    pub const fn timing(self) -> BitrateConfig {
        match self {
            Self::Rate10k => BitrateConfig::new(200, 70, 9, 8),
            Self::Rate20k => BitrateConfig::new(100, 70, 9, 8),
            Self::Rate50k => BitrateConfig::new(40, 70, 9, 8),
            Self::Rate83_3k => BitrateConfig::new(24, 70, 9, 8),
            Self::Rate100k => BitrateConfig::new(20, 70, 9, 8),
            Self::Rate125k => BitrateConfig::new(16, 70, 9, 8),
            Self::Rate250k => BitrateConfig::new(8, 70, 9, 8),
            Self::Rate500k => BitrateConfig::new(4, 70, 9, 8),
            Self::Rate800k => BitrateConfig::new(2, 88, 11, 10),
            Self::Rate1M => BitrateConfig::new(2, 70, 9, 8),
        }
    }
}

/// Data phase bitrate presets, selected by the digit of the `Y` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = BitrateError, constructor = BitrateError::InvalidDataPreset))]
#[repr(u8)]
pub enum DataBitrate {
    Rate500k = 0,
    Rate1M = 1,
    Rate2M = 2,
    Rate4M = 4,
    Rate5M = 5,
    Rate8M = 8,
}

impl DataBitrate {
    pub const fn timing(self) -> BitrateConfig {
        match self {
            Self::Rate500k => BitrateConfig::new(8, 30, 9, 8),
            Self::Rate1M => BitrateConfig::new(4, 30, 9, 8),
            Self::Rate2M => BitrateConfig::new(2, 30, 9, 8),
            Self::Rate4M => BitrateConfig::new(1, 30, 9, 8),
            Self::Rate5M => BitrateConfig::new(1, 24, 7, 6),
            Self::Rate8M => BitrateConfig::new(1, 14, 5, 3),
        }
    }
}

/// Worst-case duration of a frame on the wire, expressed in nominal bit
/// times. For BRS frames the data phase is rescaled by the ratio of the data
/// and nominal bit times.
pub fn frame_bit_count(frame: &CanFrame, nominal: &BitrateConfig, data: &BitrateConfig) -> u32 {
    let extended = frame.id().kind() == IdKind::Extended;
    let len = frame.data_len() as u32;

    match frame.format() {
        FrameFormat::Normal | FrameFormat::Remote => {
            let base = if extended {
                BITS_CLASSIC_EXT
            } else {
                BITS_CLASSIC_STD
            };
            base + len * 8
        }
        FrameFormat::FdNoBrs | FrameFormat::FdWithBrs => {
            let arbitration = if extended {
                BITS_FD_EXT_ARBITRATION
            } else {
                BITS_FD_STD_ARBITRATION
            };
            let crc = if len <= 16 {
                BITS_FD_DATA_SHORT_CRC
            } else {
                BITS_FD_DATA_LONG_CRC
            };
            let data_bits = crc + len * 8;

            if frame.format() == FrameFormat::FdWithBrs {
                let nominal_ns = nominal.bit_time_ns();
                if nominal_ns == 0 {
                    return 0; // uninitialized timing, avoid zero-div
                }
                arbitration + (data_bits as u64 * data.bit_time_ns() as u64 / nominal_ns as u64) as u32
            } else {
                arbitration + data_bits
            }
        }
    }
}
