use embedded_can::Id;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A joint enum which can hold either a CAN 2.0 frame or a CAN FD frame. See
/// [`Can2Frame`] and [`CanFdFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanFrame {
    Can2(Can2Frame),
    CanFd(CanFdFrame),
}

impl From<Can2Frame> for CanFrame {
    fn from(frame: Can2Frame) -> Self {
        Self::Can2(frame)
    }
}

impl From<CanFdFrame> for CanFrame {
    fn from(frame: CanFdFrame) -> Self {
        Self::CanFd(frame)
    }
}

impl CanFrame {
    pub fn id(&self) -> Id {
        match self {
            CanFrame::Can2(can2_frame) => can2_frame.id,
            CanFrame::CanFd(can_fd_frame) => can_fd_frame.id,
        }
    }

    pub fn format(&self) -> FrameFormat {
        match self {
            CanFrame::Can2(Can2Frame { data: Some(_), .. }) => FrameFormat::Normal,
            CanFrame::Can2(Can2Frame { data: None, .. }) => FrameFormat::Remote,
            CanFrame::CanFd(CanFdFrame {
                bit_rate_switched: false,
                ..
            }) => FrameFormat::FdNoBrs,
            CanFrame::CanFd(CanFdFrame {
                bit_rate_switched: true,
                ..
            }) => FrameFormat::FdWithBrs,
        }
    }

    /// Slice over the full data of the frame (None for RTR frames)
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            CanFrame::Can2(can2_frame) => can2_frame.data(),
            CanFrame::CanFd(can_fd_frame) => Some(can_fd_frame.data()),
        }
    }

    pub fn is_fd(&self) -> bool {
        match self {
            CanFrame::Can2(_) => false,
            CanFrame::CanFd(_) => true,
        }
    }

    pub fn is_remote(&self) -> bool {
        match self {
            CanFrame::Can2(can2_frame) => can2_frame.is_remote(),
            CanFrame::CanFd(_) => false,
        }
    }

    /// The full length of the data payload, or zero for RTR frames (not
    /// necessarily equal to the DLC)
    pub fn data_len(&self) -> usize {
        match self {
            CanFrame::Can2(frame) => frame.data().map_or(0, |d| d.len()),
            CanFrame::CanFd(frame) => frame.dlc().get_num_bytes(),
        }
    }

    /// The actual compressed value sent in the CAN frame (not necessarily
    /// equal to the data length for FD frames)
    pub fn dlc(&self) -> u8 {
        match self {
            CanFrame::Can2(frame) => frame.dlc() as u8,
            CanFrame::CanFd(frame) => frame.dlc() as u8,
        }
    }
}

/// Represents a CAN 2.0 frame which supports RTR (Remote Transmission Request).
///
/// Data frames carry up to 8 bytes. Remote frames carry no data but keep
/// their raw DLC, which the protocol allows to run up to 15.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Can2Frame {
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    id: Id,
    dlc: usize,
    data: Option<[u8; 8]>,
}

impl Can2Frame {
    /// Creates a new CAN 2.0 data frame. `data` must have a length in the
    /// range 0..=8 or else `None` will be returned instead.
    pub fn new_data(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }

        let mut copy = [0u8; 8];
        copy[..data.len()].copy_from_slice(data);

        Some(Self {
            id: id.into(),
            dlc: data.len(),
            data: Some(copy),
        })
    }

    /// Creates a new CAN 2.0 remote frame. `dlc` must be in the range 0..=15
    /// or else `None` will be returned instead.
    pub fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 15 {
            return None;
        }

        Some(Self {
            id: id.into(),
            dlc,
            data: None,
        })
    }

    /// Gets the message ID of the frame
    pub fn id(&self) -> Id {
        self.id
    }

    /// Gets the DLC (Data Length Code) of the frame
    pub fn dlc(&self) -> usize {
        self.dlc
    }

    /// Gets the data associated with the frame. Will return `None` if it is an
    /// RTR frame.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_ref().map(|d| &d[..self.dlc.min(8)])
    }

    pub fn is_remote(&self) -> bool {
        self.data.is_none()
    }
}

/// Represents all the possible DLC values for CAN FD frames.
///
/// The integer value of the enum maps to the DLC used in the CAN protocol and
/// not the actual number of bytes associated with each variant. To obtain
/// that, see [`FdDataLengthCode::get_num_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FdDataLengthCode {
    Bytes0 = 0,
    Bytes1 = 1,
    Bytes2 = 2,
    Bytes3 = 3,
    Bytes4 = 4,
    Bytes5 = 5,
    Bytes6 = 6,
    Bytes7 = 7,
    Bytes8 = 8,
    Bytes12 = 9,
    Bytes16 = 10,
    Bytes20 = 11,
    Bytes24 = 12,
    Bytes32 = 13,
    Bytes48 = 14,
    Bytes64 = 15,
}

impl FdDataLengthCode {
    /// Returns the next closest DLC for the given length value. Values over 64
    /// will return `None`.
    pub fn for_length(length: usize) -> Option<Self> {
        Some(match length {
            x @ 0..=8 => (x as u8).try_into().unwrap(),
            9..=12 => Self::Bytes12,
            13..=16 => Self::Bytes16,
            17..=20 => Self::Bytes20,
            21..=24 => Self::Bytes24,
            25..=32 => Self::Bytes32,
            33..=48 => Self::Bytes48,
            49..=64 => Self::Bytes64,
            _ => return None,
        })
    }

    /// Returns the number of bytes that this variant can hold, which is
    /// different from the enum's integer value.
    pub fn get_num_bytes(&self) -> usize {
        match self {
            Self::Bytes0 => 0,
            Self::Bytes1 => 1,
            Self::Bytes2 => 2,
            Self::Bytes3 => 3,
            Self::Bytes4 => 4,
            Self::Bytes5 => 5,
            Self::Bytes6 => 6,
            Self::Bytes7 => 7,
            Self::Bytes8 => 8,
            Self::Bytes12 => 12,
            Self::Bytes16 => 16,
            Self::Bytes20 => 20,
            Self::Bytes24 => 24,
            Self::Bytes32 => 32,
            Self::Bytes48 => 48,
            Self::Bytes64 => 64,
        }
    }
}

/// Represents a CAN FD frame which can store up to 64 data bytes and
/// optionally supports transmitting at a higher data bit rate.
///
/// The error state indicator mirrors what the controller reported for the
/// frame; it is only meaningful on received or echoed frames.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFdFrame {
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    id: Id,
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    data: heapless::Vec<u8, 64>,
    bit_rate_switched: bool,
    error_state_indicator: bool,
}

impl CanFdFrame {
    /// Creates a new CAN FD frame. Will return `None` if the data is not one
    /// of the allowed DLC values for CAN FD.
    pub fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        // for_length rounds up; only exact DLC lengths are accepted here
        if FdDataLengthCode::for_length(data.len())?.get_num_bytes() != data.len() {
            return None;
        }

        Some(Self {
            id: id.into(),
            data: heapless::Vec::<u8, 64>::from_slice(data).unwrap(),
            bit_rate_switched: true,
            error_state_indicator: false,
        })
    }

    /// Creates a new CAN FD frame. Will return `None` if the data is longer
    /// than 64 bytes. Any lengths under 64 will be padded with 0s until they
    /// reach one of the allowed CAN FD data length codes.
    pub fn new_padded(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let dlc = FdDataLengthCode::for_length(data.len())?;

        let mut data = heapless::Vec::<u8, 64>::from_slice(data).unwrap();
        data.extend((data.len()..dlc.get_num_bytes()).map(|_| 0));

        Some(Self {
            id: id.into(),
            data,
            bit_rate_switched: true,
            error_state_indicator: false,
        })
    }

    /// Gets the message ID of the frame
    pub fn id(&self) -> Id {
        self.id
    }

    /// Gets the DLC (Data Length Code) of the frame
    pub fn dlc(&self) -> FdDataLengthCode {
        FdDataLengthCode::for_length(self.data.len()).unwrap()
    }

    /// Gets the data associated with the frame (length will match DLC)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns whether or not this frame should be/was transmitted with the
    /// higher data bit rate
    pub fn is_bit_rate_switched(&self) -> bool {
        self.bit_rate_switched
    }

    /// Sets whether the frame should be transmitted with the higher data bit
    /// rate
    pub fn set_bit_rate_switched(&mut self, bit_rate_switched: bool) {
        self.bit_rate_switched = bit_rate_switched
    }

    /// Consumes self and returns a new self with the the supplied value for
    /// `bit_rate_switched`
    pub fn with_bit_rate_switched(mut self, bit_rate_switched: bool) -> Self {
        self.bit_rate_switched = bit_rate_switched;
        self
    }

    /// Returns whether the transmitting node was error passive at the time
    /// the frame was sent
    pub fn error_state_indicator(&self) -> bool {
        self.error_state_indicator
    }

    pub fn set_error_state_indicator(&mut self, error_state_indicator: bool) {
        self.error_state_indicator = error_state_indicator
    }

    /// Consumes self and returns a new self with the the supplied value for
    /// `error_state_indicator`
    pub fn with_error_state_indicator(mut self, error_state_indicator: bool) -> Self {
        self.error_state_indicator = error_state_indicator;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdKind {
    #[default]
    Standard,
    Extended,
}

pub trait IdExt {
    fn kind(self) -> IdKind;
}

impl IdExt for Id {
    fn kind(self) -> IdKind {
        match self {
            Id::Standard(_) => IdKind::Standard,
            Id::Extended(_) => IdKind::Extended,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameFormat {
    #[default]
    Normal,
    Remote,
    FdNoBrs,
    FdWithBrs,
}
