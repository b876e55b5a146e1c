use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Everything that can go wrong, one sticky bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorFlag {
    PeriphInit = 0,
    CanTxFail = 1,
    CanRxFail = 2,
    CanTxQueueFull = 3,
    UsbRxFull = 4,
    UsbTxFull = 5,
    CanBusError = 6,
    CanWarning = 7,
    CanErrorPassive = 8,
    CanBusOff = 9,
}

pub const ERROR_FLAG_COUNT: usize = 10;

/// Sticky error register. Flags accumulate until the host reads the status
/// or reopens the channel; each flag remembers when it was last asserted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorRegister {
    bits: u32,
    timestamps_ms: [u32; ERROR_FLAG_COUNT],
    last_ms: u32,
}

impl ErrorRegister {
    pub const fn new() -> Self {
        Self {
            bits: 0,
            timestamps_ms: [0; ERROR_FLAG_COUNT],
            last_ms: 0,
        }
    }

    pub fn assert_flag(&mut self, flag: ErrorFlag, now_ms: u32) {
        self.bits |= 1 << flag as u32;
        self.timestamps_ms[flag as usize] = now_ms;
        self.last_ms = now_ms;
    }

    pub fn is_set(&self, flag: ErrorFlag) -> bool {
        self.bits & (1 << flag as u32) != 0
    }

    pub fn any(&self) -> bool {
        self.bits != 0
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Tick at which the flag was last asserted, or 0 if it never was.
    pub fn timestamp_ms(&self, flag: ErrorFlag) -> u32 {
        self.timestamps_ms[flag as usize]
    }

    /// Tick of the most recent assertion across all flags.
    pub fn last_timestamp_ms(&self) -> u32 {
        self.last_ms
    }

    /// Clears all flags and timestamps. Individual flags cannot be cleared.
    pub fn clear(&mut self) {
        self.bits = 0;
        self.timestamps_ms = [0; ERROR_FLAG_COUNT];
        self.last_ms = 0;
    }
}

impl Default for ErrorRegister {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Status byte reported by the `F` command, CAN232 bit layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        const CAN_RX_FIFO_FULL = 1 << 0; // message loss, not just a full buffer
        const CAN_TX_FIFO_FULL = 1 << 1;
        const ERROR_WARNING = 1 << 2;
        const DATA_OVERRUN = 1 << 3;
        const ERROR_PASSIVE = 1 << 5;
        const ARBITRATION_LOST = 1 << 6; // not supported
        const BUS_ERROR = 1 << 7;
    }
}

impl StatusFlags {
    /// Maps the internal error register onto the CAN232 status bits.
    pub fn from_register(register: &ErrorRegister) -> Self {
        let mut status = StatusFlags::empty();

        if register.is_set(ErrorFlag::CanRxFail) || register.is_set(ErrorFlag::CanTxFail) {
            status |= StatusFlags::DATA_OVERRUN;
        }
        if register.is_set(ErrorFlag::CanTxQueueFull) || register.is_set(ErrorFlag::UsbRxFull) {
            status |= StatusFlags::CAN_TX_FIFO_FULL;
        }
        if register.is_set(ErrorFlag::UsbTxFull) {
            status |= StatusFlags::CAN_RX_FIFO_FULL;
        }
        if register.is_set(ErrorFlag::CanBusError) {
            status |= StatusFlags::BUS_ERROR;
        }
        if register.is_set(ErrorFlag::CanWarning) || register.is_set(ErrorFlag::CanBusOff) {
            status |= StatusFlags::ERROR_WARNING;
        }
        if register.is_set(ErrorFlag::CanErrorPassive) {
            status |= StatusFlags::ERROR_PASSIVE;
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_sticky_until_bulk_clear() {
        let mut reg = ErrorRegister::new();
        assert!(!reg.any());

        reg.assert_flag(ErrorFlag::CanTxFail, 100);
        reg.assert_flag(ErrorFlag::UsbRxFull, 250);
        assert!(reg.is_set(ErrorFlag::CanTxFail));
        assert!(reg.is_set(ErrorFlag::UsbRxFull));
        assert!(!reg.is_set(ErrorFlag::CanBusOff));
        assert_eq!(reg.timestamp_ms(ErrorFlag::CanTxFail), 100);
        assert_eq!(reg.last_timestamp_ms(), 250);

        // Re-asserting refreshes the timestamp, the bit stays set
        reg.assert_flag(ErrorFlag::CanTxFail, 300);
        assert_eq!(reg.timestamp_ms(ErrorFlag::CanTxFail), 300);

        reg.clear();
        assert!(!reg.any());
        assert_eq!(reg.timestamp_ms(ErrorFlag::CanTxFail), 0);
        assert_eq!(reg.last_timestamp_ms(), 0);
    }

    #[test]
    fn status_byte_mapping() {
        let mut reg = ErrorRegister::new();
        assert_eq!(StatusFlags::from_register(&reg), StatusFlags::empty());

        reg.assert_flag(ErrorFlag::CanRxFail, 1);
        assert_eq!(StatusFlags::from_register(&reg), StatusFlags::DATA_OVERRUN);

        reg.clear();
        reg.assert_flag(ErrorFlag::CanTxQueueFull, 1);
        reg.assert_flag(ErrorFlag::UsbTxFull, 2);
        assert_eq!(
            StatusFlags::from_register(&reg),
            StatusFlags::CAN_TX_FIFO_FULL | StatusFlags::CAN_RX_FIFO_FULL
        );

        // Bus-off is folded into the warning bit
        reg.clear();
        reg.assert_flag(ErrorFlag::CanBusOff, 1);
        assert_eq!(StatusFlags::from_register(&reg), StatusFlags::ERROR_WARNING);

        reg.clear();
        reg.assert_flag(ErrorFlag::CanErrorPassive, 1);
        reg.assert_flag(ErrorFlag::CanBusError, 1);
        assert_eq!(
            StatusFlags::from_register(&reg),
            StatusFlags::ERROR_PASSIVE | StatusFlags::BUS_ERROR
        );
    }
}
