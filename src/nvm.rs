//! Persisted device settings.
//!
//! Each setting lives in one 64-bit record. The top nibble carries the
//! record status so that erased flash (all ones) reads as "never written";
//! the remaining 60 bits hold the payload. Records are rewritten as a whole
//! page, so the store trait programs all of them at once.

use crate::bitrate::BitrateConfig;
use crate::can::FilterConfig;
use crate::slcan::{AutoStartupMode, TimestampMode};

pub const RECORD_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(usize)]
pub enum Record {
    Serial = 0,
    Startup = 1,
    NominalBitrate = 2,
    DataBitrate = 3,
    StdFilter = 4,
    ExtFilter = 5,
}

const STATUS_SHIFT: u32 = 60;
const STATUS_WRITTEN: u64 = 0x0;
const PAYLOAD_MASK: u64 = (1 << STATUS_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("non-volatile memory write failed")]
pub struct NvmError;

/// Backing storage for the settings records.
pub trait NvmStore {
    fn read(&self, record: Record) -> u64;
    /// Erases the page and writes all records back.
    fn program(&mut self, records: &[u64; RECORD_COUNT]) -> Result<(), NvmError>;
}

/// Channel configuration restored at power-up when auto-startup is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StartupConfig {
    pub mode: AutoStartupMode,
    pub timestamp_mode: TimestampMode,
    pub nominal: Option<BitrateConfig>,
    pub data: Option<BitrateConfig>,
    pub std_filter: Option<FilterConfig>,
    pub ext_filter: Option<FilterConfig>,
}

/// Cached view over the settings records.
pub struct Nvm<S: NvmStore> {
    store: S,
    records: [u64; RECORD_COUNT],
}

impl<S: NvmStore> Nvm<S> {
    pub fn new(store: S) -> Self {
        let records = [
            store.read(Record::Serial),
            store.read(Record::Startup),
            store.read(Record::NominalBitrate),
            store.read(Record::DataBitrate),
            store.read(Record::StdFilter),
            store.read(Record::ExtFilter),
        ];
        Self { store, records }
    }

    /// Consumes the cache and hands back the store.
    pub fn release(self) -> S {
        self.store
    }

    fn payload(&self, record: Record) -> Option<u64> {
        let raw = self.records[record as usize];
        if raw >> STATUS_SHIFT == STATUS_WRITTEN {
            Some(raw & PAYLOAD_MASK)
        } else {
            None
        }
    }

    fn set_payload(&mut self, record: Record, payload: u64) {
        self.records[record as usize] = (STATUS_WRITTEN << STATUS_SHIFT) | (payload & PAYLOAD_MASK);
    }

    pub fn serial_number(&self) -> Option<u16> {
        self.payload(Record::Serial).map(|p| p as u16)
    }

    /// Stores a new serial number. Skips the flash cycle when the stored
    /// value already matches.
    pub fn set_serial_number(&mut self, serial: u16) -> Result<(), NvmError> {
        if self.serial_number() == Some(serial) {
            return Ok(());
        }
        self.set_payload(Record::Serial, serial as u64);
        self.store.program(&self.records)
    }

    /// Captures the complete channel configuration for auto-startup.
    pub fn save_startup(
        &mut self,
        mode: AutoStartupMode,
        timestamp_mode: TimestampMode,
        nominal: BitrateConfig,
        data: BitrateConfig,
        std_filter: FilterConfig,
        ext_filter: FilterConfig,
    ) -> Result<(), NvmError> {
        let startup = (u8::from(mode) as u64) | ((u8::from(timestamp_mode) as u64) << 4);
        self.set_payload(Record::Startup, startup);
        self.set_payload(Record::NominalBitrate, encode_bitrate(&nominal));
        self.set_payload(Record::DataBitrate, encode_bitrate(&data));
        self.set_payload(Record::StdFilter, encode_filter(&std_filter));
        self.set_payload(Record::ExtFilter, encode_filter(&ext_filter));
        self.store.program(&self.records)
    }

    /// Reads back the auto-startup configuration, or `None` when it was
    /// never saved or does not decode.
    pub fn startup_config(&self) -> Option<StartupConfig> {
        let startup = self.payload(Record::Startup)?;
        let mode = AutoStartupMode::try_from((startup & 0xF) as u8).ok()?;
        let timestamp_mode = TimestampMode::try_from(((startup >> 4) & 0xF) as u8).ok()?;

        Some(StartupConfig {
            mode,
            timestamp_mode,
            nominal: self.payload(Record::NominalBitrate).map(decode_bitrate),
            data: self.payload(Record::DataBitrate).map(decode_bitrate),
            std_filter: self.payload(Record::StdFilter).map(decode_filter),
            ext_filter: self.payload(Record::ExtFilter).map(decode_filter),
        })
    }
}

// Bit timing packs as four 15-bit fields, widest first: prescaler [14:0],
// seg1 [29:15], seg2 [44:30], sjw [59:45].
fn encode_bitrate(timing: &BitrateConfig) -> u64 {
    (timing.prescaler as u64 & 0x7FFF)
        | ((timing.time_seg1 as u64 & 0x7FFF) << 15)
        | ((timing.time_seg2 as u64 & 0x7FFF) << 30)
        | ((timing.sjw as u64 & 0x7FFF) << 45)
}

fn decode_bitrate(payload: u64) -> BitrateConfig {
    BitrateConfig::new(
        (payload & 0x7FFF) as u16,
        ((payload >> 15) & 0x7FFF) as u16,
        ((payload >> 30) & 0x7FFF) as u16,
        ((payload >> 45) & 0x7FFF) as u16,
    )
}

// Filters pack as code [28:0], mask [57:29], enabled [58].
fn encode_filter(filter: &FilterConfig) -> u64 {
    (filter.code as u64 & 0x1FFF_FFFF)
        | ((filter.mask as u64 & 0x1FFF_FFFF) << 29)
        | ((filter.enabled as u64) << 58)
}

fn decode_filter(payload: u64) -> FilterConfig {
    FilterConfig {
        code: (payload & 0x1FFF_FFFF) as u32,
        mask: ((payload >> 29) & 0x1FFF_FFFF) as u32,
        enabled: (payload >> 58) & 1 != 0,
    }
}
