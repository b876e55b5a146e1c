use crate::bitrate::{frame_bit_count, BitrateConfig, BitrateError, DataBitrate, NominalBitrate};
use crate::buffer::TxQueue;
use crate::error::{ErrorFlag, ErrorRegister};
use crate::frame::CanFrame;

/// Depth of the software transmit queue in front of the hardware FIFO.
pub const TX_QUEUE_LEN: usize = 64;

const BUS_LOAD_WINDOW_MS: u32 = 100;
// Compensate stuff bits and rounding in the load calculation
const BUS_LOAD_BUILDUP_PPM: u32 = 1_125_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusState {
    Closed,
    Open,
}

/// Operating mode applied when the channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanMode {
    #[default]
    Normal,
    ListenOnly,
    LoopbackInternal,
    LoopbackExternal,
}

/// Receive FIFOs of the controller. Frames matching an acceptance filter
/// land in `Accept`; everything else is routed to `Monitor` so the bus load
/// measurement still sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxFifo {
    Accept,
    Monitor,
}

/// Hardware FIFOs that can signal element loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OverflowKind {
    TxEvent,
    RxAccept,
    RxMonitor,
}

/// Last protocol error recorded by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolErrorCode {
    #[default]
    None,
    Stuff,
    Form,
    Ack,
    Bit1,
    Bit0,
    Crc,
    NoChange,
}

impl ProtocolErrorCode {
    /// Four-character mnemonic used in the verbose status report.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Stuff => "STUF",
            Self::Form => "FORM",
            Self::Ack => "_ACK",
            Self::Bit1 => "BIT1",
            Self::Bit0 => "BIT0",
            Self::Crc => "_CRC",
            Self::NoChange => "SAME",
        }
    }
}

/// One acceptance filter (classic code/mask pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FilterConfig {
    pub enabled: bool,
    pub code: u32,
    pub mask: u32,
}

impl FilterConfig {
    /// Accept everything: a zero mask matches every identifier.
    pub const fn accept_all(code: u32) -> Self {
        Self {
            enabled: true,
            code,
            mask: 0,
        }
    }
}

/// Everything the driver needs to start the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceConfig {
    pub mode: CanMode,
    pub nominal: BitrateConfig,
    pub data: BitrateConfig,
    pub std_filter: FilterConfig,
    pub ext_filter: FilterConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProtocolStatus {
    pub bus_off: bool,
    pub error_passive: bool,
    pub warning: bool,
    pub last_error: ProtocolErrorCode,
    pub last_data_error: ProtocolErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorCounters {
    pub tx: u8,
    pub rx: u8,
    /// The receive counter saturates at 127; this reports crossing it.
    pub rx_at_least_passive: bool,
}

/// Completed transmission pulled from the TX event FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxEvent {
    /// Bus timestamp counter value at the end of the frame.
    pub timestamp: u16,
    /// Whether the node was error passive when the frame went out.
    pub esi: bool,
}

/// Frame pulled from a receive FIFO together with its bus timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxFrame {
    pub frame: CanFrame,
    pub timestamp: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("CAN peripheral rejected the request")]
pub struct DeviceError;

/// Contract between the transport and the CAN controller driver.
///
/// Implementations poll the hardware; none of these calls may block. The
/// driver owns filter routing: matching frames go to [`RxFifo::Accept`],
/// non-matching ones to [`RxFifo::Monitor`].
pub trait CanDevice {
    fn start(&mut self, config: &DeviceConfig) -> Result<(), DeviceError>;
    fn stop(&mut self);

    /// Free elements in the hardware transmit FIFO.
    fn tx_fifo_free_level(&self) -> usize;
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), DeviceError>;
    /// Next completed transmission, in submission order.
    fn take_tx_event(&mut self) -> Option<TxEvent>;

    fn receive(&mut self, fifo: RxFifo) -> Option<RxFrame>;
    /// Reads and clears the element-lost flag of the given FIFO.
    fn take_overflow(&mut self, kind: OverflowKind) -> bool;

    fn protocol_status(&self) -> ProtocolStatus;
    fn error_counters(&self) -> ErrorCounters;
    /// Free-running 16-bit bus time counter (1 us per tick).
    fn timestamp_counter(&self) -> u16;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanError {
    #[error("channel is already open")]
    BusOpen,
    #[error("channel is closed")]
    BusClosed,
    #[error("transmit is not allowed in listen-only mode")]
    ListenOnly,
    #[error("transmit queue is full")]
    TxQueueFull,
    #[error("filter value ({0:?}) out of range")]
    FilterOutOfRange(u32),
    #[error(transparent)]
    Bitrate(#[from] BitrateError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Aggregated bus health, refreshed on every poll while open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusHealth {
    pub bus_off: bool,
    pub error_passive: bool,
    pub warning: bool,
    pub tec: u8,
    pub rec: u8,
    pub last_error: ProtocolErrorCode,
}

/// Traffic observed on the bus, handed to the host-side encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    Received { frame: CanFrame, timestamp: u16 },
    Transmitted { frame: CanFrame, timestamp: u16 },
}

/// CAN channel state machine: bitrate and filter staging while closed,
/// queued transmission and statistics while open.
pub struct CanTransport<D: CanDevice> {
    device: D,
    state: BusState,
    mode: CanMode,
    nominal: BitrateConfig,
    data: BitrateConfig,
    std_filter: FilterConfig,
    ext_filter: FilterConfig,
    tx_queue: TxQueue<TX_QUEUE_LEN>,
    health: BusHealth,
    bus_load_ppm: u32,
    bit_time_ns: u32,
    window_bits: u32,
    window_started_ms: u32,
    last_frame_timestamp: u16,
    cycle_max_ns: u32,
    cycle_avg_ns: u32,
    last_cycle_stamp: u16,
}

impl<D: CanDevice> CanTransport<D> {
    pub fn new(device: D) -> Self {
        let nominal = NominalBitrate::Rate125k.timing();
        Self {
            device,
            state: BusState::Closed,
            mode: CanMode::Normal,
            nominal,
            data: DataBitrate::Rate2M.timing(),
            std_filter: FilterConfig::accept_all(0x7FF),
            ext_filter: FilterConfig::accept_all(0x1FFF_FFFF),
            tx_queue: TxQueue::new(),
            health: BusHealth::default(),
            bus_load_ppm: 0,
            bit_time_ns: nominal.bit_time_ns(),
            window_bits: 0,
            window_started_ms: 0,
            last_frame_timestamp: 0,
            cycle_max_ns: 0,
            cycle_avg_ns: 0,
            last_cycle_stamp: 0,
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == BusState::Open
    }

    pub fn mode(&self) -> CanMode {
        self.mode
    }

    pub fn nominal_timing(&self) -> BitrateConfig {
        self.nominal
    }

    pub fn data_timing(&self) -> BitrateConfig {
        self.data
    }

    pub fn std_filter(&self) -> FilterConfig {
        self.std_filter
    }

    pub fn ext_filter(&self) -> FilterConfig {
        self.ext_filter
    }

    pub fn health(&self) -> &BusHealth {
        &self.health
    }

    pub fn bus_load_ppm(&self) -> u32 {
        self.bus_load_ppm
    }

    pub fn cycle_max_time_ns(&self) -> u32 {
        self.cycle_max_ns
    }

    pub fn cycle_avg_time_ns(&self) -> u32 {
        self.cycle_avg_ns
    }

    pub fn clear_cycle_time(&mut self) {
        self.cycle_max_ns = 0;
        self.cycle_avg_ns = 0;
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Selects the operating mode for the next open. Rejected while open.
    pub fn set_mode(&mut self, mode: CanMode) -> Result<(), CanError> {
        if self.is_open() {
            return Err(CanError::BusOpen);
        }
        self.mode = mode;
        Ok(())
    }

    pub fn set_nominal_preset(&mut self, preset: NominalBitrate) -> Result<(), CanError> {
        if self.is_open() {
            return Err(CanError::BusOpen);
        }
        self.nominal = preset.timing();
        Ok(())
    }

    pub fn set_nominal_timing(&mut self, timing: BitrateConfig) -> Result<(), CanError> {
        if self.is_open() {
            return Err(CanError::BusOpen);
        }
        timing.validate_nominal()?;
        self.nominal = timing;
        Ok(())
    }

    pub fn set_data_preset(&mut self, preset: DataBitrate) -> Result<(), CanError> {
        if self.is_open() {
            return Err(CanError::BusOpen);
        }
        self.data = preset.timing();
        Ok(())
    }

    pub fn set_data_timing(&mut self, timing: BitrateConfig) -> Result<(), CanError> {
        if self.is_open() {
            return Err(CanError::BusOpen);
        }
        timing.validate_data()?;
        self.data = timing;
        Ok(())
    }

    pub fn set_std_filter(&mut self, filter: FilterConfig) -> Result<(), CanError> {
        if self.is_open() {
            return Err(CanError::BusOpen);
        }
        if filter.code > 0x7FF {
            return Err(CanError::FilterOutOfRange(filter.code));
        }
        if filter.mask > 0x7FF {
            return Err(CanError::FilterOutOfRange(filter.mask));
        }
        self.std_filter = filter;
        Ok(())
    }

    pub fn set_ext_filter(&mut self, filter: FilterConfig) -> Result<(), CanError> {
        if self.is_open() {
            return Err(CanError::BusOpen);
        }
        if filter.code > 0x1FFF_FFFF {
            return Err(CanError::FilterOutOfRange(filter.code));
        }
        if filter.mask > 0x1FFF_FFFF {
            return Err(CanError::FilterOutOfRange(filter.mask));
        }
        self.ext_filter = filter;
        Ok(())
    }

    /// Starts the controller with the staged configuration and goes on-bus.
    pub fn open(&mut self) -> Result<(), CanError> {
        if self.is_open() {
            return Err(CanError::BusOpen);
        }

        let config = DeviceConfig {
            mode: self.mode,
            nominal: self.nominal,
            data: self.data,
            std_filter: self.std_filter,
            ext_filter: self.ext_filter,
        };
        self.device.start(&config)?;

        self.tx_queue.clear();
        self.bit_time_ns = self.nominal.bit_time_ns();
        self.bus_load_ppm = 0;
        self.window_bits = 0;
        self.health = BusHealth::default();
        self.clear_cycle_time();
        self.state = BusState::Open;

        Ok(())
    }

    /// Stops the controller and drops all queued frames.
    pub fn close(&mut self) -> Result<(), CanError> {
        if !self.is_open() {
            return Err(CanError::BusClosed);
        }

        self.device.stop();
        self.tx_queue.clear();
        self.state = BusState::Closed;

        Ok(())
    }

    /// Accepts a frame for transmission. The frame goes out on a later
    /// [`process`](Self::process) call once a hardware mailbox is free.
    pub fn enqueue(
        &mut self,
        frame: CanFrame,
        errors: &mut ErrorRegister,
        now_ms: u32,
    ) -> Result<(), CanError> {
        if !self.is_open() {
            return Err(CanError::BusClosed);
        }
        if self.mode == CanMode::ListenOnly {
            return Err(CanError::ListenOnly);
        }

        self.tx_queue.enqueue(frame).map_err(|_| {
            errors.assert_flag(ErrorFlag::CanTxQueueFull, now_ms);
            CanError::TxQueueFull
        })
    }

    /// One polling pass: feed the hardware FIFO, drain completed
    /// transmissions and received frames into `on_event`, refresh error
    /// state and bus statistics.
    pub fn process(
        &mut self,
        now_ms: u32,
        errors: &mut ErrorRegister,
        on_event: &mut impl FnMut(BusEvent),
    ) {
        if !self.is_open() {
            return;
        }

        // Hand pending frames to the hardware while mailboxes are free. A
        // rejected frame is dropped; failure is unlikely since we checked
        // the free level.
        while self.device.tx_fifo_free_level() > 0 {
            let Some(frame) = self.tx_queue.pop_pending() else {
                break;
            };
            match self.device.transmit(&frame) {
                Ok(()) => self.tx_queue.record_in_flight(frame),
                Err(_) => errors.assert_flag(ErrorFlag::CanTxFail, now_ms),
            }
        }

        // Retire completed transmissions and echo them to the host.
        while let Some(event) = self.device.take_tx_event() {
            let Some(mut frame) = self.tx_queue.retire() else {
                break;
            };
            if let CanFrame::CanFd(fd) = &mut frame {
                fd.set_error_state_indicator(event.esi);
            }
            self.count_frame(&frame, event.timestamp);
            on_event(BusEvent::Transmitted {
                frame,
                timestamp: event.timestamp,
            });
        }

        // Frames accepted by the filters.
        while let Some(rx) = self.device.receive(RxFifo::Accept) {
            self.count_frame(&rx.frame, rx.timestamp);
            on_event(BusEvent::Received {
                frame: rx.frame,
                timestamp: rx.timestamp,
            });
        }

        // Filtered-out frames still occupy the bus; count them and move on.
        while let Some(rx) = self.device.receive(RxFifo::Monitor) {
            self.count_frame(&rx.frame, rx.timestamp);
        }

        // Fold the traffic of the last window into the load estimate.
        if now_ms.wrapping_sub(self.window_started_ms) >= BUS_LOAD_WINDOW_MS {
            // MAX: 1000 at a fully loaded 1 Mbit bus
            let rate_us_per_ms = (self.window_bits as u64 * self.bit_time_ns as u64
                / 1000
                / BUS_LOAD_WINDOW_MS as u64) as u32;
            self.bus_load_ppm =
                (self.bus_load_ppm * 7 + BUS_LOAD_BUILDUP_PPM / 1000 * rate_us_per_ms) >> 3;
            self.window_bits = 0;
            self.window_started_ms = now_ms;
        }

        // Element loss in the hardware FIFOs.
        if self.device.take_overflow(OverflowKind::TxEvent) {
            errors.assert_flag(ErrorFlag::CanTxFail, now_ms);
        }
        if self.device.take_overflow(OverflowKind::RxAccept) {
            errors.assert_flag(ErrorFlag::CanRxFail, now_ms);
        }
        if self.device.take_overflow(OverflowKind::RxMonitor) {
            errors.assert_flag(ErrorFlag::CanRxFail, now_ms);
        }

        // Bus state and error counters.
        let status = self.device.protocol_status();
        let counters = self.device.error_counters();
        let rec = if counters.rx_at_least_passive {
            128
        } else {
            counters.rx
        };
        if rec > self.health.rec || counters.tx > self.health.tec {
            errors.assert_flag(ErrorFlag::CanBusError, now_ms);
        }
        if status.warning && !self.health.warning {
            errors.assert_flag(ErrorFlag::CanWarning, now_ms);
        }
        if status.error_passive && !self.health.error_passive {
            errors.assert_flag(ErrorFlag::CanErrorPassive, now_ms);
        }
        if status.bus_off && !self.health.bus_off {
            errors.assert_flag(ErrorFlag::CanBusOff, now_ms);
        }

        self.health.bus_off = status.bus_off;
        self.health.error_passive = status.error_passive;
        self.health.warning = status.warning;
        self.health.tec = counters.tx;
        self.health.rec = rec;
        if !matches!(
            status.last_data_error,
            ProtocolErrorCode::None | ProtocolErrorCode::NoChange
        ) {
            self.health.last_error = status.last_data_error;
        }
        if !matches!(
            status.last_error,
            ProtocolErrorCode::None | ProtocolErrorCode::NoChange
        ) {
            self.health.last_error = status.last_error;
        }

        // Main loop cycle time from the bus time counter.
        let stamp = self.device.timestamp_counter();
        let cycle_ns = stamp.wrapping_sub(self.last_cycle_stamp) as u32 * 1000;
        if self.cycle_max_ns < cycle_ns {
            self.cycle_max_ns = cycle_ns;
        }
        self.cycle_avg_ns = (self.cycle_avg_ns * 15 + cycle_ns) >> 4;
        self.last_cycle_stamp = stamp;
    }

    fn count_frame(&mut self, frame: &CanFrame, timestamp: u16) {
        // Don't count the same frame twice
        if timestamp == self.last_frame_timestamp {
            return;
        }
        self.window_bits += frame_bit_count(frame, &self.nominal, &self.data);
        self.last_frame_timestamp = timestamp;
    }
}


#[cfg(test)]
mod tests {
    use embedded_can::StandardId;

    use super::mock::MockDevice;
    use super::*;
    use crate::frame::Can2Frame;

    fn frame(id: u16) -> CanFrame {
        Can2Frame::new_data(StandardId::new(id).unwrap(), &[1, 2]).unwrap().into()
    }

    fn open_transport() -> (CanTransport<MockDevice>, ErrorRegister) {
        let mut transport = CanTransport::new(MockDevice::new());
        transport.open().unwrap();
        (transport, ErrorRegister::new())
    }

    #[test]
    fn open_close_state_machine() {
        let mut transport = CanTransport::new(MockDevice::new());
        assert_eq!(transport.state(), BusState::Closed);
        assert_eq!(transport.close(), Err(CanError::BusClosed));

        transport.open().unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.open(), Err(CanError::BusOpen));

        let started = transport.device().started.unwrap();
        assert_eq!(started.mode, CanMode::Normal);
        assert_eq!(started.nominal, NominalBitrate::Rate125k.timing());
        assert_eq!(started.data, DataBitrate::Rate2M.timing());

        transport.close().unwrap();
        assert!(!transport.is_open());
        assert!(transport.device().started.is_none());
    }

    #[test]
    fn failed_start_stays_closed() {
        let mut device = MockDevice::new();
        device.start_fails = true;
        let mut transport = CanTransport::new(device);

        assert_eq!(transport.open(), Err(CanError::Device(DeviceError)));
        assert_eq!(transport.state(), BusState::Closed);
    }

    #[test]
    fn setters_rejected_while_open() {
        let (mut transport, _) = open_transport();

        assert_eq!(transport.set_mode(CanMode::ListenOnly), Err(CanError::BusOpen));
        assert_eq!(
            transport.set_nominal_preset(NominalBitrate::Rate500k),
            Err(CanError::BusOpen)
        );
        assert_eq!(
            transport.set_data_preset(DataBitrate::Rate5M),
            Err(CanError::BusOpen)
        );
        assert_eq!(
            transport.set_std_filter(FilterConfig::accept_all(0)),
            Err(CanError::BusOpen)
        );

        transport.close().unwrap();
        transport.set_mode(CanMode::ListenOnly).unwrap();
        transport.set_nominal_preset(NominalBitrate::Rate500k).unwrap();
        assert_eq!(transport.nominal_timing(), NominalBitrate::Rate500k.timing());
    }

    #[test]
    fn invalid_timing_rejected() {
        let mut transport = CanTransport::new(MockDevice::new());
        let bad = BitrateConfig::new(0, 70, 9, 8);
        assert!(matches!(
            transport.set_nominal_timing(bad),
            Err(CanError::Bitrate(_))
        ));
        // staged timing untouched
        assert_eq!(transport.nominal_timing(), NominalBitrate::Rate125k.timing());
    }

    #[test]
    fn filter_range_checks() {
        let mut transport = CanTransport::new(MockDevice::new());
        let too_big = FilterConfig {
            enabled: true,
            code: 0x800,
            mask: 0,
        };
        assert_eq!(
            transport.set_std_filter(too_big),
            Err(CanError::FilterOutOfRange(0x800))
        );
        transport
            .set_ext_filter(FilterConfig {
                enabled: false,
                code: 0x1FFF_FFFF,
                mask: 0x1FFF_FFFF,
            })
            .unwrap();
    }

    #[test]
    fn transmit_queue_feeds_hardware_and_echoes() {
        let (mut transport, mut errors) = open_transport();

        transport.enqueue(frame(0x100), &mut errors, 0).unwrap();
        transport.enqueue(frame(0x101), &mut errors, 0).unwrap();

        let mut events = heapless::Vec::<BusEvent, 8>::new();
        transport.process(0, &mut errors, &mut |e| {
            events.push(e).unwrap();
        });
        assert_eq!(transport.device().transmitted.len(), 2);
        assert!(events.is_empty()); // nothing completed yet

        transport.device_mut().tx_events.push_back(TxEvent { timestamp: 10, esi: false }).unwrap();
        transport.device_mut().tx_events.push_back(TxEvent { timestamp: 20, esi: false }).unwrap();
        transport.process(1, &mut errors, &mut |e| {
            events.push(e).unwrap();
        });

        assert_eq!(
            events[..],
            [
                BusEvent::Transmitted { frame: frame(0x100), timestamp: 10 },
                BusEvent::Transmitted { frame: frame(0x101), timestamp: 20 },
            ]
        );
        assert!(!errors.any());
    }

    #[test]
    fn rejected_frame_is_dropped_not_retried() {
        let (mut transport, mut errors) = open_transport();
        transport.device_mut().transmit_fails = true;

        transport.enqueue(frame(0x100), &mut errors, 0).unwrap();
        transport.process(0, &mut errors, &mut |_| {});

        assert!(errors.is_set(ErrorFlag::CanTxFail));
        assert!(transport.device().transmitted.is_empty());

        // Next pass does not resubmit the dropped frame
        transport.device_mut().transmit_fails = false;
        transport.process(1, &mut errors, &mut |_| {});
        assert!(transport.device().transmitted.is_empty());
    }

    #[test]
    fn listen_only_rejects_transmit() {
        let mut transport = CanTransport::new(MockDevice::new());
        transport.set_mode(CanMode::ListenOnly).unwrap();
        transport.open().unwrap();

        let mut errors = ErrorRegister::new();
        assert_eq!(
            transport.enqueue(frame(1), &mut errors, 0),
            Err(CanError::ListenOnly)
        );
    }

    #[test]
    fn queue_overflow_sets_flag() {
        let (mut transport, mut errors) = open_transport();
        transport.device_mut().free_level = 0; // nothing drains

        for _ in 0..TX_QUEUE_LEN {
            transport.enqueue(frame(1), &mut errors, 5).unwrap();
        }
        assert_eq!(
            transport.enqueue(frame(1), &mut errors, 5),
            Err(CanError::TxQueueFull)
        );
        assert!(errors.is_set(ErrorFlag::CanTxQueueFull));
        assert_eq!(errors.timestamp_ms(ErrorFlag::CanTxQueueFull), 5);
    }

    #[test]
    fn received_frames_reach_the_sink() {
        let (mut transport, mut errors) = open_transport();
        transport
            .device_mut()
            .rx_accept
            .push_back(RxFrame { frame: frame(0x42), timestamp: 7 })
            .unwrap();
        transport
            .device_mut()
            .rx_monitor
            .push_back(RxFrame { frame: frame(0x43), timestamp: 9 })
            .unwrap();

        let mut events = heapless::Vec::<BusEvent, 8>::new();
        transport.process(0, &mut errors, &mut |e| {
            events.push(e).unwrap();
        });

        // Monitor traffic is counted but never reported
        assert_eq!(
            events[..],
            [BusEvent::Received { frame: frame(0x42), timestamp: 7 }]
        );
    }

    #[test]
    fn bus_load_builds_up_and_decays() {
        let (mut transport, mut errors) = open_transport();

        // Saturate the window with traffic for a while
        let mut now = 0;
        for _ in 0..50 {
            for stamp in 0..10u16 {
                transport
                    .device_mut()
                    .rx_accept
                    .push_back(RxFrame {
                        frame: frame(0x42),
                        timestamp: (now * 100 + stamp as u32) as u16,
                    })
                    .unwrap();
            }
            now += 100;
            transport.process(now, &mut errors, &mut |_| {});
        }
        let loaded = transport.bus_load_ppm();
        assert!(loaded > 0);

        // An idle bus decays the estimate towards zero
        for _ in 0..50 {
            now += 100;
            transport.process(now, &mut errors, &mut |_| {});
        }
        assert!(transport.bus_load_ppm() < loaded / 10);
    }

    #[test]
    fn error_state_edges_assert_flags() {
        let (mut transport, mut errors) = open_transport();

        transport.device_mut().status.warning = true;
        transport.device_mut().counters = ErrorCounters {
            tx: 96,
            rx: 0,
            rx_at_least_passive: false,
        };
        transport.process(0, &mut errors, &mut |_| {});
        assert!(errors.is_set(ErrorFlag::CanWarning));
        assert!(errors.is_set(ErrorFlag::CanBusError));
        assert_eq!(transport.health().tec, 96);

        // Level stays high: no re-assertion after a clear
        errors.clear();
        transport.process(1, &mut errors, &mut |_| {});
        assert!(!errors.is_set(ErrorFlag::CanWarning));
        assert!(!errors.is_set(ErrorFlag::CanBusError));

        transport.device_mut().status.bus_off = true;
        transport.device_mut().status.error_passive = true;
        transport.process(2, &mut errors, &mut |_| {});
        assert!(errors.is_set(ErrorFlag::CanBusOff));
        assert!(errors.is_set(ErrorFlag::CanErrorPassive));
        assert!(transport.health().bus_off);
    }

    #[test]
    fn last_protocol_error_latches() {
        let (mut transport, mut errors) = open_transport();

        transport.device_mut().status.last_error = ProtocolErrorCode::Ack;
        transport.process(0, &mut errors, &mut |_| {});
        assert_eq!(transport.health().last_error, ProtocolErrorCode::Ack);

        // NoChange keeps the previous code
        transport.device_mut().status.last_error = ProtocolErrorCode::NoChange;
        transport.process(1, &mut errors, &mut |_| {});
        assert_eq!(transport.health().last_error, ProtocolErrorCode::Ack);
    }

    #[test]
    fn cycle_time_tracks_counter_wraparound() {
        let (mut transport, mut errors) = open_transport();

        transport.device_mut().time_us = 100;
        transport.process(0, &mut errors, &mut |_| {});
        assert_eq!(transport.cycle_max_time_ns(), 100_000);

        // 65435 -> 99 wraps the counter and reads as a 200 us cycle
        transport.device_mut().time_us = 65_435;
        transport.process(1, &mut errors, &mut |_| {});
        transport.device_mut().time_us = 99;
        transport.process(2, &mut errors, &mut |_| {});
        assert_eq!(transport.cycle_max_time_ns(), 65_335_000);

        transport.clear_cycle_time();
        assert_eq!(transport.cycle_max_time_ns(), 0);
        assert_eq!(transport.cycle_avg_time_ns(), 0);
    }
}
