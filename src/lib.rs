#![cfg_attr(not(test), no_std)]

//! Firmware core of a USB to CAN/CAN FD adapter speaking the SLCAN ASCII
//! protocol. Everything here is hardware independent: the CAN controller and
//! the settings flash plug in through the [`can::CanDevice`] and
//! [`nvm::NvmStore`] traits, the CDC driver through [`bridge::CdcPort`] and
//! [`bridge::CdcRxQueue`].

pub mod bitrate;
pub mod bridge;
pub mod buffer;
pub mod can;
mod codec;
pub mod error;
pub mod frame;
pub mod nvm;
pub mod slcan;

pub use embedded_can::{ExtendedId, Id, StandardId};

pub use crate::frame::{Can2Frame, CanFdFrame, CanFrame, FdDataLengthCode};

use crate::bridge::{CdcPort, CdcRxQueue, CdcTxRing, LineAssembler, CDC_CHUNK_SIZE};
use crate::can::{CanDevice, CanError, CanMode, CanTransport};
use crate::error::{ErrorFlag, ErrorRegister};
use crate::nvm::{Nvm, NvmStore};
use crate::slcan::{parse_command, AutoStartupMode, SlcanInterface, BELL, OK, SLCAN_MTU};

/// The adapter itself, minus the hardware.
///
/// The main loop calls [`poll`](Self::poll) as fast as it can; the CDC
/// receive interrupt feeds the shared [`CdcRxQueue`].
pub struct Gateway<'a, D: CanDevice, S: NvmStore> {
    can: CanTransport<D>,
    protocol: SlcanInterface,
    nvm: Nvm<S>,
    errors: ErrorRegister,
    host_rx: &'a CdcRxQueue,
    assembler: LineAssembler,
    host_tx: CdcTxRing,
}

impl<'a, D: CanDevice, S: NvmStore> Gateway<'a, D, S> {
    pub fn new(device: D, store: S, host_rx: &'a CdcRxQueue) -> Self {
        Self {
            can: CanTransport::new(device),
            protocol: SlcanInterface::new(),
            nvm: Nvm::new(store),
            errors: ErrorRegister::new(),
            host_rx,
            assembler: LineAssembler::new(),
            host_tx: CdcTxRing::new(),
        }
    }

    pub fn can(&self) -> &CanTransport<D> {
        &self.can
    }

    pub fn can_mut(&mut self) -> &mut CanTransport<D> {
        &mut self.can
    }

    pub fn errors(&self) -> &ErrorRegister {
        &self.errors
    }

    /// Applies the persisted auto-startup configuration, if one is armed,
    /// and opens the channel. Called once before the first poll.
    pub fn startup(&mut self, now_ms: u32) {
        let Some(config) = self.nvm.startup_config() else {
            return;
        };
        let mode = match config.mode {
            AutoStartupMode::Off => return,
            AutoStartupMode::Normal => CanMode::Normal,
            AutoStartupMode::ListenOnly => CanMode::ListenOnly,
        };

        self.protocol.set_timestamp_mode(config.timestamp_mode);

        let result = (|| -> Result<(), CanError> {
            if let Some(timing) = config.nominal {
                self.can.set_nominal_timing(timing)?;
            }
            if let Some(timing) = config.data {
                self.can.set_data_timing(timing)?;
            }
            if let Some(filter) = config.std_filter {
                self.can.set_std_filter(filter)?;
            }
            if let Some(filter) = config.ext_filter {
                self.can.set_ext_filter(filter)?;
            }
            self.can.set_mode(mode)?;
            self.errors.clear();
            self.can.clear_cycle_time();
            self.can.open()
        })();

        if result.is_err() {
            self.errors.assert_flag(ErrorFlag::PeriphInit, now_ms);
        }
    }

    /// One pass of the main loop: host commands in, CAN traffic through,
    /// pending host bytes out.
    pub fn poll(&mut self, now_ms: u32, port: &mut impl CdcPort) {
        if self.host_rx.take_overflow() {
            self.errors.assert_flag(ErrorFlag::UsbRxFull, now_ms);
        }

        while let Some(chunk) = self.host_rx.pop_chunk() {
            for &byte in chunk.as_slice() {
                let Some(line) = self.assembler.feed(byte) else {
                    continue;
                };
                // Copied out so the assembler is free for the next line
                let Ok(line) = heapless::Vec::<u8, SLCAN_MTU>::from_slice(line) else {
                    continue;
                };
                self.run_line(&line, now_ms);
            }
        }

        let Self {
            can,
            protocol,
            errors,
            host_tx,
            ..
        } = self;
        let mut tx_overflow = false;
        can.process(now_ms, errors, &mut |event| {
            if let Some(text) = protocol.encode_bus_event(&event, now_ms) {
                if host_tx.enqueue(&text).is_err() {
                    tx_overflow = true;
                }
            }
        });
        if tx_overflow {
            errors.assert_flag(ErrorFlag::UsbTxFull, now_ms);
        }

        if port.write_ready() && !self.host_tx.is_empty() {
            let mut packet = [0u8; CDC_CHUNK_SIZE];
            let len = self.host_tx.fill_packet(&mut packet);
            port.write_packet(&packet[..len]);
        }
    }

    fn run_line(&mut self, line: &[u8], now_ms: u32) {
        // A bare CR is a keep-alive, acknowledged without parsing
        if line.is_empty() {
            self.reply(OK, now_ms);
            return;
        }

        let command = match parse_command(line) {
            Ok(command) => command,
            Err(_) => {
                self.reply(&[BELL], now_ms);
                return;
            }
        };

        let Self {
            can,
            protocol,
            nvm,
            errors,
            host_tx,
            ..
        } = self;
        let mut tx_overflow = false;
        let result = protocol.execute(command, can, nvm, errors, now_ms, &mut |text| {
            if host_tx.enqueue(text).is_err() {
                tx_overflow = true;
            }
        });
        if tx_overflow {
            errors.assert_flag(ErrorFlag::UsbTxFull, now_ms);
        }
        if result.is_err() {
            self.reply(&[BELL], now_ms);
        }
    }

    fn reply(&mut self, text: &[u8], now_ms: u32) {
        if self.host_tx.enqueue(text).is_err() {
            self.errors.assert_flag(ErrorFlag::UsbTxFull, now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitrate::NominalBitrate;
    use crate::can::mock::MockDevice;
    use crate::can::{BusState, CanMode, FilterConfig, TxEvent};
    use crate::nvm::mock::MockStore;
    use crate::slcan::TimestampMode;

    struct MockPort {
        ready: bool,
        written: heapless::Vec<u8, 1024>,
    }

    impl MockPort {
        fn new() -> Self {
            Self {
                ready: true,
                written: heapless::Vec::new(),
            }
        }

        fn take(&mut self) -> heapless::Vec<u8, 1024> {
            core::mem::take(&mut self.written)
        }
    }

    impl CdcPort for MockPort {
        fn write_ready(&self) -> bool {
            self.ready
        }

        fn write_packet(&mut self, data: &[u8]) {
            self.written.extend_from_slice(data).unwrap();
        }
    }

    fn send(gateway: &mut Gateway<MockDevice, MockStore>, port: &mut MockPort, line: &[u8], now_ms: u32) {
        gateway.host_rx.push_from_isr(line);
        gateway.poll(now_ms, port);
    }

    #[test]
    fn command_reply_round_trip() {
        let host_rx = CdcRxQueue::new();
        let mut gateway = Gateway::new(MockDevice::new(), MockStore::erased(), &host_rx);
        let mut port = MockPort::new();

        send(&mut gateway, &mut port, b"V\r", 0);
        assert_eq!(&port.take()[..], b"V0101\r");

        // Unknown and malformed commands ring the bell
        send(&mut gateway, &mut port, b"X\r", 0);
        assert_eq!(&port.take()[..], &[slcan::BELL]);
        send(&mut gateway, &mut port, b"t0011223\r", 0);
        assert_eq!(&port.take()[..], &[slcan::BELL]);

        // A bare CR is acknowledged
        send(&mut gateway, &mut port, b"\r", 0);
        assert_eq!(&port.take()[..], b"\r");
    }

    #[test]
    fn transmit_and_echo_flow() {
        let host_rx = CdcRxQueue::new();
        let mut gateway = Gateway::new(MockDevice::new(), MockStore::erased(), &host_rx);
        let mut port = MockPort::new();

        send(&mut gateway, &mut port, b"S6\rO\r", 0);
        assert_eq!(&port.take()[..], b"\r\r");
        assert!(gateway.can().is_open());

        send(&mut gateway, &mut port, b"t001122\r", 1);
        assert_eq!(&port.take()[..], b"z\r");
        assert_eq!(gateway.can().device().transmitted.len(), 1);

        // The completed transmission is not echoed with TX reporting off
        gateway
            .can_mut()
            .device_mut()
            .tx_events
            .push_back(TxEvent {
                timestamp: 50,
                esi: false,
            })
            .unwrap();
        gateway.poll(2, &mut port);
        assert!(port.take().is_empty());
    }

    #[test]
    fn received_frames_are_reported() {
        let host_rx = CdcRxQueue::new();
        let mut gateway = Gateway::new(MockDevice::new(), MockStore::erased(), &host_rx);
        let mut port = MockPort::new();

        send(&mut gateway, &mut port, b"O\r", 0);
        port.take();

        gateway
            .can_mut()
            .device_mut()
            .rx_accept
            .push_back(crate::can::RxFrame {
                frame: Can2Frame::new_data(StandardId::new(0x123).unwrap(), &[0xAB])
                    .unwrap()
                    .into(),
                timestamp: 7,
            })
            .unwrap();
        gateway.poll(1, &mut port);
        assert_eq!(&port.take()[..], b"t1231AB\r");
    }

    #[test]
    fn pending_bytes_wait_for_the_endpoint() {
        let host_rx = CdcRxQueue::new();
        let mut gateway = Gateway::new(MockDevice::new(), MockStore::erased(), &host_rx);
        let mut port = MockPort::new();
        port.ready = false;

        send(&mut gateway, &mut port, b"V\r", 0);
        assert!(port.written.is_empty());

        port.ready = true;
        gateway.poll(1, &mut port);
        assert_eq!(&port.take()[..], b"V0101\r");
    }

    #[test]
    fn armed_startup_opens_the_channel() {
        let mut seed = Nvm::new(MockStore::erased());
        seed.save_startup(
            AutoStartupMode::ListenOnly,
            TimestampMode::Milliseconds,
            NominalBitrate::Rate500k.timing(),
            crate::bitrate::DataBitrate::Rate2M.timing(),
            FilterConfig::accept_all(0x7FF),
            FilterConfig::accept_all(0x1FFF_FFFF),
        )
        .unwrap();

        let host_rx = CdcRxQueue::new();
        let mut gateway = Gateway::new(MockDevice::new(), seed.release(), &host_rx);
        gateway.startup(0);

        assert_eq!(gateway.can().state(), BusState::Open);
        assert_eq!(gateway.can().mode(), CanMode::ListenOnly);
        assert_eq!(
            gateway.can().nominal_timing(),
            NominalBitrate::Rate500k.timing()
        );
        assert!(!gateway.errors().any());
    }

    #[test]
    fn failed_startup_flags_the_peripheral() {
        let mut seed = Nvm::new(MockStore::erased());
        seed.save_startup(
            AutoStartupMode::Normal,
            TimestampMode::Off,
            NominalBitrate::Rate125k.timing(),
            crate::bitrate::DataBitrate::Rate2M.timing(),
            FilterConfig::accept_all(0x7FF),
            FilterConfig::accept_all(0x1FFF_FFFF),
        )
        .unwrap();

        let mut device = MockDevice::new();
        device.start_fails = true;
        let host_rx = CdcRxQueue::new();
        let mut gateway = Gateway::new(device, seed.release(), &host_rx);
        gateway.startup(5);

        assert_eq!(gateway.can().state(), BusState::Closed);
        assert!(gateway.errors().is_set(ErrorFlag::PeriphInit));
    }

    #[test]
    fn disarmed_startup_stays_closed() {
        let mut seed = Nvm::new(MockStore::erased());
        seed.save_startup(
            AutoStartupMode::Off,
            TimestampMode::Off,
            NominalBitrate::Rate125k.timing(),
            crate::bitrate::DataBitrate::Rate2M.timing(),
            FilterConfig::accept_all(0x7FF),
            FilterConfig::accept_all(0x1FFF_FFFF),
        )
        .unwrap();

        let host_rx = CdcRxQueue::new();
        let mut gateway = Gateway::new(MockDevice::new(), seed.release(), &host_rx);
        gateway.startup(0);
        assert_eq!(gateway.can().state(), BusState::Closed);
    }

    #[test]
    fn rx_overflow_raises_the_flag() {
        let host_rx = CdcRxQueue::new();
        for _ in 0..bridge::CDC_RX_CHUNKS + 1 {
            host_rx.push_from_isr(b"V\r");
        }

        let mut gateway = Gateway::new(MockDevice::new(), MockStore::erased(), &host_rx);
        let mut port = MockPort::new();
        gateway.poll(3, &mut port);
        assert!(gateway.errors().is_set(ErrorFlag::UsbRxFull));
    }
}
