//! USB-CDC plumbing between the interrupt context and the main loop.
//!
//! Received packets are staged as fixed 64-byte chunks in a critical-section
//! protected ring so the CDC receive interrupt never touches protocol state.
//! Outbound bytes accumulate in a byte ring drained one packet at a time
//! whenever the endpoint is free.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Deque;

use crate::buffer::Full;
use crate::slcan::SLCAN_MTU;

/// Full-speed CDC bulk packet size.
pub const CDC_CHUNK_SIZE: usize = 64;
pub const CDC_RX_CHUNKS: usize = 8;
pub const CDC_TX_RING: usize = 4096;

/// One received CDC packet, copied out of the endpoint buffer.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Chunk {
    data: [u8; CDC_CHUNK_SIZE],
    len: usize,
}

impl Chunk {
    /// Copies a packet into a chunk. Packets over [`CDC_CHUNK_SIZE`] bytes
    /// are rejected.
    pub fn new(packet: &[u8]) -> Option<Self> {
        if packet.len() > CDC_CHUNK_SIZE {
            return None;
        }
        let mut data = [0u8; CDC_CHUNK_SIZE];
        data[..packet.len()].copy_from_slice(packet);
        Some(Self {
            data,
            len: packet.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

struct RxShared {
    ring: Deque<Chunk, CDC_RX_CHUNKS>,
    overflowed: bool,
}

/// Receive side of the host link, shared with the CDC interrupt.
///
/// The interrupt pushes, the main loop pops. Packets arriving while the ring
/// is full are dropped and the loss is flagged.
pub struct CdcRxQueue {
    shared: Mutex<RefCell<RxShared>>,
}

impl CdcRxQueue {
    pub const fn new() -> Self {
        Self {
            shared: Mutex::new(RefCell::new(RxShared {
                ring: Deque::new(),
                overflowed: false,
            })),
        }
    }

    /// Called from the CDC receive interrupt with one endpoint packet.
    pub fn push_from_isr(&self, packet: &[u8]) {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow_ref_mut(cs);
            match Chunk::new(packet) {
                Some(chunk) => {
                    if shared.ring.push_back(chunk).is_err() {
                        shared.overflowed = true;
                    }
                }
                None => shared.overflowed = true,
            }
        })
    }

    pub fn pop_chunk(&self) -> Option<Chunk> {
        critical_section::with(|cs| self.shared.borrow_ref_mut(cs).ring.pop_front())
    }

    /// Reads and clears the packet-loss flag.
    pub fn take_overflow(&self) -> bool {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow_ref_mut(cs);
            core::mem::take(&mut shared.overflowed)
        })
    }
}

impl Default for CdcRxQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits the host byte stream into CR-terminated command lines.
///
/// A line longer than the protocol MTU cannot be a valid command; it is
/// discarded as a whole once its CR arrives.
pub struct LineAssembler {
    buf: [u8; SLCAN_MTU],
    len: usize,
    overflowed: bool,
}

impl LineAssembler {
    pub const fn new() -> Self {
        Self {
            buf: [0; SLCAN_MTU],
            len: 0,
            overflowed: false,
        }
    }

    /// Feeds one byte; returns the completed line (without the CR) when the
    /// byte terminates one.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\r' {
            let len = self.len;
            self.len = 0;
            if core::mem::take(&mut self.overflowed) {
                return None;
            }
            return Some(&self.buf[..len]);
        }

        if self.len == self.buf.len() {
            self.overflowed = true;
        } else {
            self.buf[self.len] = byte;
            self.len += 1;
        }
        None
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound byte ring in front of the CDC IN endpoint.
///
/// Writes are all or nothing so a reply or frame report is never truncated
/// mid-line.
pub struct CdcTxRing {
    ring: Deque<u8, CDC_TX_RING>,
}

impl CdcTxRing {
    pub const fn new() -> Self {
        Self { ring: Deque::new() }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn enqueue(&mut self, data: &[u8]) -> Result<(), Full> {
        if CDC_TX_RING - self.ring.len() < data.len() {
            return Err(Full);
        }
        for &byte in data {
            // Cannot fail, space was checked above
            let _ = self.ring.push_back(byte);
        }
        Ok(())
    }

    /// Moves up to `packet.len()` bytes into the endpoint buffer and returns
    /// how many were written.
    pub fn fill_packet(&mut self, packet: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < packet.len() {
            let Some(byte) = self.ring.pop_front() else {
                break;
            };
            packet[filled] = byte;
            filled += 1;
        }
        filled
    }
}

impl Default for CdcTxRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Transmit side of the CDC driver.
pub trait CdcPort {
    /// Whether the IN endpoint can accept another packet.
    fn write_ready(&self) -> bool;
    fn write_packet(&mut self, data: &[u8]);
}
