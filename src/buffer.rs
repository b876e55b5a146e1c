use heapless::Deque;

use crate::frame::CanFrame;

/// Error returned when a fixed-capacity buffer cannot accept more data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("buffer is full")]
pub struct Full;

/// Transmit queue in front of the CAN hardware FIFO.
///
/// Frames move through two stages: `pending` until a hardware mailbox is
/// free, then `in_flight` until the controller reports the completed
/// transmission, at which point the frame is retired (and echoed to the
/// host). Total occupancy across both stages is bounded by `N`.
///
/// Delivery is at most once: a frame the hardware rejects is dropped, never
/// retried.
pub struct TxQueue<const N: usize> {
    pending: Deque<CanFrame, N>,
    in_flight: Deque<CanFrame, N>,
}

impl<const N: usize> TxQueue<N> {
    pub const fn new() -> Self {
        Self {
            pending: Deque::new(),
            in_flight: Deque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Accepts a frame for transmission.
    pub fn enqueue(&mut self, frame: CanFrame) -> Result<(), Full> {
        if self.is_full() {
            return Err(Full);
        }
        self.pending.push_back(frame).map_err(|_| Full)
    }

    /// Takes the oldest frame that has not been handed to the hardware yet.
    pub fn pop_pending(&mut self) -> Option<CanFrame> {
        self.pending.pop_front()
    }

    /// Records a frame the hardware accepted; it will be retired by the
    /// matching transmit event.
    pub fn record_in_flight(&mut self, frame: CanFrame) {
        // cannot fail: the frame came out of `pending` a moment ago
        let _ = self.in_flight.push_back(frame);
    }

    /// Retires the oldest in-flight frame. The hardware FIFO preserves
    /// order, so completion events arrive in submission order.
    pub fn retire(&mut self) -> Option<CanFrame> {
        self.in_flight.pop_front()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight.clear();
    }
}

impl<const N: usize> Default for TxQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use embedded_can::StandardId;

    use super::*;
    use crate::frame::Can2Frame;

    fn frame(id: u16) -> CanFrame {
        Can2Frame::new_data(StandardId::new(id).unwrap(), &[]).unwrap().into()
    }

    #[test]
    fn frames_flow_through_in_order() {
        let mut queue: TxQueue<4> = TxQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pop_pending(), None);
        assert_eq!(queue.retire(), None);

        queue.enqueue(frame(1)).unwrap();
        queue.enqueue(frame(2)).unwrap();
        assert_eq!(queue.len(), 2);

        let first = queue.pop_pending().unwrap();
        assert_eq!(first, frame(1));
        queue.record_in_flight(first);

        // The in-flight frame still occupies a slot
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.retire(), Some(frame(1)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_pending(), Some(frame(2)));
    }

    #[test]
    fn capacity_counts_both_stages() {
        let mut queue: TxQueue<2> = TxQueue::new();
        queue.enqueue(frame(1)).unwrap();
        queue.enqueue(frame(2)).unwrap();
        assert_eq!(queue.enqueue(frame(3)), Err(Full));

        let sent = queue.pop_pending().unwrap();
        queue.record_in_flight(sent);
        assert_eq!(queue.enqueue(frame(3)), Err(Full));

        queue.retire().unwrap();
        queue.enqueue(frame(3)).unwrap();
        assert!(queue.is_full());
    }

    #[test]
    fn clear_drops_everything() {
        let mut queue: TxQueue<4> = TxQueue::new();
        queue.enqueue(frame(1)).unwrap();
        let sent = queue.pop_pending().unwrap();
        queue.record_in_flight(sent);
        queue.enqueue(frame(2)).unwrap();

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.retire(), None);
        assert_eq!(queue.pop_pending(), None);
    }
}
