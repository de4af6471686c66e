//! Bounded FIFO for envelopes sent while no transport is open.

use std::collections::VecDeque;

use exo_core::Envelope;

/// Default number of envelopes held while disconnected.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Outbound buffer. When full, the oldest envelope is dropped.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Envelope>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` envelopes (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append an envelope, returning the one evicted to make room.
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(envelope);
        evicted
    }

    /// Hand queued envelopes to `send` in FIFO order.
    ///
    /// Stops at the first envelope `send` hands back; it and everything after
    /// it stay queued in order. Returns how many were sent.
    pub fn flush(&mut self, mut send: impl FnMut(Envelope) -> Result<(), Envelope>) -> usize {
        let mut sent = 0;
        while let Some(envelope) = self.items.pop_front() {
            if let Err(envelope) = send(envelope) {
                self.items.push_front(envelope);
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Discard everything, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    /// Number of queued envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total envelopes evicted by overflow.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(n: usize) -> Envelope {
        Envelope::chat(format!("m{n}"))
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = OutboundQueue::new(3);
        for n in 0..3 {
            assert!(queue.push(chat(n)).is_none());
        }
        assert_eq!(queue.push(chat(3)), Some(chat(0)));
        assert_eq!(queue.push(chat(4)), Some(chat(1)));
        assert_eq!(queue.dropped(), 2);

        let mut out = Vec::new();
        queue.flush(|e| {
            out.push(e);
            Ok(())
        });
        assert_eq!(out, [chat(2), chat(3), chat(4)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failed_flush_keeps_order() {
        let mut queue = OutboundQueue::new(8);
        for n in 0..4 {
            queue.push(chat(n));
        }

        let mut out = Vec::new();
        let sent = queue.flush(|e| {
            if out.len() == 2 {
                return Err(e);
            }
            out.push(e);
            Ok(())
        });
        assert_eq!(sent, 2);
        assert_eq!(queue.len(), 2);

        queue.flush(|e| {
            out.push(e);
            Ok(())
        });
        assert_eq!(out, (0..4).map(chat).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut queue = OutboundQueue::new(0);
        queue.push(chat(0));
        assert_eq!(queue.push(chat(1)), Some(chat(0)));
        assert_eq!(queue.clear(), 1);
    }
}
