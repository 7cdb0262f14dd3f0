//! Bounded drop-tolerant ring.
//!
//! A producer that outruns its consumer must never block and never grow the
//! queue: when the ring is full the oldest entry is discarded to make room.
//! Built on a bounded lock-free channel; the producer half holds a receiver
//! clone solely to evict the oldest entry on overflow.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

/// Producer half of a drop-tolerant ring.
pub struct RingProducer<T> {
    tx: Sender<T>,
    evict: Receiver<T>,
}

/// Consumer half of a drop-tolerant ring.
pub struct RingConsumer<T> {
    rx: Receiver<T>,
}

impl<T> RingProducer<T> {
    /// Push a value, discarding the oldest queued entry if the ring is full.
    pub fn push(&self, mut value: T) {
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return,
                Err(TrySendError::Full(v)) => {
                    // Drop the oldest entry and retry.
                    let _ = self.evict.try_recv();
                    value = v;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> RingConsumer<T> {
    /// Take the oldest entry, if any.
    pub fn pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block until an entry arrives; `None` once the producer is gone and
    /// the ring has drained. This is the suspension point of decode threads.
    pub fn pop_blocking(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.rx.len());
        while let Ok(v) = self.rx.try_recv() {
            out.push(v);
        }
        out
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a drop-tolerant ring holding at most `capacity` entries.
pub fn drop_ring<T>(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    assert!(capacity > 0, "ring capacity must be positive");
    let (tx, rx) = bounded(capacity);
    (
        RingProducer {
            tx,
            evict: rx.clone(),
        },
        RingConsumer { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_below_capacity() {
        let (tx, rx) = drop_ring(4);
        for i in 0..3 {
            tx.push(i);
        }
        assert_eq!(rx.drain(), vec![0, 1, 2]);
    }

    #[test]
    fn overflow_keeps_exactly_the_newest_in_order() {
        // 2d pushes into a ring of depth d retain the last d, in order.
        let depth = 8;
        let (tx, rx) = drop_ring(depth);
        for i in 0..2 * depth {
            tx.push(i);
        }
        assert_eq!(rx.len(), depth);
        assert_eq!(rx.drain(), (depth..2 * depth).collect::<Vec<_>>());
    }

    #[test]
    fn consumer_at_half_rate_sees_recent_packets() {
        // Producer pushes 20, consumer drains after the fact: only the
        // freshest `depth` survive.
        let (tx, rx) = drop_ring(8);
        for i in 0..20 {
            tx.push(i);
        }
        let got = rx.drain();
        assert_eq!(got, (12..20).collect::<Vec<_>>());
    }

    #[test]
    fn pop_blocking_ends_when_producer_drops() {
        let (tx, rx) = drop_ring(2);
        tx.push(1);
        drop(tx);
        assert_eq!(rx.pop_blocking(), Some(1));
        assert_eq!(rx.pop_blocking(), None);
    }

    #[test]
    fn producer_never_blocks() {
        let (tx, rx) = drop_ring(1);
        let handle = std::thread::spawn(move || {
            for i in 0..10_000 {
                tx.push(i);
            }
        });
        handle.join().unwrap();
        let rest = rx.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0], 9_999);
    }
}
