//! Lock-free triple buffer for sharing latest-value state between a single
//! producer and a single consumer.
//!
//! Three slots rotate through the roles front (consumer side), middle
//! (hand-off), and back (producer side). The producer fills the back slot
//! and atomically swaps it with the middle; the consumer atomically swaps
//! the middle with its front slot when fresh data is available. Neither
//! side ever waits, and the consumer always sees a complete value.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

// Role state packed into one byte: two bits per slot index, plus a
// freshness flag set by the producer and cleared by the consumer.
const FRONT_SHIFT: u8 = 0;
const MIDDLE_SHIFT: u8 = 2;
const BACK_SHIFT: u8 = 4;
const INDEX_MASK: u8 = 0b11;
const FRESH: u8 = 0x40;

struct Shared<T> {
    slots: [UnsafeCell<T>; 3],
    state: AtomicU8,
}

// The role rotation guarantees the producer and consumer never hold the
// same slot index at the same time.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new(init: impl Fn() -> T) -> Self {
        Shared {
            slots: [
                UnsafeCell::new(init()),
                UnsafeCell::new(init()),
                UnsafeCell::new(init()),
            ],
            // front = 0, middle = 1, back = 2, nothing fresh
            state: AtomicU8::new((2 << BACK_SHIFT) | (1 << MIDDLE_SHIFT)),
        }
    }

    fn slot_of(state: u8, shift: u8) -> usize {
        ((state >> shift) & INDEX_MASK) as usize
    }
}

/// Producer half of a triple buffer.
pub struct TripleBufferWriter<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer half of a triple buffer.
pub struct TripleBufferReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> TripleBufferWriter<T> {
    /// In-place access to the back slot. Publish with
    /// [`publish`](TripleBufferWriter::publish) to hand it to the reader.
    pub fn back_mut(&mut self) -> &mut T {
        let state = self.shared.state.load(Ordering::Acquire);
        let back = Shared::<T>::slot_of(state, BACK_SHIFT);
        // Safety: this half is the only writer, and `back` is never the
        // consumer's front slot.
        unsafe { &mut *self.shared.slots[back].get() }
    }

    /// Swap the back slot into the hand-off position and mark it fresh.
    pub fn publish(&mut self) {
        loop {
            let state = self.shared.state.load(Ordering::Acquire);
            let front = Shared::<T>::slot_of(state, FRONT_SHIFT);
            let middle = Shared::<T>::slot_of(state, MIDDLE_SHIFT);
            let back = Shared::<T>::slot_of(state, BACK_SHIFT);
            let next = ((middle as u8) << BACK_SHIFT)
                | ((back as u8) << MIDDLE_SHIFT)
                | ((front as u8) << FRONT_SHIFT)
                | FRESH;
            if self
                .shared
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Store a value and publish it.
    pub fn write(&mut self, value: T) {
        *self.back_mut() = value;
        self.publish();
    }
}

impl<T> TripleBufferReader<T> {
    /// Whether the producer has published since the last acquire.
    pub fn has_new(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) & FRESH != 0
    }

    /// Claim the most recently published value if there is one. Returns
    /// true when the front slot changed.
    pub fn acquire(&mut self) -> bool {
        loop {
            let state = self.shared.state.load(Ordering::Acquire);
            if state & FRESH == 0 {
                return false;
            }
            let front = Shared::<T>::slot_of(state, FRONT_SHIFT);
            let middle = Shared::<T>::slot_of(state, MIDDLE_SHIFT);
            let back = Shared::<T>::slot_of(state, BACK_SHIFT);
            let next = ((back as u8) << BACK_SHIFT)
                | ((front as u8) << MIDDLE_SHIFT)
                | ((middle as u8) << FRONT_SHIFT);
            if self
                .shared
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// The current front value, without checking for fresh data.
    pub fn current(&self) -> &T {
        let state = self.shared.state.load(Ordering::Acquire);
        let front = Shared::<T>::slot_of(state, FRONT_SHIFT);
        // Safety: this half is the only reader, and `front` is never the
        // producer's back slot.
        unsafe { &*self.shared.slots[front].get() }
    }

    /// Acquire the latest published value and inspect it.
    pub fn latest<R>(&mut self, f: impl FnOnce(&T) -> R) -> R {
        self.acquire();
        f(self.current())
    }
}

/// Create a triple buffer whose slots start as `T::default()`.
pub fn triple_buffer<T: Default>() -> (TripleBufferWriter<T>, TripleBufferReader<T>) {
    let shared = Arc::new(Shared::new(T::default));
    (
        TripleBufferWriter {
            shared: Arc::clone(&shared),
        },
        TripleBufferReader { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_sees_latest_write() {
        let (mut w, mut r) = triple_buffer::<u32>();
        w.write(1);
        w.write(2);
        w.write(3);
        assert!(r.has_new());
        assert!(r.acquire());
        assert_eq!(*r.current(), 3);
    }

    #[test]
    fn acquire_without_publish_keeps_front() {
        let (mut w, mut r) = triple_buffer::<u32>();
        w.write(7);
        assert!(r.acquire());
        assert!(!r.acquire());
        assert_eq!(*r.current(), 7);
    }

    #[test]
    fn in_place_update_then_publish() {
        let (mut w, mut r) = triple_buffer::<Vec<u32>>();
        w.back_mut().push(1);
        w.back_mut().push(2);
        w.publish();
        assert_eq!(r.latest(|v| v.len()), 2);
    }

    #[test]
    fn concurrent_producer_never_tears_values() {
        let (mut w, mut r) = triple_buffer::<[u64; 4]>();
        let writer = std::thread::spawn(move || {
            for i in 1..=10_000u64 {
                w.write([i; 4]);
            }
        });
        let mut last = 0;
        for _ in 0..10_000 {
            let v = r.latest(|v| *v);
            assert!(v.iter().all(|&x| x == v[0]), "torn value: {:?}", v);
            assert!(v[0] >= last);
            last = v[0];
        }
        writer.join().unwrap();
    }
}
