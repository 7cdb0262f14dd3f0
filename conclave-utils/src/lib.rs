//! # conclave-utils
//!
//! Thread-communication containers used throughout the Conclave hub: a
//! lock-free triple buffer for latest-value state sharing, and a bounded
//! drop-tolerant ring for media packet queues that must never block their
//! producer.

mod drop_ring;
mod triple_buffer;

pub use drop_ring::{drop_ring, RingConsumer, RingProducer};
pub use triple_buffer::{triple_buffer, TripleBufferReader, TripleBufferWriter};
