//! # conclave-media
//!
//! The real-time media protocols of the Conclave hub: compressed audio
//! (`"audio"`) and compressed video (`"video"`), each with the producer and
//! consumer pipelines feeding them — capture, encode, drop-tolerant
//! queueing, jitter-buffered decode, and render hand-off.
//!
//! The actual capture devices, codecs, and output backends are not part of
//! the hub; they plug in behind the capability traits in [`caps`]. A client
//! without a codec stays wire-compatible: it reads and discards the opaque
//! media payloads.

pub mod audio;
pub mod caps;
pub mod video;

pub use audio::{AudioClient, AudioConfig, AudioServer};
pub use video::{VideoClient, VideoConfig, VideoServer};
