//! Compressed-audio protocol.
//!
//! The sender captures fixed-size PCM frames, encodes them, and queues the
//! packets in a drop-tolerant ring drained with every CLIENT_UPDATE. The
//! server keeps one drop-tolerant queue per client and fans the survivors
//! out; receivers smooth arrival timing in a jitter buffer, decode on a
//! per-remote thread, and play back from the host's audio callback at the
//! speaker's projected mouth position.

mod client;
mod server;

pub use client::AudioClient;
pub use server::AudioServer;

use serde::Deserialize;

use conclave_types::Point;

/// Protocol name binding the two plugin halves.
pub const PROTOCOL_NAME: &str = "audio";
/// Protocol version carried in the connect payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// Connect payload: version, mouth point, three cardinals.
pub const CONNECT_PAYLOAD_LEN: u32 = 4 + 12 + 3 * 4;

/// Sanity bounds on negotiated stream geometry.
pub const MAX_FRAME_SIZE: u32 = 1 << 16;
pub const MAX_PACKET_SIZE: u32 = 4096;
pub const MAX_QUEUE_SIZE: u32 = 256;

/// Audio plugin configuration (the `audio` section of the config tree).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConfig {
    /// Capture and transmit local audio.
    pub enable_recording: bool,
    /// Capture device name, resolved by the embedding backend.
    pub recording_pcm_device_name: String,
    /// Depth of the encoded-packet send queue.
    pub send_queue_size: usize,
    /// Depth of the per-remote jitter buffer.
    pub jitter_buffer_size: usize,
    /// Distance attenuation rolloff for remote voices; 0 disables it.
    pub rolloff_factor: f32,
    /// The local speaker's mouth position in the main viewer's space.
    pub mouth_position: Point,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            enable_recording: false,
            recording_pcm_device_name: String::new(),
            send_queue_size: 8,
            jitter_buffer_size: 6,
            rolloff_factor: 1.0,
            mouth_position: Point::ORIGIN,
        }
    }
}
