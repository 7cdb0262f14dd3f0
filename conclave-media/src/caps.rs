//! Capability traits for the media backends.
//!
//! Capture devices, codecs, and output backends live outside the hub; the
//! pipelines only ever see these seams. Implementations are provided by the
//! embedding application (and by in-crate fakes in the test suites).

use std::io;

use conclave_types::Point;

/// A blocking PCM capture source (16 kHz mono assumed).
pub trait PcmSource: Send {
    /// Fill `frame` with the next capture frame. Blocks until a full frame
    /// is available.
    fn read_frame(&mut self, frame: &mut [i16]) -> io::Result<()>;
}

/// Streaming audio encoder producing fixed-size packets.
pub trait AudioEncoder: Send {
    fn encode(&mut self, frame: &[i16], packet: &mut [u8]) -> io::Result<()>;
}

/// Streaming audio decoder consuming fixed-size packets.
pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &[u8], frame: &mut [i16]) -> io::Result<()>;
}

/// An audio codec: fixed frame/packet geometry plus per-stream encoder and
/// decoder instances.
pub trait AudioCodec: Send + Sync {
    /// Samples per codec frame.
    fn frame_size(&self) -> usize;
    /// Bytes per encoded packet.
    fn packet_size(&self) -> usize;
    fn new_encoder(&self) -> io::Result<Box<dyn AudioEncoder>>;
    fn new_decoder(&self) -> io::Result<Box<dyn AudioDecoder>>;
}

/// A spatialised playback source with a fixed pool of streaming buffers,
/// driven by the host's audio callback.
pub trait PlaybackSink: Send {
    /// Total number of streaming buffers in the pool.
    fn buffer_count(&self) -> usize;
    /// Reclaim buffers the device finished playing; returns how many
    /// buffers are currently free.
    fn free_buffers(&mut self) -> usize;
    /// Fill one free buffer with a decoded frame and queue it.
    fn queue_frame(&mut self, frame: &[i16]) -> io::Result<()>;
    /// Whether the source is currently playing.
    fn is_playing(&mut self) -> bool;
    /// (Re)start playback after an underflow.
    fn restart(&mut self) -> io::Result<()>;
    /// Position the source in the listener's physical space.
    fn set_position(&mut self, position: Point);
    /// Distance attenuation rolloff; 0 disables attenuation.
    fn set_rolloff(&mut self, rolloff: f32);
}

/// Factory for per-remote playback sinks.
pub trait PlaybackBackend: Send + Sync {
    fn new_sink(&self) -> io::Result<Box<dyn PlaybackSink>>;
}

/// An uncompressed planar Y'CbCr 4:2:0 frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Y at full resolution, Cb and Cr at quarter resolution.
    pub planes: [Vec<u8>; 3],
}

impl VideoFrame {
    pub fn new(width: u32, height: u32) -> Self {
        let luma = (width * height) as usize;
        VideoFrame {
            width,
            height,
            planes: [vec![0; luma], vec![0; luma / 4], vec![0; luma / 4]],
        }
    }
}

/// Converts a raw capture frame into the codec's planar format.
pub trait ImageExtractor: Send {
    fn extract(&mut self, raw: &[u8], out: &mut VideoFrame) -> io::Result<()>;
}

/// Streaming video encoder.
pub trait VideoEncoder: Send {
    /// The codec's stream-setup packets, transmitted once at connect time.
    fn stream_headers(&mut self) -> io::Result<Vec<u8>>;
    /// Encode one frame; encoders may buffer, so a packet is optional.
    fn encode(&mut self, frame: &VideoFrame) -> io::Result<Option<crate::video::VideoPacket>>;
}

/// Streaming video decoder.
pub trait VideoDecoder: Send {
    fn feed_headers(&mut self, headers: &[u8]) -> io::Result<()>;
    /// Decode one packet; a frame comes out once the decoder has enough.
    fn decode(&mut self, packet: &crate::video::VideoPacket) -> io::Result<Option<VideoFrame>>;
}

/// A video codec: per-stream encoder and decoder instances.
pub trait VideoCodec: Send + Sync {
    fn new_encoder(&self, config: &crate::video::VideoConfig) -> io::Result<Box<dyn VideoEncoder>>;
    fn new_decoder(&self) -> io::Result<Box<dyn VideoDecoder>>;
}

/// Receives decoded remote frames together with the projected quad they
/// should appear on in the local physical frame.
pub trait FrameSink: Send {
    fn present(&mut self, frame: &VideoFrame, corners: [Point; 4]);
}

/// Factory for per-remote frame sinks.
pub trait FrameSinkFactory: Send + Sync {
    fn new_sink(&self) -> io::Result<Box<dyn FrameSink>>;
}
