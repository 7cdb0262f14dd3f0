//! Compressed-video protocol.
//!
//! The sender converts captured frames to planar Y'CbCr 4:2:0, encodes
//! them, and offers at most one packet per tick; the codec's stream headers
//! travel once inside the connect handshake, length-prefixed so endpoints
//! without the codec can skip them. Each receiver decodes on a dedicated
//! per-remote thread and draws the latest frame on a quad projected through
//! the remote's navigation mapping.

mod client;
mod server;

pub use client::VideoClient;
pub use server::VideoServer;

use std::io;

use serde::Deserialize;

use conclave_proto::pipe::protocol_error;
use conclave_proto::{PipeReader, PipeWriter};
use conclave_types::RigidTransform;

/// Protocol name binding the two plugin halves.
pub const PROTOCOL_NAME: &str = "video";
/// Protocol version carried in the connect payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bounds on transmitted blob sizes.
pub const MAX_HEADERS_SIZE: u32 = 1 << 20;
pub const MAX_PACKET_SIZE: u32 = 1 << 22;

/// One encoded video packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoPacket {
    /// Beginning-of-stream flag.
    pub bos: bool,
    /// Position of the most recent key frame.
    pub granule_pos: i64,
    /// Sequence number in the video stream.
    pub packet_no: i64,
    pub data: Vec<u8>,
}

impl VideoPacket {
    pub fn read(pipe: &mut PipeReader) -> io::Result<VideoPacket> {
        let bos = pipe.read_u8()? != 0;
        let granule_pos = pipe.read_i64()?;
        let packet_no = pipe.read_i64()?;
        let len = pipe.read_u32()?;
        if len > MAX_PACKET_SIZE {
            return Err(protocol_error("video: implausible packet size"));
        }
        let mut data = vec![0u8; len as usize];
        pipe.read_bytes(&mut data)?;
        Ok(VideoPacket {
            bos,
            granule_pos,
            packet_no,
            data,
        })
    }

    pub fn write(&self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_u8(self.bos as u8)?;
        pipe.write_i64(self.granule_pos)?;
        pipe.write_i64(self.packet_no)?;
        pipe.write_u32(self.data.len() as u32)?;
        pipe.write_bytes(&self.data)
    }
}

/// Video plugin configuration (the `video` section of the config tree).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoConfig {
    /// Capture and transmit local video.
    pub enable_capture: bool,
    /// Capture device name, resolved by the embedding backend.
    pub capture_video_device_name: String,
    /// FourCC of the requested capture pixel format.
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    /// Encoder tuning, interpreted by the codec implementation.
    pub bitrate: u32,
    pub quality: u32,
    pub gop_size: u32,
    /// Placement of the video panel in the local physical space.
    pub virtual_video_transform: RigidTransform,
    /// Panel extents in physical coordinate units.
    pub virtual_video_width: f32,
    pub virtual_video_height: f32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        VideoConfig {
            enable_capture: false,
            capture_video_device_name: String::new(),
            pixel_format: "YV12".into(),
            width: 320,
            height: 240,
            frame_rate: 15.0,
            bitrate: 0,
            quality: 32,
            gop_size: 32,
            virtual_video_transform: RigidTransform::IDENTITY,
            virtual_video_width: 1.0,
            virtual_video_height: 0.75,
        }
    }
}
