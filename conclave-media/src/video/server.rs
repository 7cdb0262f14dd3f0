//! Server half of the video protocol.
//!
//! The server never decodes video. It keeps each client's stream headers
//! for replay to late joiners, holds the most recent packet in a triple
//! buffer, and forwards the packet locked at the start of each tick.

use std::io;

use log::debug;

use conclave_proto::pipe::protocol_error;
use conclave_proto::plugin::downcast_state;
use conclave_proto::{PipeReader, PipeWriter, PluginState, ServerPlugin};
use conclave_types::RigidTransform;
use conclave_utils::{triple_buffer, TripleBufferReader, TripleBufferWriter};

use super::{VideoPacket, MAX_HEADERS_SIZE, PROTOCOL_NAME, PROTOCOL_VERSION};

/// Per-client state on the server.
struct ClientVideo {
    has_video: bool,
    video_transform: RigidTransform,
    video_size: [f32; 2],
    headers: Vec<u8>,
    packet_writer: TripleBufferWriter<VideoPacket>,
    packet_reader: TripleBufferReader<VideoPacket>,
    /// Fresh packet locked for the duration of one fan-out tick.
    has_packet: bool,
}

/// Server-side video plugin.
#[derive(Default)]
pub struct VideoServer {
    _message_id_base: u16,
}

impl VideoServer {
    pub fn new() -> Self {
        VideoServer::default()
    }
}

impl ServerPlugin for VideoServer {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn initialize(&mut self, message_id_base: u16) {
        self._message_id_base = message_id_base;
    }

    fn receive_connect_request(
        &self,
        payload_len: u32,
        pipe: &mut PipeReader,
    ) -> io::Result<Option<PluginState>> {
        let mut consumed = 0u32;
        let version = pipe.read_u32()?;
        consumed += 4;
        let has_video = pipe.read_u8()? != 0;
        consumed += 1;

        let (packet_writer, packet_reader) = triple_buffer();
        let mut state = ClientVideo {
            has_video,
            video_transform: RigidTransform::IDENTITY,
            video_size: [0.0; 2],
            headers: Vec::new(),
            packet_writer,
            packet_reader,
            has_packet: false,
        };

        if has_video {
            state.video_transform = pipe.read_rigid()?;
            state.video_size = [pipe.read_f32()?, pipe.read_f32()?];
            consumed += 7 * 4 + 2 * 4;
            let headers_size = pipe.read_u32()?;
            consumed += 4;
            if headers_size > MAX_HEADERS_SIZE {
                return Err(protocol_error("video: implausible stream header size"));
            }
            state.headers = vec![0u8; headers_size as usize];
            pipe.read_bytes(&mut state.headers)?;
            consumed += headers_size;
        }

        if consumed != payload_len {
            return Err(protocol_error(format!(
                "video: connect payload of {} bytes instead of {}",
                payload_len, consumed
            )));
        }
        if version != PROTOCOL_VERSION {
            debug!("video: version mismatch ({} vs {})", version, PROTOCOL_VERSION);
            return Ok(None);
        }
        Ok(Some(Box::new(state)))
    }

    fn receive_client_update(&self, state: &mut PluginState, pipe: &mut PipeReader) -> io::Result<()> {
        let cs = downcast_state::<ClientVideo>(state, PROTOCOL_NAME)?;
        if !cs.has_video {
            return Ok(());
        }
        if pipe.read_u8()? != 0 {
            let packet = VideoPacket::read(pipe)?;
            cs.packet_writer.write(packet);
        }
        Ok(())
    }

    fn send_client_connect(
        &self,
        source: &mut PluginState,
        _dest: &mut PluginState,
        pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        let source = downcast_state::<ClientVideo>(source, PROTOCOL_NAME)?;
        if !source.has_video {
            return pipe.write_u8(0);
        }
        pipe.write_u8(1)?;
        pipe.write_rigid(source.video_transform)?;
        pipe.write_f32(source.video_size[0])?;
        pipe.write_f32(source.video_size[1])?;
        // Length-prefixed so receivers without the codec can skip the blob.
        pipe.write_u32(source.headers.len() as u32)?;
        pipe.write_bytes(&source.headers)
    }

    fn before_server_update_client(&self, state: &mut PluginState) {
        if let Ok(cs) = downcast_state::<ClientVideo>(state, PROTOCOL_NAME) {
            cs.has_packet = cs.has_video && cs.packet_reader.acquire();
        }
    }

    fn send_server_update(
        &self,
        source: &mut PluginState,
        _dest: &mut PluginState,
        pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        let source = downcast_state::<ClientVideo>(source, PROTOCOL_NAME)?;
        if !source.has_video {
            return Ok(());
        }
        if source.has_packet {
            pipe.write_u8(1)?;
            source.packet_reader.current().write(pipe)
        } else {
            pipe.write_u8(0)
        }
    }

    fn after_server_update_client(&self, state: &mut PluginState) {
        if let Ok(cs) = downcast_state::<ClientVideo>(state, PROTOCOL_NAME) {
            cs.has_packet = false;
        }
    }
}
