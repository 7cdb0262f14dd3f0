//! Server half of the audio protocol.
//!
//! The server never decodes: it queues each client's opaque packets in a
//! drop-tolerant ring, locks the queued run at the start of every fan-out
//! tick, and copies it to each destination.

use std::io;

use log::debug;

use conclave_proto::pipe::protocol_error;
use conclave_proto::plugin::downcast_state;
use conclave_proto::{PipeReader, PipeWriter, PluginState, ServerPlugin};
use conclave_types::Point;
use conclave_utils::{drop_ring, RingConsumer, RingProducer};

use super::{
    CONNECT_PAYLOAD_LEN, MAX_FRAME_SIZE, MAX_PACKET_SIZE, MAX_QUEUE_SIZE, PROTOCOL_NAME,
    PROTOCOL_VERSION,
};

/// Per-client state on the server.
struct ClientAudio {
    mouth_position: Point,
    frame_size: u32,
    packet_size: u32,
    queue_tx: RingProducer<Vec<u8>>,
    queue_rx: RingConsumer<Vec<u8>>,
    /// Packets locked for the duration of one fan-out tick.
    locked: Vec<Vec<u8>>,
}

/// Server-side audio plugin.
#[derive(Default)]
pub struct AudioServer {
    _message_id_base: u16,
}

impl AudioServer {
    pub fn new() -> Self {
        AudioServer::default()
    }
}

impl ServerPlugin for AudioServer {
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
        if payload_len != CONNECT_PAYLOAD_LEN {
            return Err(protocol_error(format!(
                "audio: connect payload of {} bytes instead of {}",
                payload_len, CONNECT_PAYLOAD_LEN
            )));
        }
        let version = pipe.read_u32()?;
        let mouth_position = pipe.read_point()?;
        let frame_size = pipe.read_u32()?;
        let packet_size = pipe.read_u32()?;
        let queue_size = pipe.read_u32()?;
        if version != PROTOCOL_VERSION {
            debug!("audio: version mismatch ({} vs {})", version, PROTOCOL_VERSION);
            return Ok(None);
        }
        if frame_size > MAX_FRAME_SIZE || packet_size > MAX_PACKET_SIZE || queue_size > MAX_QUEUE_SIZE
        {
            return Err(protocol_error("audio: implausible stream geometry"));
        }

        let (queue_tx, queue_rx) = drop_ring(queue_size.max(1) as usize);
        Ok(Some(Box::new(ClientAudio {
            mouth_position,
            frame_size,
            packet_size,
            queue_tx,
            queue_rx,
            locked: Vec::new(),
        })))
    }

    fn receive_client_update(&self, state: &mut PluginState, pipe: &mut PipeReader) -> io::Result<()> {
        let cs = downcast_state::<ClientAudio>(state, PROTOCOL_NAME)?;
        if cs.frame_size == 0 {
            return Ok(());
        }
        let count = pipe.read_u16()?;
        for _ in 0..count {
            let mut packet = vec![0u8; cs.packet_size as usize];
            pipe.read_bytes(&mut packet)?;
            cs.queue_tx.push(packet);
        }
        Ok(())
    }

    fn send_client_connect(
        &self,
        source: &mut PluginState,
        _dest: &mut PluginState,
        pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        let source = downcast_state::<ClientAudio>(source, PROTOCOL_NAME)?;
        pipe.write_point(source.mouth_position)?;
        pipe.write_u32(source.frame_size)?;
        pipe.write_u32(source.packet_size)
    }

    fn before_server_update_client(&self, state: &mut PluginState) {
        if let Ok(cs) = downcast_state::<ClientAudio>(state, PROTOCOL_NAME) {
            cs.locked = cs.queue_rx.drain();
        }
    }

    fn send_server_update(
        &self,
        source: &mut PluginState,
        _dest: &mut PluginState,
        pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        let source = downcast_state::<ClientAudio>(source, PROTOCOL_NAME)?;
        if source.frame_size == 0 {
            return Ok(());
        }
        pipe.write_u16(source.locked.len() as u16)?;
        for packet in &source.locked {
            pipe.write_bytes(packet)?;
        }
        Ok(())
    }

    fn after_server_update_client(&self, state: &mut PluginState) {
        if let Ok(cs) = downcast_state::<ClientAudio>(state, PROTOCOL_NAME) {
            cs.locked.clear();
        }
    }
}
