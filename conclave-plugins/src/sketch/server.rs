//! Server half of the annotation protocol.

use std::collections::HashMap;
use std::io;

use log::debug;

use conclave_proto::pipe::protocol_error;
use conclave_proto::plugin::downcast_state;
use conclave_proto::{MessageBuffer, PipeReader, PipeWriter, PluginState, ServerPlugin};

use super::{
    Curve, ADD_CURVE, APPEND_POINT, DELETE_ALL_CURVES, DELETE_CURVE, NUM_MESSAGES, PROTOCOL_NAME,
    PROTOCOL_VERSION, UPDATE_END,
};

/// Per-client state on the server: the client's live curve set and the
/// re-batched messages for its peers.
struct ClientCurves {
    curves: HashMap<u32, Curve>,
    batch: MessageBuffer,
}

/// Server-side annotation plugin.
#[derive(Default)]
pub struct SketchServer {
    _message_id_base: u16,
}

impl SketchServer {
    pub fn new() -> Self {
        SketchServer::default()
    }
}

impl ServerPlugin for SketchServer {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn num_messages(&self) -> u16 {
        NUM_MESSAGES
    }

    fn initialize(&mut self, message_id_base: u16) {
        self._message_id_base = message_id_base;
    }

    fn receive_connect_request(
        &self,
        payload_len: u32,
        pipe: &mut PipeReader,
    ) -> io::Result<Option<PluginState>> {
        if payload_len != 4 {
            return Err(protocol_error(format!(
                "sketch: connect payload of {} bytes instead of 4",
                payload_len
            )));
        }
        let version = pipe.read_u32()?;
        if version != PROTOCOL_VERSION {
            debug!("sketch: version mismatch ({} vs {})", version, PROTOCOL_VERSION);
            return Ok(None);
        }
        Ok(Some(Box::new(ClientCurves {
            curves: HashMap::new(),
            batch: MessageBuffer::new(),
        })))
    }

    fn receive_client_update(&self, state: &mut PluginState, pipe: &mut PipeReader) -> io::Result<()> {
        let cs = downcast_state::<ClientCurves>(state, PROTOCOL_NAME)?;

        loop {
            match pipe.read_message_id()? {
                ADD_CURVE => {
                    let id = pipe.read_u32()?;
                    let curve = Curve::read(pipe)?;
                    let mut w = cs.batch.writer();
                    w.write_message_id(ADD_CURVE)?;
                    w.write_u32(id)?;
                    curve.write(&mut w)?;
                    cs.curves.insert(id, curve);
                }
                APPEND_POINT => {
                    let id = pipe.read_u32()?;
                    let index = pipe.read_u32()?;
                    let vertex = pipe.read_point()?;
                    let curve = cs.curves.get_mut(&id).ok_or_else(|| {
                        protocol_error(format!("sketch: vertex for unknown curve {}", id))
                    })?;
                    if index as usize != curve.vertices.len() {
                        return Err(protocol_error(format!(
                            "sketch: vertex index {} does not extend curve of {} vertices",
                            index,
                            curve.vertices.len()
                        )));
                    }
                    curve.vertices.push(vertex);
                    let mut w = cs.batch.writer();
                    w.write_message_id(APPEND_POINT)?;
                    w.write_u32(id)?;
                    w.write_u32(index)?;
                    w.write_point(vertex)?;
                }
                DELETE_CURVE => {
                    let id = pipe.read_u32()?;
                    cs.curves.remove(&id);
                    let mut w = cs.batch.writer();
                    w.write_message_id(DELETE_CURVE)?;
                    w.write_u32(id)?;
                }
                DELETE_ALL_CURVES => {
                    cs.curves.clear();
                    let mut w = cs.batch.writer();
                    w.write_message_id(DELETE_ALL_CURVES)?;
                }
                UPDATE_END => return Ok(()),
                other => {
                    return Err(protocol_error(format!(
                        "sketch: unknown batched message {}",
                        other
                    )));
                }
            }
        }
    }

    fn send_client_connect(
        &self,
        source: &mut PluginState,
        _dest: &mut PluginState,
        pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        let source = downcast_state::<ClientCurves>(source, PROTOCOL_NAME)?;

        // The full current curve set, directly: both ends share the plugin,
        // so no opaque framing is needed here.
        pipe.write_u32(source.curves.len() as u32)?;
        for (id, curve) in &source.curves {
            pipe.write_u32(*id)?;
            curve.write(pipe)?;
        }
        Ok(())
    }

    fn send_server_update(
        &self,
        source: &mut PluginState,
        _dest: &mut PluginState,
        pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        let source = downcast_state::<ClientCurves>(source, PROTOCOL_NAME)?;
        source.batch.write_to(pipe)
    }

    fn after_server_update_client(&self, state: &mut PluginState) {
        if let Ok(cs) = downcast_state::<ClientCurves>(state, PROTOCOL_NAME) {
            cs.batch.clear();
        }
    }
}
