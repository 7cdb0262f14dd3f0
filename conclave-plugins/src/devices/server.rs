//! Server half of the device-sharing protocol.
//!
//! The server parses each client's batched device messages into per-client
//! device and tool maps, re-batches them for fan-out, and replays the
//! creation messages whenever a new peer needs to learn about an existing
//! client's devices.

use std::collections::HashMap;
use std::io;

use log::debug;

use conclave_proto::pipe::protocol_error;
use conclave_proto::plugin::downcast_state;
use conclave_proto::{MessageBuffer, PipeReader, PipeWriter, PluginState, ServerPlugin};

use super::{
    device_mask, DeviceState, ToolState, CREATE_DEVICE, CREATE_TOOL, DESTROY_DEVICE, DESTROY_TOOL,
    DEVICE_STATES, NUM_MESSAGES, PROTOCOL_NAME, PROTOCOL_VERSION,
};

/// Per-client state on the server.
struct ClientDevices {
    devices: HashMap<u32, DeviceState>,
    tools: HashMap<u32, ToolState>,
    /// Outgoing messages for this client's peers, cleared every tick.
    batch: MessageBuffer,
}

/// Server-side device-sharing plugin.
#[derive(Default)]
pub struct DevicesServer {
    _message_id_base: u16,
}

impl DevicesServer {
    pub fn new() -> Self {
        DevicesServer::default()
    }
}

impl ServerPlugin for DevicesServer {
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
                "devices: connect payload of {} bytes instead of 4",
                payload_len
            )));
        }
        let version = pipe.read_u32()?;
        if version != PROTOCOL_VERSION {
            debug!("devices: version mismatch ({} vs {})", version, PROTOCOL_VERSION);
            return Ok(None);
        }
        Ok(Some(Box::new(ClientDevices {
            devices: HashMap::new(),
            tools: HashMap::new(),
            batch: MessageBuffer::new(),
        })))
    }

    fn receive_client_update(&self, state: &mut PluginState, pipe: &mut PipeReader) -> io::Result<()> {
        let cs = downcast_state::<ClientDevices>(state, PROTOCOL_NAME)?;

        // The batch ends with the client's DEVICE_STATES run.
        loop {
            match pipe.read_message_id()? {
                CREATE_DEVICE => {
                    let id = pipe.read_u32()?;
                    let device = DeviceState::read_layout(pipe)?;
                    let mut w = cs.batch.writer();
                    w.write_message_id(CREATE_DEVICE)?;
                    w.write_u32(id)?;
                    device.write_layout(&mut w)?;
                    cs.devices.insert(id, device);
                }
                DESTROY_DEVICE => {
                    let id = pipe.read_u32()?;
                    cs.devices.remove(&id);
                    let mut w = cs.batch.writer();
                    w.write_message_id(DESTROY_DEVICE)?;
                    w.write_u32(id)?;
                }
                CREATE_TOOL => {
                    let id = pipe.read_u32()?;
                    let tool = ToolState::read(pipe)?;
                    let mut w = cs.batch.writer();
                    w.write_message_id(CREATE_TOOL)?;
                    w.write_u32(id)?;
                    tool.write(&mut w)?;
                    cs.tools.insert(id, tool);
                }
                DESTROY_TOOL => {
                    let id = pipe.read_u32()?;
                    cs.tools.remove(&id);
                    let mut w = cs.batch.writer();
                    w.write_message_id(DESTROY_TOOL)?;
                    w.write_u32(id)?;
                }
                DEVICE_STATES => {
                    loop {
                        let id = pipe.read_u32()?;
                        if id == 0 {
                            break;
                        }
                        cs.devices
                            .get_mut(&id)
                            .ok_or_else(|| {
                                protocol_error(format!("devices: delta for unknown device {}", id))
                            })?
                            .read_delta(pipe)?;
                    }
                    return Ok(());
                }
                other => {
                    return Err(protocol_error(format!(
                        "devices: unknown batched message {}",
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
        let source = downcast_state::<ClientDevices>(source, PROTOCOL_NAME)?;

        // Replay creation messages plus a full state run, framed like any
        // other batch so the receiver parses it with the same loop.
        let mut replay = MessageBuffer::new();
        {
            let mut w = replay.writer();
            for (id, device) in &source.devices {
                w.write_message_id(CREATE_DEVICE)?;
                w.write_u32(*id)?;
                device.write_layout(&mut w)?;
            }
            for (id, tool) in &source.tools {
                w.write_message_id(CREATE_TOOL)?;
                w.write_u32(*id)?;
                tool.write(&mut w)?;
            }
            w.write_message_id(DEVICE_STATES)?;
            for (id, device) in &source.devices {
                w.write_u32(*id)?;
                device.write_delta(device_mask::FULL_UPDATE, &mut w)?;
            }
            w.write_u32(0)?;
        }
        replay.write_to(pipe)
    }

    fn before_server_update_client(&self, state: &mut PluginState) {
        // Regenerate this client's DEVICE_STATES run from the accumulated
        // per-device masks; creation messages are already in the batch.
        if let Ok(cs) = downcast_state::<ClientDevices>(state, PROTOCOL_NAME) {
            let mut entries: Vec<(&u32, &mut DeviceState)> = cs.devices.iter_mut().collect();
            entries.sort_by_key(|(id, _)| **id);
            // Buffer writes cannot fail.
            let mut w = cs.batch.writer();
            let _ = w.write_message_id(DEVICE_STATES);
            for (id, device) in entries {
                if device.update_mask != device_mask::NO_CHANGE {
                    let _ = w.write_u32(*id);
                    let _ = device.write_delta(device.update_mask, &mut w);
                    device.update_mask = device_mask::NO_CHANGE;
                }
            }
            let _ = w.write_u32(0);
        }
    }

    fn send_server_update(
        &self,
        source: &mut PluginState,
        _dest: &mut PluginState,
        pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        let source = downcast_state::<ClientDevices>(source, PROTOCOL_NAME)?;
        source.batch.write_to(pipe)
    }

    fn after_server_update_client(&self, state: &mut PluginState) {
        if let Ok(cs) = downcast_state::<ClientDevices>(state, PROTOCOL_NAME) {
            cs.batch.clear();
        }
    }
}
