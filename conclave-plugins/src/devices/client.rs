//! Client half of the device-sharing protocol.
//!
//! The embedder mirrors its physical input devices into this plugin and
//! binds tools to them; the plugin batches the resulting messages between
//! ticks and keeps an id-keyed mirror of every remote client's devices.
//! Button and valuator values that no exposed tool is bound to are
//! transmitted as zero so unrelated local inputs never leak into the
//! session.

use std::any::Any;
use std::collections::HashMap;
use std::io::{self, Cursor};

use log::debug;

use conclave_proto::pipe::protocol_error;
use conclave_proto::{ClientPlugin, MessageBuffer, PipeReader, PipeWriter};
use conclave_types::ClientId;

use super::{
    device_mask, DeviceState, ToolState, CREATE_DEVICE, CREATE_TOOL, DESTROY_DEVICE, DESTROY_TOOL,
    DEVICE_STATES, NUM_MESSAGES, PROTOCOL_NAME, PROTOCOL_VERSION,
};

struct LocalDevice {
    state: DeviceState,
    /// Per-button count of tool bindings; unbound buttons transmit as zero.
    button_refs: Vec<u16>,
    /// Per-valuator count of tool bindings.
    valuator_refs: Vec<u16>,
}

/// Mirror of one remote client's shared devices and tools.
#[derive(Default)]
pub struct RemoteDevices {
    pub devices: HashMap<u32, DeviceState>,
    pub tools: HashMap<u32, ToolState>,
}

/// Client-side device-sharing plugin.
pub struct DevicesClient {
    message_id_base: u16,
    next_device_id: u32,
    next_tool_id: u32,
    local_devices: HashMap<u32, LocalDevice>,
    local_tools: HashMap<u32, ToolState>,
    remotes: HashMap<ClientId, RemoteDevices>,
    batch: MessageBuffer,
}

impl DevicesClient {
    pub fn new() -> Self {
        DevicesClient {
            message_id_base: 0,
            // Device and tool ids start at 1; 0 terminates state runs.
            next_device_id: 1,
            next_tool_id: 1,
            local_devices: HashMap::new(),
            local_tools: HashMap::new(),
            remotes: HashMap::new(),
            batch: MessageBuffer::new(),
        }
    }

    /// Expose a local input device to the session.
    pub fn create_device(&mut self, track_type: i32, num_buttons: u32, num_valuators: u32) -> u32 {
        let id = self.next_device_id;
        self.next_device_id += 1;
        let mut state = DeviceState::new(track_type, num_buttons, num_valuators);
        state.update_mask = device_mask::FULL_UPDATE;

        let mut w = self.batch.writer();
        let _ = w.write_message_id(CREATE_DEVICE);
        let _ = w.write_u32(id);
        let _ = state.write_layout(&mut w);

        self.local_devices.insert(
            id,
            LocalDevice {
                state,
                button_refs: vec![0; num_buttons as usize],
                valuator_refs: vec![0; num_valuators as usize],
            },
        );
        id
    }

    pub fn destroy_device(&mut self, id: u32) {
        if self.local_devices.remove(&id).is_some() {
            let mut w = self.batch.writer();
            let _ = w.write_message_id(DESTROY_DEVICE);
            let _ = w.write_u32(id);
        }
    }

    /// Expose a tool and bind its slots; bound buttons/valuators start
    /// being transmitted with the next update.
    pub fn create_tool(&mut self, tool: ToolState) -> u32 {
        let id = self.next_tool_id;
        self.next_tool_id += 1;

        for slot in &tool.button_slots {
            if let Some(device) = self.local_devices.get_mut(&slot.device_id) {
                device.button_refs[slot.index as usize] += 1;
                device.state.update_mask |= device_mask::BUTTON;
            }
        }
        for slot in &tool.valuator_slots {
            if let Some(device) = self.local_devices.get_mut(&slot.device_id) {
                device.valuator_refs[slot.index as usize] += 1;
                device.state.update_mask |= device_mask::VALUATOR;
            }
        }

        let mut w = self.batch.writer();
        let _ = w.write_message_id(CREATE_TOOL);
        let _ = w.write_u32(id);
        let _ = tool.write(&mut w);
        self.local_tools.insert(id, tool);
        id
    }

    pub fn destroy_tool(&mut self, id: u32) {
        let tool = match self.local_tools.remove(&id) {
            Some(tool) => tool,
            None => return,
        };
        for slot in &tool.button_slots {
            if let Some(device) = self.local_devices.get_mut(&slot.device_id) {
                let refs = &mut device.button_refs[slot.index as usize];
                *refs = refs.saturating_sub(1);
                device.state.update_mask |= device_mask::BUTTON;
            }
        }
        for slot in &tool.valuator_slots {
            if let Some(device) = self.local_devices.get_mut(&slot.device_id) {
                let refs = &mut device.valuator_refs[slot.index as usize];
                *refs = refs.saturating_sub(1);
                device.state.update_mask |= device_mask::VALUATOR;
            }
        }
        let mut w = self.batch.writer();
        let _ = w.write_message_id(DESTROY_TOOL);
        let _ = w.write_u32(id);
    }

    /// Mutate a local device's state; the closure ORs the matching
    /// [`device_mask`] bits for everything it changes.
    pub fn update_device(&mut self, id: u32, f: impl FnOnce(&mut DeviceState)) {
        if let Some(device) = self.local_devices.get_mut(&id) {
            f(&mut device.state);
        }
    }

    /// The mirrored devices of one remote client.
    pub fn remote(&self, id: ClientId) -> Option<&RemoteDevices> {
        self.remotes.get(&id)
    }

    /// Copy a local device's state with unbound inputs masked to zero.
    fn masked_state(device: &LocalDevice) -> DeviceState {
        let mut masked = device.state.clone();
        for (index, refs) in device.button_refs.iter().enumerate() {
            if *refs == 0 {
                let byte = index / 8;
                masked.button_states[byte] &= !(1u8 << (index % 8));
            }
        }
        for (index, refs) in device.valuator_refs.iter().enumerate() {
            if *refs == 0 {
                masked.valuator_states[index] = 0.0;
            }
        }
        masked
    }

    /// Parse one opaque device batch into a remote mirror.
    fn apply_batch(remote: &mut RemoteDevices, data: &[u8], swap: bool) -> io::Result<bool> {
        let len = data.len() as u64;
        let mut cursor = Cursor::new(data);
        let mut changed = false;
        while cursor.position() < len {
            let mut r = PipeReader::new(&mut cursor, swap);
            match r.read_message_id()? {
                CREATE_DEVICE => {
                    let id = r.read_u32()?;
                    let device = DeviceState::read_layout(&mut r)?;
                    remote.devices.insert(id, device);
                    changed = true;
                }
                DESTROY_DEVICE => {
                    let id = r.read_u32()?;
                    remote.devices.remove(&id);
                    changed = true;
                }
                CREATE_TOOL => {
                    let id = r.read_u32()?;
                    let tool = ToolState::read(&mut r)?;
                    remote.tools.insert(id, tool);
                    changed = true;
                }
                DESTROY_TOOL => {
                    let id = r.read_u32()?;
                    remote.tools.remove(&id);
                    changed = true;
                }
                DEVICE_STATES => loop {
                    let id = r.read_u32()?;
                    if id == 0 {
                        break;
                    }
                    remote
                        .devices
                        .get_mut(&id)
                        .ok_or_else(|| {
                            protocol_error(format!("devices: delta for unknown device {}", id))
                        })?
                        .read_delta(&mut r)?;
                    changed = true;
                },
                other => {
                    return Err(protocol_error(format!(
                        "devices: unknown batched message {}",
                        other
                    )));
                }
            }
        }
        Ok(changed)
    }

    fn read_sized_batch(pipe: &mut PipeReader) -> io::Result<Vec<u8>> {
        let size = pipe.read_u32()?;
        let mut data = vec![0u8; size as usize];
        pipe.read_bytes(&mut data)?;
        Ok(data)
    }
}

impl Default for DevicesClient {
    fn default() -> Self {
        DevicesClient::new()
    }
}

impl ClientPlugin for DevicesClient {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn num_messages(&self) -> u16 {
        NUM_MESSAGES
    }

    fn message_id_base(&self) -> u16 {
        self.message_id_base
    }

    fn set_message_id_base(&mut self, base: u16) {
        self.message_id_base = base;
    }

    fn send_connect_request(&mut self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_u32(4)?;
        pipe.write_u32(PROTOCOL_VERSION)
    }

    fn receive_client_connect(&mut self, remote: ClientId, pipe: &mut PipeReader) -> io::Result<()> {
        let data = Self::read_sized_batch(pipe)?;
        let mut mirror = RemoteDevices::default();
        Self::apply_batch(&mut mirror, &data, pipe.must_swap())?;
        debug!(
            "devices: remote {} announced {} devices, {} tools",
            remote,
            mirror.devices.len(),
            mirror.tools.len()
        );
        self.remotes.insert(remote, mirror);
        Ok(())
    }

    fn disconnect_client(&mut self, remote: ClientId) {
        self.remotes.remove(&remote);
    }

    fn send_client_update(&mut self, pipe: &mut PipeWriter) -> io::Result<()> {
        // Creation and destruction messages batched since the last tick,
        // then one state run over the changed devices.
        pipe.write_bytes(self.batch.as_slice())?;
        self.batch.clear();

        pipe.write_message_id(DEVICE_STATES)?;
        let mut ids: Vec<u32> = self.local_devices.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let device = match self.local_devices.get_mut(&id) {
                Some(device) => device,
                None => continue,
            };
            if device.state.update_mask != device_mask::NO_CHANGE {
                let masked = Self::masked_state(device);
                pipe.write_u32(id)?;
                masked.write_delta(masked.update_mask, pipe)?;
                device.state.update_mask = device_mask::NO_CHANGE;
            }
        }
        pipe.write_u32(0)
    }

    fn receive_server_update(&mut self, remote: ClientId, pipe: &mut PipeReader) -> io::Result<bool> {
        let data = Self::read_sized_batch(pipe)?;
        let swap = pipe.must_swap();
        match self.remotes.get_mut(&remote) {
            Some(mirror) => Self::apply_batch(mirror, &data, swap),
            None => Err(protocol_error(format!(
                "devices: update for unknown client {}",
                remote
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DevicesServer, Slot};
    use conclave_proto::ServerPlugin;

    /// Drive a client batch through the server half and back into a second
    /// client's remote mirror, the way one fan-out tick would.
    #[test]
    fn batch_travels_client_to_server_to_peer() {
        let mut sender = DevicesClient::new();
        let device = sender.create_device(1, 4, 2);
        sender.create_tool(ToolState {
            class_name: "Pointer".into(),
            button_slots: vec![Slot { device_id: device, index: 1 }],
            valuator_slots: vec![],
        });
        sender.update_device(device, |d| {
            d.set_button(1, true);
            d.set_button(3, true); // not bound to any tool
            d.set_valuator(0, 0.5); // not bound either
        });

        let mut update = Vec::new();
        sender
            .send_client_update(&mut PipeWriter::new(&mut update))
            .unwrap();

        // Server side consumes the update and re-batches for peers.
        let server = DevicesServer::new();
        let mut connect = Vec::new();
        PipeWriter::new(&mut connect).write_u32(PROTOCOL_VERSION).unwrap();
        let mut connect_cur = Cursor::new(connect);
        let mut state = server
            .receive_connect_request(4, &mut PipeReader::new(&mut connect_cur, false))
            .unwrap()
            .expect("connect accepted");

        let mut update_cur = Cursor::new(update);
        server
            .receive_client_update(&mut state, &mut PipeReader::new(&mut update_cur, false))
            .unwrap();
        server.before_server_update_client(&mut state);

        let mut connect2 = Vec::new();
        PipeWriter::new(&mut connect2).write_u32(PROTOCOL_VERSION).unwrap();
        let mut connect2_cur = Cursor::new(connect2);
        let mut dummy_state = server
            .receive_connect_request(4, &mut PipeReader::new(&mut connect2_cur, false))
            .unwrap()
            .expect("connect accepted");
        let mut fanout = Vec::new();
        server
            .send_server_update(&mut state, &mut dummy_state, &mut PipeWriter::new(&mut fanout))
            .unwrap();

        // Peer client applies the size-prefixed batch.
        let mut receiver = DevicesClient::new();
        let peer = ClientId::new(7);
        receiver.remotes.insert(peer, RemoteDevices::default());
        let mut fanout_cur = Cursor::new(fanout);
        let changed = receiver
            .receive_server_update(peer, &mut PipeReader::new(&mut fanout_cur, false))
            .unwrap();
        assert!(changed);

        let mirror = receiver.remote(peer).unwrap();
        let remote_device = mirror.devices.values().next().unwrap();
        assert_eq!(remote_device.num_buttons, 4);
        // The bound button arrived, the unbound ones were masked to zero.
        assert!(remote_device.button(1));
        assert!(!remote_device.button(3));
        assert_eq!(remote_device.valuator_states[0], 0.0);
        assert_eq!(mirror.tools.len(), 1);
    }

    #[test]
    fn empty_update_is_just_a_terminated_state_run() {
        let mut client = DevicesClient::new();
        let mut update = Vec::new();
        client
            .send_client_update(&mut PipeWriter::new(&mut update))
            .unwrap();
        // message id + terminator
        assert_eq!(update.len(), 2 + 4);
    }
}
