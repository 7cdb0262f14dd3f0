//! Protocol plugin traits.
//!
//! A plugin is a higher-level protocol riding on the base transport. Server
//! and client sides are independent objects bound to each other by the
//! plugin's string name; on registration each side receives a contiguous
//! message-id range from the registry. Per-connection plugin data lives in
//! an opaque state bag on the server, and in id-keyed maps inside the
//! client-side plugin itself.
//!
//! Any hook may refuse by returning an error; the engine maps that to a
//! session-terminating protocol error for the affected connection only.

use std::any::Any;
use std::io;

use conclave_types::{ClientId, ClientState, OrthoTransform};

use crate::pipe::{protocol_error, PipeReader, PipeWriter};

/// Opaque per-connection state owned by a plugin.
pub type PluginState = Box<dyn Any + Send>;

/// Recover a plugin's concrete state type from the opaque bag.
pub fn downcast_state<'a, T: 'static>(
    state: &'a mut PluginState,
    plugin: &str,
) -> io::Result<&'a mut T> {
    state
        .downcast_mut::<T>()
        .ok_or_else(|| protocol_error(format!("{}: per-client state has mismatching type", plugin)))
}

/// Shared-reference variant of [`downcast_state`].
pub fn downcast_state_ref<'a, T: 'static>(
    state: &'a PluginState,
    plugin: &str,
) -> io::Result<&'a T> {
    state
        .downcast_ref::<T>()
        .ok_or_else(|| protocol_error(format!("{}: per-client state has mismatching type", plugin)))
}

/// Server-side half of a protocol plugin.
///
/// Registered once per server; per-client state is created in
/// [`receive_connect_request`](ServerPlugin::receive_connect_request) and
/// destroyed after [`disconnect_client`](ServerPlugin::disconnect_client).
/// All hooks taking a [`PluginState`] run under the owning client's state
/// mutex.
pub trait ServerPlugin: Send + Sync {
    /// The protocol's name; must match the client-side plugin exactly.
    fn name(&self) -> &str;

    /// Number of message ids the protocol reserves.
    fn num_messages(&self) -> u16 {
        0
    }

    /// Called once when the plugin is registered and its id range assigned.
    fn initialize(&mut self, _message_id_base: u16) {}

    /// Consume the plugin's connect-request payload (exactly `payload_len`
    /// bytes) and produce the per-client state, or `None` to reject this
    /// protocol for the requesting client. The payload must be consumed in
    /// both cases; short or long reads are connection-fatal.
    fn receive_connect_request(
        &self,
        payload_len: u32,
        pipe: &mut PipeReader,
    ) -> io::Result<Option<PluginState>>;

    /// Append the plugin's CONNECT_REPLY payload.
    fn send_connect_reply(&self, _state: &mut PluginState, _pipe: &mut PipeWriter) -> io::Result<()> {
        Ok(())
    }

    /// Append the plugin's CONNECT_REJECT payload.
    fn send_connect_reject(&self, _state: &mut PluginState, _pipe: &mut PipeWriter) -> io::Result<()> {
        Ok(())
    }

    /// Drain the plugin's DISCONNECT_REQUEST payload.
    fn receive_disconnect_request(
        &self,
        _state: &mut PluginState,
        _pipe: &mut PipeReader,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Append the plugin's DISCONNECT_REPLY payload.
    fn send_disconnect_reply(
        &self,
        _state: &mut PluginState,
        _pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Read the plugin's portion of a CLIENT_UPDATE.
    fn receive_client_update(
        &self,
        _state: &mut PluginState,
        _pipe: &mut PipeReader,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Write the payload introducing `source` to `dest` inside a
    /// CLIENT_CONNECT message.
    fn send_client_connect(
        &self,
        _source: &mut PluginState,
        _dest: &mut PluginState,
        _pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Write the plugin's global SERVER_UPDATE payload for one destination.
    fn send_server_update_global(
        &self,
        _dest: &mut PluginState,
        _pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Write the per-peer SERVER_UPDATE payload carrying `source`'s data to
    /// `dest`.
    fn send_server_update(
        &self,
        _source: &mut PluginState,
        _dest: &mut PluginState,
        _pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Handle a message in the plugin's id range outside CLIENT_UPDATE.
    /// `id` is relative to the plugin's message-id base. Returning `false`
    /// signals a protocol error.
    fn handle_message(
        &self,
        _state: &mut PluginState,
        _id: u16,
        _pipe: &mut PipeReader,
    ) -> io::Result<bool> {
        Ok(false)
    }

    /// A client sharing this protocol became part of the session.
    fn connect_client(&self, _state: &mut PluginState) {}

    /// A client sharing this protocol left the session; the state bag is
    /// dropped right after this hook.
    fn disconnect_client(&self, _state: &mut PluginState) {}

    /// Start of a fan-out tick, before any client is locked.
    fn before_server_update(&self) {}

    /// Per-client preparation, under the client's state mutex.
    fn before_server_update_client(&self, _state: &mut PluginState) {}

    /// Last chance to emit plugin messages to `dest` ahead of the
    /// SERVER_UPDATE header.
    fn before_server_update_dest(
        &self,
        _dest: &mut PluginState,
        _pipe: &mut PipeWriter,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Per-client cleanup after the tick's SERVER_UPDATE went out.
    fn after_server_update_client(&self, _state: &mut PluginState) {}

    /// End of a fan-out tick, after all clients are unlocked.
    fn after_server_update(&self) {}
}

/// Client-side half of a protocol plugin.
///
/// Per-remote-client data is kept inside the plugin, keyed by [`ClientId`];
/// it is created in [`receive_client_connect`](ClientPlugin::receive_client_connect)
/// and destroyed in [`disconnect_client`](ClientPlugin::disconnect_client).
/// Pipe hooks run on the receive thread, frame and render hooks on the
/// embedder's thread; the engine serialises them through the plugin's lock.
pub trait ClientPlugin: Send {
    /// The protocol's name; must match the server-side plugin exactly.
    fn name(&self) -> &str;

    /// Concrete-type escape hatch so the embedder can reach a negotiated
    /// plugin's own API through the connection host.
    fn as_any(&mut self) -> &mut dyn Any;

    /// Number of message ids the protocol reserves.
    fn num_messages(&self) -> u16 {
        0
    }

    /// The id base assigned by the server during negotiation.
    fn message_id_base(&self) -> u16;

    /// Record the id base assigned by the server.
    fn set_message_id_base(&mut self, base: u16);

    /// Write the plugin's CONNECT_REQUEST payload as `<u32 len><len bytes>`
    /// so a server lacking the plugin can skip it.
    fn send_connect_request(&mut self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_u32(0)
    }

    /// Read the plugin's CONNECT_REPLY payload.
    fn receive_connect_reply(&mut self, _pipe: &mut PipeReader) -> io::Result<()> {
        Ok(())
    }

    /// Read the plugin's CONNECT_REJECT payload.
    fn receive_connect_reject(&mut self, _pipe: &mut PipeReader) -> io::Result<()> {
        Ok(())
    }

    /// The server does not support this protocol; the plugin is dropped
    /// after this call.
    fn rejected_by_server(&mut self) {}

    /// Append the plugin's DISCONNECT_REQUEST payload.
    fn send_disconnect_request(&mut self, _pipe: &mut PipeWriter) -> io::Result<()> {
        Ok(())
    }

    /// Read the plugin's DISCONNECT_REPLY payload.
    fn receive_disconnect_reply(&mut self, _pipe: &mut PipeReader) -> io::Result<()> {
        Ok(())
    }

    /// Read the payload introducing a new remote client and create the
    /// per-remote state for it.
    fn receive_client_connect(&mut self, _remote: ClientId, _pipe: &mut PipeReader) -> io::Result<()> {
        Ok(())
    }

    /// The remote client is now fully part of the local session.
    fn connect_client(&mut self, _remote: ClientId) {}

    /// The remote client left; drop its per-remote state.
    fn disconnect_client(&mut self, _remote: ClientId) {}

    /// Emit plugin messages ahead of the CLIENT_UPDATE header.
    fn before_client_update(&mut self, _pipe: &mut PipeWriter) -> io::Result<()> {
        Ok(())
    }

    /// Write the plugin's portion of a CLIENT_UPDATE.
    fn send_client_update(&mut self, _pipe: &mut PipeWriter) -> io::Result<()> {
        Ok(())
    }

    /// Read the plugin's global SERVER_UPDATE payload. Returns true if
    /// application-visible state changed.
    fn receive_server_update_global(&mut self, _pipe: &mut PipeReader) -> io::Result<bool> {
        Ok(false)
    }

    /// Read the plugin's per-peer SERVER_UPDATE payload for `remote`.
    /// Returns true if application-visible state changed.
    fn receive_server_update(
        &mut self,
        _remote: ClientId,
        _pipe: &mut PipeReader,
    ) -> io::Result<bool> {
        Ok(false)
    }

    /// Handle a message in the plugin's id range arriving outside the
    /// structured updates. `id` is relative to the plugin's base. Returning
    /// `false` signals a protocol error.
    fn handle_message(&mut self, _id: u16, _pipe: &mut PipeReader) -> io::Result<bool> {
        Ok(false)
    }

    /// Per-frame housekeeping on the embedder's thread.
    fn frame(&mut self, _local_nav: OrthoTransform) {}

    /// Per-frame, per-remote housekeeping with a snapshot of the remote's
    /// latest published state.
    fn frame_remote(&mut self, _remote: ClientId, _state: &ClientState, _local_nav: OrthoTransform) {
    }

    /// Visual render hook.
    fn gl_render(&mut self) {}

    /// Visual render hook for one remote client.
    fn gl_render_remote(&mut self, _remote: ClientId) {}

    /// Audio render hook.
    fn al_render(&mut self) {}

    /// Audio render hook for one remote client.
    fn al_render_remote(&mut self, _remote: ClientId) {}
}
