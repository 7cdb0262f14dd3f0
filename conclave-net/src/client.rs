//! Client connection engine.
//!
//! One duplex pipe to the server. The connect handshake proposes the
//! client's plugin set and adopts the server-assigned message-id bases; a
//! single receive thread then handles all inbound traffic and answers every
//! SERVER_UPDATE with one CLIENT_UPDATE, so client and server interlock at
//! the server's tick rate. Remote participants are mirrored into triple
//! buffers that the embedder's frame drains without blocking the receiver.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use conclave_proto::messages::{self, read_client_state, write_client_state};
use conclave_proto::pipe::{protocol_error, read_endian_marker, send_endian_marker};
use conclave_proto::{ClientPlugin, MessageTable, PipeReader, PipeWriter};
use conclave_types::{mask, ClientId, ClientState};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. `collab.example.org:26000`.
    pub server_addr: String,
    /// Display name announced to the session.
    pub client_name: String,
}

type PluginHandle = Arc<Mutex<Box<dyn ClientPlugin>>>;

enum RemoteAction {
    Add {
        id: ClientId,
        reader: conclave_utils::TripleBufferReader<ClientState>,
        update_mask: Arc<AtomicU8>,
        shared_plugins: Vec<usize>,
    },
    Remove(ClientId),
}

struct SharedState {
    pipe: Mutex<BufWriter<TcpStream>>,
    local: Mutex<ClientState>,
    actions: Mutex<Vec<RemoteAction>>,
    disconnected: AtomicBool,
}

/// A remote participant as seen by the embedder's thread.
pub struct RemoteClient {
    id: ClientId,
    reader: conclave_utils::TripleBufferReader<ClientState>,
    update_mask: Arc<AtomicU8>,
    shared_plugins: Vec<usize>,
}

impl RemoteClient {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

/// The collaboration client.
///
/// The embedder calls [`frame`](Client::frame) once per application frame
/// on its own thread; everything network-facing happens on the receive
/// thread.
pub struct Client {
    shared: Arc<SharedState>,
    stream: TcpStream,
    plugins: Vec<PluginHandle>,
    remotes: HashMap<ClientId, RemoteClient>,
    receive_thread: Option<JoinHandle<()>>,
    disconnect_reported: bool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("remotes", &self.remotes.len())
            .finish()
    }
}

impl Client {
    /// Connect to the server, run the protocol negotiation, and start the
    /// receive thread.
    ///
    /// `plugins` is the proposed protocol set in registration order;
    /// plugins the server does not accept are told
    /// [`rejected_by_server`](ClientPlugin::rejected_by_server) and
    /// dropped. `initial` is the starting client state; its name is taken
    /// from the configuration.
    pub fn connect(
        config: &ClientConfig,
        plugins: Vec<Box<dyn ClientPlugin>>,
        mut initial: ClientState,
    ) -> io::Result<Client> {
        info!(
            "connecting to {} as '{}'",
            config.server_addr, config.client_name
        );
        let stream = TcpStream::connect(&config.server_addr)?;
        stream.set_nodelay(true)?;
        let mut write_half = BufWriter::new(stream.try_clone()?);
        let mut read_half = BufReader::new(stream.try_clone()?);

        send_endian_marker(write_half.get_mut())?;
        let swap = read_endian_marker(&mut read_half)?;

        initial.client_name = config.client_name.clone();

        // Send the connection request: full client state, then the
        // proposed plugin list with length-prefixed opaque payloads.
        {
            let mut w = PipeWriter::new(&mut write_half);
            w.write_message_id(messages::CONNECT_REQUEST)?;
            write_client_state(mask::FULL_UPDATE, &initial, &mut w)?;
            w.write_u32(plugins.len() as u32)?;
        }
        let mut proposed: Vec<Option<Box<dyn ClientPlugin>>> = Vec::new();
        for mut plugin in plugins {
            let mut w = PipeWriter::new(&mut write_half);
            w.write_string(plugin.name())?;
            plugin.send_connect_request(&mut w)?;
            proposed.push(Some(plugin));
        }
        PipeWriter::new(&mut write_half).flush()?;
        initial.clear_mask();

        // Exactly one of CONNECT_REPLY or CONNECT_REJECT follows.
        let mut r = PipeReader::new(&mut read_half, swap);
        match r.read_message_id()? {
            messages::CONNECT_REPLY => {}
            messages::CONNECT_REJECT => {
                let rejected = r.read_u32()?;
                for _ in 0..rejected {
                    let index = r.read_u32()? as usize;
                    let plugin = proposed
                        .get_mut(index)
                        .and_then(Option::as_mut)
                        .ok_or_else(|| protocol_error("bad plugin index in CONNECT_REJECT"))?;
                    plugin.receive_connect_reject(&mut r)?;
                }
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused by collaboration server",
                ));
            }
            other => {
                return Err(protocol_error(format!(
                    "expected connect reply, got message {}",
                    other
                )));
            }
        }

        // Walk the accepted plugin list: adopt the server-assigned id
        // bases and let each plugin read its reply payload.
        let mut table = MessageTable::new();
        let mut accepted: Vec<PluginHandle> = Vec::new();
        let count = r.read_u32()?;
        for _ in 0..count {
            let index = r.read_u32()? as usize;
            let base = r.read_u32()? as u16;
            let mut plugin = proposed
                .get_mut(index)
                .and_then(Option::take)
                .ok_or_else(|| protocol_error("bad plugin index in CONNECT_REPLY"))?;
            plugin.set_message_id_base(base);
            table.register_at(base, accepted.len(), plugin.num_messages());
            plugin.receive_connect_reply(&mut r)?;
            debug!(
                "negotiated protocol '{}' with message ids {}..{}",
                plugin.name(),
                base,
                base + plugin.num_messages()
            );
            accepted.push(Arc::new(Mutex::new(plugin)));
        }
        for mut plugin in proposed.iter_mut().filter_map(Option::take) {
            info!("protocol '{}' not supported by server", plugin.name());
            plugin.rejected_by_server();
        }

        let shared = Arc::new(SharedState {
            pipe: Mutex::new(write_half),
            local: Mutex::new(initial),
            actions: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_plugins = accepted.clone();
        let handle = thread::spawn(move || {
            receive_thread(thread_shared, thread_plugins, table, read_half, swap)
        });

        Ok(Client {
            shared,
            stream,
            plugins: accepted,
            remotes: HashMap::new(),
            receive_thread: Some(handle),
            disconnect_reported: false,
        })
    }

    /// Mutate the locally buffered client state. Callers OR the matching
    /// [`mask`] bits into `update_mask`; the receive thread transmits the
    /// delta with the next CLIENT_UPDATE.
    pub fn update_local<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> R {
        let mut local = self.shared.local.lock().unwrap();
        f(&mut local)
    }

    /// Whether the connection is still alive.
    pub fn is_connected(&self) -> bool {
        !self.shared.disconnected.load(Ordering::SeqCst)
    }

    /// Ids of all currently known remote participants.
    pub fn remote_ids(&self) -> Vec<ClientId> {
        self.remotes.keys().copied().collect()
    }

    /// Latest published state of a remote participant.
    pub fn remote_state(&mut self, id: ClientId) -> Option<ClientState> {
        self.remotes.get_mut(&id).map(|remote| {
            remote.reader.acquire();
            remote.reader.current().clone()
        })
    }

    /// Per-frame driver, called on the embedder's thread. Commits remote
    /// add/remove actions, runs every plugin's frame hooks against the
    /// latest remote snapshots, and reports whether the connection is
    /// still alive.
    pub fn frame(&mut self) -> bool {
        let connected = self.is_connected();
        if !connected && !self.disconnect_reported {
            self.disconnect_reported = true;
            error!("disconnected from collaboration server");
            let mut actions = self.shared.actions.lock().unwrap();
            for id in self.remotes.keys() {
                actions.push(RemoteAction::Remove(*id));
            }
        }

        // Commit remote-client list changes queued by the receive thread.
        let actions: Vec<RemoteAction> =
            self.shared.actions.lock().unwrap().drain(..).collect();
        for action in actions {
            match action {
                RemoteAction::Add {
                    id,
                    reader,
                    update_mask,
                    shared_plugins,
                } => {
                    debug!("remote client {} joined", id);
                    for &index in &shared_plugins {
                        self.plugins[index].lock().unwrap().connect_client(id);
                    }
                    self.remotes.insert(
                        id,
                        RemoteClient {
                            id,
                            reader,
                            update_mask,
                            shared_plugins,
                        },
                    );
                }
                RemoteAction::Remove(id) => {
                    if let Some(remote) = self.remotes.remove(&id) {
                        debug!("remote client {} left", id);
                        for &index in &remote.shared_plugins {
                            self.plugins[index].lock().unwrap().disconnect_client(id);
                        }
                    }
                }
            }
        }

        let local_nav = self.shared.local.lock().unwrap().nav_transform;

        for remote in self.remotes.values_mut() {
            remote.reader.acquire();
            let state = remote.reader.current();
            for &index in &remote.shared_plugins {
                self.plugins[index]
                    .lock()
                    .unwrap()
                    .frame_remote(remote.id, state, local_nav);
            }
            remote.update_mask.store(mask::NO_CHANGE, Ordering::Relaxed);
        }

        for plugin in &self.plugins {
            plugin.lock().unwrap().frame(local_nav);
        }

        connected
    }

    /// Visual render pass: global hooks, then per-remote hooks.
    pub fn gl_render(&mut self) {
        for plugin in &self.plugins {
            plugin.lock().unwrap().gl_render();
        }
        for remote in self.remotes.values() {
            for &index in &remote.shared_plugins {
                self.plugins[index].lock().unwrap().gl_render_remote(remote.id);
            }
        }
    }

    /// Audio render pass: global hooks, then per-remote hooks.
    pub fn al_render(&mut self) {
        for plugin in &self.plugins {
            plugin.lock().unwrap().al_render();
        }
        for remote in self.remotes.values() {
            for &index in &remote.shared_plugins {
                self.plugins[index].lock().unwrap().al_render_remote(remote.id);
            }
        }
    }

    /// Run a closure against one negotiated plugin, looked up by protocol
    /// name. This is how the embedder reaches plugin-specific APIs.
    pub fn with_plugin<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut dyn ClientPlugin) -> R,
    ) -> Option<R> {
        for plugin in &self.plugins {
            let mut guard = plugin.lock().unwrap();
            if guard.name() == name {
                return Some(f(&mut **guard));
            }
        }
        None
    }

    /// Politely leave the session: send DISCONNECT_REQUEST and wait for
    /// the receive thread to observe the reply.
    pub fn disconnect(mut self) -> io::Result<()> {
        {
            let mut pipe = self.shared.pipe.lock().unwrap();
            let mut w = PipeWriter::new(&mut *pipe);
            w.write_message_id(messages::DISCONNECT_REQUEST)?;
            for plugin in &self.plugins {
                plugin.lock().unwrap().send_disconnect_request(&mut w)?;
            }
            w.flush()?;
        }
        if let Some(handle) = self.receive_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.disconnected.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.receive_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Receive-thread-private mirror of one remote client.
struct PrivateRemote {
    writer: conclave_utils::TripleBufferWriter<ClientState>,
    shadow: ClientState,
    update_mask: Arc<AtomicU8>,
    shared_plugins: Vec<usize>,
}

fn receive_thread(
    shared: Arc<SharedState>,
    plugins: Vec<PluginHandle>,
    table: MessageTable,
    mut reader: BufReader<TcpStream>,
    swap: bool,
) {
    let mut privates: HashMap<ClientId, PrivateRemote> = HashMap::new();
    let result = run_receive_loop(&shared, &plugins, &table, &mut reader, swap, &mut privates);
    match result {
        Ok(()) => debug!("receive thread finished after disconnect reply"),
        Err(err) => error!("receive thread terminating: {}", err),
    }
    shared.disconnected.store(true, Ordering::SeqCst);
}

fn run_receive_loop(
    shared: &Arc<SharedState>,
    plugins: &[PluginHandle],
    table: &MessageTable,
    reader: &mut BufReader<TcpStream>,
    swap: bool,
    privates: &mut HashMap<ClientId, PrivateRemote>,
) -> io::Result<()> {
    loop {
        let message = PipeReader::new(reader, swap).read_message_id()?;
        match message {
            messages::DISCONNECT_REPLY => {
                let mut r = PipeReader::new(reader, swap);
                for plugin in plugins {
                    plugin.lock().unwrap().receive_disconnect_reply(&mut r)?;
                }
                return Ok(());
            }
            messages::CLIENT_CONNECT => {
                let mut r = PipeReader::new(reader, swap);
                let id = ClientId::from_wire(r.read_u32()?)
                    .ok_or_else(|| protocol_error("remote client id 0"))?;
                let mut shadow = ClientState::default();
                read_client_state(&mut shadow, &mut r)?;

                let count = r.read_u32()?;
                let mut shared_plugins = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let index = r.read_u32()? as usize;
                    if index >= plugins.len() {
                        return Err(protocol_error("bad plugin index in CLIENT_CONNECT"));
                    }
                    plugins[index]
                        .lock()
                        .unwrap()
                        .receive_client_connect(id, &mut r)?;
                    shared_plugins.push(index);
                }

                let (mut writer, buffer_reader) = conclave_utils::triple_buffer::<ClientState>();
                writer.write(shadow.clone());
                let update_mask = Arc::new(AtomicU8::new(shadow.update_mask));
                privates.insert(
                    id,
                    PrivateRemote {
                        writer,
                        shadow,
                        update_mask: Arc::clone(&update_mask),
                        shared_plugins: shared_plugins.clone(),
                    },
                );
                shared.actions.lock().unwrap().push(RemoteAction::Add {
                    id,
                    reader: buffer_reader,
                    update_mask,
                    shared_plugins,
                });
            }
            messages::CLIENT_DISCONNECT => {
                let id = ClientId::from_wire(PipeReader::new(reader, swap).read_u32()?)
                    .ok_or_else(|| protocol_error("remote client id 0"))?;
                privates.remove(&id);
                shared
                    .actions
                    .lock()
                    .unwrap()
                    .push(RemoteAction::Remove(id));
            }
            messages::SERVER_UPDATE => {
                handle_server_update(shared, plugins, reader, swap, privates)?;
            }
            other => {
                let slot = if table.contains(other) {
                    table.lookup(other)
                } else {
                    None
                };
                let slot =
                    slot.ok_or_else(|| protocol_error(format!("unknown message id {}", other)))?;
                let mut plugin = plugins[slot].lock().unwrap();
                let base = plugin.message_id_base();
                let mut r = PipeReader::new(reader, swap);
                if !plugin.handle_message(other - base, &mut r)? {
                    return Err(protocol_error(format!("unhandled message id {}", other)));
                }
            }
        }
    }
}

/// Process one SERVER_UPDATE and answer it with a CLIENT_UPDATE, keeping
/// the two sides in lockstep at the server's tick rate.
fn handle_server_update(
    shared: &Arc<SharedState>,
    plugins: &[PluginHandle],
    reader: &mut BufReader<TcpStream>,
    swap: bool,
    privates: &mut HashMap<ClientId, PrivateRemote>,
) -> io::Result<()> {
    {
        let mut r = PipeReader::new(reader, swap);
        let peer_count = r.read_u32()?;

        for plugin in plugins {
            plugin.lock().unwrap().receive_server_update_global(&mut r)?;
        }

        for _ in 0..peer_count {
            let id = ClientId::from_wire(r.read_u32()?)
                .ok_or_else(|| protocol_error("remote client id 0"))?;
            let private = privates
                .get_mut(&id)
                .ok_or_else(|| protocol_error(format!("update for unknown client {}", id)))?;

            private.shadow.update_mask = mask::NO_CHANGE;
            read_client_state(&mut private.shadow, &mut r)?;
            private
                .update_mask
                .fetch_or(private.shadow.update_mask, Ordering::Relaxed);
            let back = private.writer.back_mut();
            back.clone_from(&private.shadow);
            private.writer.publish();

            for &index in &private.shared_plugins {
                plugins[index].lock().unwrap().receive_server_update(id, &mut r)?;
            }
        }
    }

    // Respond with this tick's CLIENT_UPDATE.
    let mut pipe = shared.pipe.lock().unwrap();
    let mut w = PipeWriter::new(&mut *pipe);
    for plugin in plugins {
        plugin.lock().unwrap().before_client_update(&mut w)?;
    }
    w.write_message_id(messages::CLIENT_UPDATE)?;
    {
        let mut local = shared.local.lock().unwrap();
        write_client_state(local.update_mask, &local, &mut w)?;
        local.update_mask = mask::NO_CHANGE;
    }
    for plugin in plugins {
        plugin.lock().unwrap().send_client_update(&mut w)?;
    }
    w.flush()
}
