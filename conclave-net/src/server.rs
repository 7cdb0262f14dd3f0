//! Server connection engine.
//!
//! One listen socket with a dedicated accept thread; one receive thread per
//! client running a START/CONNECTED state machine; a fan-out tick on the
//! embedder's thread that commits client-list actions and composes one
//! SERVER_UPDATE per destination from a consistent snapshot of every other
//! client's state.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use conclave_proto::messages::{self, read_client_state, write_client_state};
use conclave_proto::pipe::{read_endian_marker, send_endian_marker, protocol_error};
use conclave_proto::{MessageTable, PipeReader, PipeWriter, PluginState, ServerPlugin};
use conclave_types::{mask, ClientId, ClientState};

/// Poll interval of the accept thread's cancellation check.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on, e.g. `0.0.0.0:26000`. Port 0 picks an
    /// ephemeral port (used by the test suite).
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:26000".into(),
        }
    }
}

/// Connection approval hook; returning false answers CONNECT_REJECT.
type ApprovalFn = dyn Fn(&ClientState) -> bool + Send + Sync;

struct RegisteredPlugin {
    plugin: Arc<dyn ServerPlugin>,
    base: u16,
}

/// One negotiated protocol on a connection, with the plugin's opaque
/// per-client state. The list is kept sorted by server-wide index so the
/// shared set of any two clients falls out of a linear walk.
struct ProtocolEntry {
    /// Index of the plugin in the server's plugin list.
    index: usize,
    /// Index of the protocol in the client's proposed list.
    client_index: u32,
    plugin: Arc<dyn ServerPlugin>,
    state: PluginState,
}

struct ClientMutableState {
    state: ClientState,
    protocols: Vec<ProtocolEntry>,
}

struct ClientConnection {
    id: ClientId,
    peer: String,
    /// Kept for shutdown; reads and writes go through the clones below.
    stream: TcpStream,
    /// Pipe mutex: serialises writers (receive thread and fan-out tick).
    pipe: Mutex<BufWriter<TcpStream>>,
    /// State mutex: everything mutable that is not the pipe.
    state: Mutex<ClientMutableState>,
}

enum ClientListAction {
    Add(Arc<ClientConnection>),
    Remove(ClientId),
}

#[derive(Default)]
struct ClientList {
    /// Clients committed to the session, in connection order.
    clients: Vec<Arc<ClientConnection>>,
    actions: Vec<ClientListAction>,
    receive_threads: HashMap<ClientId, JoinHandle<()>>,
    /// Every connection with a live receive thread, including ones still
    /// negotiating; shutdown unblocks them through their sockets.
    live: HashMap<ClientId, Arc<ClientConnection>>,
}

struct Shared {
    plugins: Vec<RegisteredPlugin>,
    table: MessageTable,
    clients: Mutex<ClientList>,
    shutdown: AtomicBool,
    approve: Box<ApprovalFn>,
}

/// The collaboration server.
///
/// Bind, register the protocol plugins, then `start()`; the embedder drives
/// [`update`](Server::update) at the configured tick period and finally
/// calls [`shutdown`](Server::shutdown).
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    plugins: Vec<RegisteredPlugin>,
    table: MessageTable,
    approve: Option<Box<ApprovalFn>>,
    shared: Option<Arc<Shared>>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the listen socket. Plugins can be registered until
    /// [`start`](Server::start) is called.
    pub fn bind(config: &ServerConfig) -> io::Result<Server> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        info!("server listening on {}", local_addr);
        Ok(Server {
            listener: Some(listener),
            local_addr,
            plugins: Vec::new(),
            table: MessageTable::new(),
            approve: None,
            shared: None,
            accept_thread: None,
        })
    }

    /// Register a protocol plugin and assign its message-id range.
    pub fn register_plugin(&mut self, mut plugin: Box<dyn ServerPlugin>) {
        assert!(self.shared.is_none(), "plugins must be registered before start");
        let slot = self.plugins.len();
        let base = self.table.register(slot, plugin.num_messages());
        plugin.initialize(base);
        debug!(
            "registered protocol '{}' with message ids {}..{}",
            plugin.name(),
            base,
            base + plugin.num_messages()
        );
        self.plugins.push(RegisteredPlugin {
            plugin: Arc::from(plugin),
            base,
        });
    }

    /// Install a connection approval hook (defaults to accepting everyone).
    pub fn set_connect_approval(
        &mut self,
        approve: impl Fn(&ClientState) -> bool + Send + Sync + 'static,
    ) {
        assert!(self.shared.is_none(), "approval hook must be set before start");
        self.approve = Some(Box::new(approve));
    }

    /// Start the accept thread. No further plugins can be registered.
    pub fn start(&mut self) {
        let listener = self.listener.take().expect("server already started");
        let shared = Arc::new(Shared {
            plugins: std::mem::take(&mut self.plugins),
            table: std::mem::take(&mut self.table),
            clients: Mutex::new(ClientList::default()),
            shutdown: AtomicBool::new(false),
            approve: self.approve.take().unwrap_or_else(|| Box::new(|_| true)),
        });
        self.shared = Some(Arc::clone(&shared));
        self.accept_thread = Some(thread::spawn(move || accept_thread(listener, shared)));
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of clients committed to the session.
    pub fn client_count(&self) -> usize {
        match &self.shared {
            Some(shared) => shared.clients.lock().unwrap().clients.len(),
            None => 0,
        }
    }

    /// The fan-out tick. Commits pending client-list actions, then sends
    /// one SERVER_UPDATE to every connected client composed from a locked
    /// snapshot of every other client's state.
    pub fn update(&self) {
        let shared = match &self.shared {
            Some(shared) => shared,
            None => return,
        };

        for rp in &shared.plugins {
            rp.plugin.before_server_update();
        }

        let mut list = shared.clients.lock().unwrap();

        // Step 1: commit queued client-list actions.
        let actions: Vec<ClientListAction> = list.actions.drain(..).collect();
        for action in &actions {
            match action {
                ClientListAction::Add(conn) => {
                    info!("client {} ({}) joined the session", conn.id, conn.peer);
                    list.clients.push(Arc::clone(conn));
                    let mut st = conn.state.lock().unwrap();
                    for entry in &mut st.protocols {
                        entry.plugin.connect_client(&mut entry.state);
                    }
                }
                ClientListAction::Remove(id) => {
                    let pos = match list.clients.iter().position(|c| c.id == *id) {
                        Some(pos) => pos,
                        None => continue,
                    };
                    let conn = list.clients.remove(pos);
                    info!("client {} ({}) left the session", conn.id, conn.peer);
                    {
                        let mut st = conn.state.lock().unwrap();
                        for entry in &mut st.protocols {
                            entry.plugin.disconnect_client(&mut entry.state);
                        }
                    }
                    if let Some(handle) = list.receive_threads.remove(id) {
                        let _ = handle.join();
                    }
                }
            }
        }

        // Step 2: lock every client state for the duration of the tick so
        // each destination observes one consistent snapshot.
        let clients: Vec<Arc<ClientConnection>> = list.clients.clone();
        let mut guards: Vec<MutexGuard<ClientMutableState>> =
            clients.iter().map(|c| c.state.lock().unwrap()).collect();
        for guard in guards.iter_mut() {
            for entry in &mut guard.protocols {
                entry.plugin.before_server_update_client(&mut entry.state);
            }
        }

        // Step 3: compose and send one SERVER_UPDATE per destination.
        for dest_idx in 0..clients.len() {
            let dest = &clients[dest_idx];
            let result = send_server_update(dest, dest_idx, &clients, &mut guards, &actions);
            if let Err(err) = result {
                // A dead pipe only kills its own connection: shut the
                // socket down and let the receive thread queue the removal
                // for the next tick.
                error!("client {}: dropping connection after write error: {}", dest.id, err);
                let _ = dest.stream.shutdown(Shutdown::Both);
            }
        }

        // Step 4: per-client cleanup and mask reset.
        for guard in guards.iter_mut() {
            for entry in &mut guard.protocols {
                entry.plugin.after_server_update_client(&mut entry.state);
            }
            guard.state.update_mask = mask::NO_CHANGE;
        }
        drop(guards);
        drop(list);

        for rp in &shared.plugins {
            rp.plugin.after_server_update();
        }
    }

    /// Stop accepting, send every client a DISCONNECT_REPLY, and join all
    /// receive threads.
    pub fn shutdown(&mut self) {
        let shared = match self.shared.take() {
            Some(shared) => shared,
            None => return,
        };
        info!("server shutting down");
        shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }

        let (clients, live, threads) = {
            let mut list = shared.clients.lock().unwrap();
            let clients: Vec<Arc<ClientConnection>> = list.clients.drain(..).collect();
            let live: Vec<Arc<ClientConnection>> = list.live.drain().map(|(_, c)| c).collect();
            let threads: Vec<(ClientId, JoinHandle<()>)> =
                list.receive_threads.drain().collect();
            (clients, live, threads)
        };

        for conn in &clients {
            let mut st = conn.state.lock().unwrap();
            let result = (|| -> io::Result<()> {
                let mut pipe = conn.pipe.lock().unwrap();
                let mut w = PipeWriter::new(&mut *pipe);
                w.write_message_id(messages::DISCONNECT_REPLY)?;
                for entry in &mut st.protocols {
                    entry.plugin.send_disconnect_reply(&mut entry.state, &mut w)?;
                }
                w.flush()
            })();
            if let Err(err) = result {
                warn!("client {}: disconnect notification failed: {}", conn.id, err);
            }
        }

        // Unblock every receive thread, including connections still in
        // negotiation, so the joins below cannot hang.
        for conn in &live {
            let _ = conn.stream.shutdown(Shutdown::Read);
        }

        for (_, handle) in threads {
            let _ = handle.join();
        }

        for conn in &clients {
            let mut st = conn.state.lock().unwrap();
            for entry in &mut st.protocols {
                entry.plugin.disconnect_client(&mut entry.state);
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Write the deferred connect/disconnect notifications and the
/// SERVER_UPDATE message for one destination client.
fn send_server_update(
    dest: &Arc<ClientConnection>,
    dest_idx: usize,
    clients: &[Arc<ClientConnection>],
    guards: &mut [MutexGuard<ClientMutableState>],
    actions: &[ClientListAction],
) -> io::Result<()> {
    let mut pipe = dest.pipe.lock().unwrap();
    let mut w = PipeWriter::new(&mut *pipe);

    // Deferred per-peer connect/disconnect notifications from this tick's
    // committed actions.
    for action in actions {
        match action {
            ClientListAction::Add(new_conn) if new_conn.id != dest.id => {
                let src_idx = match clients.iter().position(|c| c.id == new_conn.id) {
                    Some(idx) => idx,
                    None => continue, // joined and left within one tick
                };
                w.write_message_id(messages::CLIENT_CONNECT)?;
                w.write_u32(new_conn.id.get())?;
                let (src, dst) = pair_mut(guards, src_idx, dest_idx);
                write_client_state(mask::FULL_UPDATE, &src.state, &mut w)?;
                write_shared_client_connect(src, dst, &mut w)?;
            }
            ClientListAction::Remove(id) if *id != dest.id => {
                w.write_message_id(messages::CLIENT_DISCONNECT)?;
                w.write_u32(id.get())?;
            }
            _ => {}
        }
    }

    // Plugin messages ahead of the update header.
    {
        let dst = &mut guards[dest_idx];
        for entry in &mut dst.protocols {
            entry.plugin.before_server_update_dest(&mut entry.state, &mut w)?;
        }
    }

    w.write_message_id(messages::SERVER_UPDATE)?;
    w.write_u32((clients.len() - 1) as u32)?;

    {
        let dst = &mut guards[dest_idx];
        for entry in &mut dst.protocols {
            entry.plugin.send_server_update_global(&mut entry.state, &mut w)?;
        }
    }

    // One delta block per other client, each followed by the payloads of
    // the plugins the two clients share.
    for src_idx in 0..clients.len() {
        if src_idx == dest_idx {
            continue;
        }
        w.write_u32(clients[src_idx].id.get())?;
        let (src, dst) = pair_mut(guards, src_idx, dest_idx);
        write_client_state(src.state.update_mask, &src.state, &mut w)?;

        let mut i = 0;
        let mut j = 0;
        while i < src.protocols.len() && j < dst.protocols.len() {
            let si = src.protocols[i].index;
            let di = dst.protocols[j].index;
            if si < di {
                i += 1;
            } else if si > di {
                j += 1;
            } else {
                let plugin = Arc::clone(&src.protocols[i].plugin);
                plugin.send_server_update(
                    &mut src.protocols[i].state,
                    &mut dst.protocols[j].state,
                    &mut w,
                )?;
                i += 1;
                j += 1;
            }
        }
    }

    w.flush()
}

/// Write the shared-protocol count and per-plugin payloads introducing
/// `src` to `dst` inside a CLIENT_CONNECT message. The per-entry index is
/// the protocol's position in the destination's negotiated list.
fn write_shared_client_connect(
    src: &mut ClientMutableState,
    dst: &mut ClientMutableState,
    w: &mut PipeWriter,
) -> io::Result<()> {
    let mut count = 0u32;
    {
        let mut i = 0;
        let mut j = 0;
        while i < src.protocols.len() && j < dst.protocols.len() {
            let (si, di) = (src.protocols[i].index, dst.protocols[j].index);
            if si < di {
                i += 1;
            } else if si > di {
                j += 1;
            } else {
                count += 1;
                i += 1;
                j += 1;
            }
        }
    }
    w.write_u32(count)?;

    let mut i = 0;
    let mut j = 0;
    while i < src.protocols.len() && j < dst.protocols.len() {
        let (si, di) = (src.protocols[i].index, dst.protocols[j].index);
        if si < di {
            i += 1;
        } else if si > di {
            j += 1;
        } else {
            w.write_u32(j as u32)?;
            let plugin = Arc::clone(&src.protocols[i].plugin);
            plugin.send_client_connect(
                &mut src.protocols[i].state,
                &mut dst.protocols[j].state,
                w,
            )?;
            i += 1;
            j += 1;
        }
    }
    Ok(())
}

/// Mutable references to two distinct list entries.
fn pair_mut<T>(v: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert!(a != b);
    if a < b {
        let (left, right) = v.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = v.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

fn accept_thread(listener: TcpListener, shared: Arc<Shared>) {
    if let Err(err) = listener.set_nonblocking(true) {
        error!("accept thread cannot poll for shutdown: {}", err);
        return;
    }

    let mut next_id: u32 = 1;
    while !shared.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let id = ClientId::new(next_id);
                next_id = next_id.checked_add(1).unwrap_or(1);
                if let Err(err) = accept_client(&shared, stream, addr, id) {
                    warn!("rejecting connection from {}: {}", addr, err);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                error!("accept error: {}", err);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("accept thread exiting");
}

fn accept_client(
    shared: &Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
    id: ClientId,
) -> io::Result<()> {
    // Accepted sockets may inherit nonblocking from the listener; the
    // receive thread needs blocking reads.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let mut write_half = stream.try_clone()?;
    let mut read_half = BufReader::new(stream.try_clone()?);

    send_endian_marker(&mut write_half)?;
    let swap = read_endian_marker(&mut read_half)?;

    let conn = Arc::new(ClientConnection {
        id,
        peer: addr.to_string(),
        stream,
        pipe: Mutex::new(BufWriter::new(write_half)),
        state: Mutex::new(ClientMutableState {
            state: ClientState::default(),
            protocols: Vec::new(),
        }),
    });

    info!("client {} connecting from {} (swap: {})", id, addr, swap);

    let thread_shared = Arc::clone(shared);
    let thread_conn = Arc::clone(&conn);
    let handle =
        thread::spawn(move || client_receive_thread(thread_shared, thread_conn, read_half, swap));
    let mut list = shared.clients.lock().unwrap();
    list.receive_threads.insert(id, handle);
    list.live.insert(id, conn);
    Ok(())
}

enum ReceiveState {
    Start,
    Connected,
    Finish,
}

fn client_receive_thread(
    shared: Arc<Shared>,
    conn: Arc<ClientConnection>,
    mut reader: BufReader<TcpStream>,
    swap: bool,
) {
    let mut client_added = false;
    let result = run_receive_machine(&shared, &conn, &mut reader, swap, &mut client_added);
    match result {
        Ok(()) => debug!("client {}: receive thread finished", conn.id),
        Err(err) => {
            error!("client {}: terminating connection: {}", conn.id, err);
        }
    }

    // Tear down only this connection. If the session never saw the client,
    // cancel the pending add; otherwise schedule the removal for the next
    // fan-out tick.
    let mut list = shared.clients.lock().unwrap();
    list.live.remove(&conn.id);
    if client_added {
        let pending = list.actions.iter().position(|action| {
            matches!(action, ClientListAction::Add(c) if c.id == conn.id)
        });
        match pending {
            Some(pos) => {
                list.actions.remove(pos);
                list.receive_threads.remove(&conn.id);
            }
            None => list.actions.push(ClientListAction::Remove(conn.id)),
        }
    } else {
        list.receive_threads.remove(&conn.id);
    }
}

fn run_receive_machine(
    shared: &Arc<Shared>,
    conn: &Arc<ClientConnection>,
    reader: &mut BufReader<TcpStream>,
    swap: bool,
    client_added: &mut bool,
) -> io::Result<()> {
    let mut state = ReceiveState::Start;
    loop {
        let message = PipeReader::new(reader, swap).read_message_id()?;
        match state {
            ReceiveState::Start => match message {
                messages::CONNECT_REQUEST => {
                    if handle_connect_request(shared, conn, reader, swap)? {
                        *client_added = true;
                        state = ReceiveState::Connected;
                    } else {
                        state = ReceiveState::Finish;
                    }
                }
                other => {
                    return Err(protocol_error(format!(
                        "message {} before connection initiation",
                        other
                    )));
                }
            },
            ReceiveState::Connected => match message {
                messages::CLIENT_UPDATE => {
                    let mut st = conn.state.lock().unwrap();
                    let mut r = PipeReader::new(reader, swap);
                    read_client_state(&mut st.state, &mut r)?;
                    for entry in &mut st.protocols {
                        entry.plugin.receive_client_update(&mut entry.state, &mut r)?;
                    }
                }
                messages::DISCONNECT_REQUEST => {
                    let mut st = conn.state.lock().unwrap();
                    {
                        let mut r = PipeReader::new(reader, swap);
                        for entry in &mut st.protocols {
                            entry
                                .plugin
                                .receive_disconnect_request(&mut entry.state, &mut r)?;
                        }
                    }
                    let mut pipe = conn.pipe.lock().unwrap();
                    let mut w = PipeWriter::new(&mut *pipe);
                    w.write_message_id(messages::DISCONNECT_REPLY)?;
                    for entry in &mut st.protocols {
                        entry.plugin.send_disconnect_reply(&mut entry.state, &mut w)?;
                    }
                    w.flush()?;
                    state = ReceiveState::Finish;
                }
                other => {
                    let mut st = conn.state.lock().unwrap();
                    let slot = if shared.table.contains(other) {
                        shared.table.lookup(other)
                    } else {
                        None
                    };
                    let slot = slot.ok_or_else(|| {
                        protocol_error(format!("unknown message id {}", other))
                    })?;
                    let rp = &shared.plugins[slot];
                    let entry = st
                        .protocols
                        .iter_mut()
                        .find(|e| e.index == slot)
                        .ok_or_else(|| {
                            protocol_error(format!(
                                "message {} for protocol '{}' not shared with this client",
                                other,
                                rp.plugin.name()
                            ))
                        })?;
                    let mut r = PipeReader::new(reader, swap);
                    let handled = entry.plugin.handle_message(
                        &mut entry.state,
                        other - rp.base,
                        &mut r,
                    )?;
                    if !handled {
                        return Err(protocol_error(format!("unhandled message id {}", other)));
                    }
                }
            },
            ReceiveState::Finish => return Ok(()),
        }
        if matches!(state, ReceiveState::Finish) {
            return Ok(());
        }
    }
}

/// Handle CONNECT_REQUEST: read the initial client state, negotiate the
/// plugin set, and answer with CONNECT_REPLY (followed by CLIENT_CONNECT
/// messages for every present peer) or CONNECT_REJECT. Returns true when
/// the client was accepted.
fn handle_connect_request(
    shared: &Arc<Shared>,
    conn: &Arc<ClientConnection>,
    reader: &mut BufReader<TcpStream>,
    swap: bool,
) -> io::Result<bool> {
    let mut st = conn.state.lock().unwrap();

    {
        let mut r = PipeReader::new(reader, swap);
        read_client_state(&mut st.state, &mut r)?;

        // Match the client's proposed protocols against the registered
        // plugins. Unknown names and plugin-refused payloads make that one
        // protocol unavailable without failing the connection.
        let proposed = r.read_u32()?;
        for client_index in 0..proposed {
            let name = r.read_string()?;
            let payload_len = r.read_u32()?;
            let slot = shared
                .plugins
                .iter()
                .position(|rp| rp.plugin.name() == name);
            match slot {
                Some(slot) => {
                    let rp = &shared.plugins[slot];
                    match rp.plugin.receive_connect_request(payload_len, &mut r)? {
                        Some(plugin_state) => {
                            st.protocols.push(ProtocolEntry {
                                index: slot,
                                client_index,
                                plugin: Arc::clone(&rp.plugin),
                                state: plugin_state,
                            });
                        }
                        None => {
                            warn!(
                                "client {}: protocol '{}' rejected the connect payload",
                                conn.id, name
                            );
                        }
                    }
                }
                None => {
                    debug!("client {}: protocol '{}' is not available", conn.id, name);
                    r.skip(payload_len as usize)?;
                }
            }
        }
    }

    // Sorted by server-wide index, shared-protocol intersection with any
    // other client is a linear walk.
    st.protocols.sort_by_key(|entry| entry.index);

    if !(shared.approve)(&st.state) {
        info!("client {}: connection refused by approval hook", conn.id);
        let mut pipe = conn.pipe.lock().unwrap();
        let mut w = PipeWriter::new(&mut *pipe);
        w.write_message_id(messages::CONNECT_REJECT)?;
        w.write_u32(st.protocols.len() as u32)?;
        for entry in &mut st.protocols {
            w.write_u32(entry.client_index)?;
            entry.plugin.send_connect_reject(&mut entry.state, &mut w)?;
        }
        w.flush()?;
        return Ok(false);
    }

    let mut pipe = conn.pipe.lock().unwrap();
    let mut w = PipeWriter::new(&mut *pipe);
    w.write_message_id(messages::CONNECT_REPLY)?;
    w.write_u32(st.protocols.len() as u32)?;
    for entry in &mut st.protocols {
        w.write_u32(entry.client_index)?;
        w.write_u32(shared.plugins[entry.index].base as u32)?;
        entry.plugin.send_connect_reply(&mut entry.state, &mut w)?;
    }

    // Introduce every already-connected peer to the new client, so all
    // CLIENT_CONNECT messages precede the first SERVER_UPDATE.
    let mut list = shared.clients.lock().unwrap();
    for peer in &list.clients {
        let mut peer_state = peer.state.lock().unwrap();
        w.write_message_id(messages::CLIENT_CONNECT)?;
        w.write_u32(peer.id.get())?;
        write_client_state(mask::FULL_UPDATE, &peer_state.state, &mut w)?;
        write_shared_client_connect(&mut peer_state, &mut st, &mut w)?;
    }
    list.actions.push(ClientListAction::Add(Arc::clone(conn)));
    drop(list);

    w.flush()?;
    info!(
        "client {}: connected as '{}' with {} protocols",
        conn.id,
        st.state.client_name,
        st.protocols.len()
    );
    Ok(true)
}
