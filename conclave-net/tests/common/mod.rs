#![allow(dead_code)]
//! Test harness utilities for the conclave-net integration tests.

use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conclave_net::{Client, ClientConfig, Server, ServerConfig};
use conclave_proto::{ClientPlugin, PipeReader, PipeWriter, PluginState, ServerPlugin};
use conclave_types::ClientState;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a server on an ephemeral loopback port, register the given
/// plugins, and start it.
pub fn start_server(plugins: Vec<Box<dyn ServerPlugin>>) -> (Server, String) {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".into(),
    };
    let mut server = Server::bind(&config).expect("bind test server");
    for plugin in plugins {
        server.register_plugin(plugin);
    }
    server.start();
    let addr = server.local_addr().to_string();
    (server, addr)
}

/// Connect a client with a default initial state.
pub fn connect(addr: &str, name: &str, plugins: Vec<Box<dyn ClientPlugin>>) -> io::Result<Client> {
    let config = ClientConfig {
        server_addr: addr.into(),
        client_name: name.into(),
    };
    Client::connect(&config, plugins, ClientState::default())
}

/// Run server ticks and client frames until `cond` holds or the timeout
/// expires; returns whether the condition was reached.
pub fn drive(
    server: &Server,
    clients: &mut [&mut Client],
    mut cond: impl FnMut(&mut [&mut Client]) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        server.update();
        for client in clients.iter_mut() {
            client.frame();
        }
        if cond(clients) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// A minimal protocol plugin whose connect payload and fate are
/// observable from the test.
pub struct ProbeClient {
    name: String,
    payload: Vec<u8>,
    base: u16,
    pub accepted: Arc<AtomicBool>,
    pub rejected: Arc<AtomicBool>,
}

impl ProbeClient {
    pub fn new(name: &str, payload: &[u8]) -> (Box<dyn ClientPlugin>, Arc<AtomicBool>, Arc<AtomicBool>) {
        let accepted = Arc::new(AtomicBool::new(false));
        let rejected = Arc::new(AtomicBool::new(false));
        let plugin = ProbeClient {
            name: name.into(),
            payload: payload.to_vec(),
            base: 0,
            accepted: Arc::clone(&accepted),
            rejected: Arc::clone(&rejected),
        };
        (Box::new(plugin), accepted, rejected)
    }
}

impl ClientPlugin for ProbeClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn message_id_base(&self) -> u16 {
        self.base
    }

    fn set_message_id_base(&mut self, base: u16) {
        self.base = base;
    }

    fn send_connect_request(&mut self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_u32(self.payload.len() as u32)?;
        pipe.write_bytes(&self.payload)
    }

    fn receive_connect_reply(&mut self, _pipe: &mut PipeReader) -> io::Result<()> {
        self.accepted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn rejected_by_server(&mut self) {
        self.rejected.store(true, Ordering::SeqCst);
    }
}

/// Server half of the probe plugin: consumes its payload and keeps no
/// per-client data.
pub struct ProbeServer {
    name: String,
}

impl ProbeServer {
    pub fn new(name: &str) -> Box<dyn ServerPlugin> {
        Box::new(ProbeServer { name: name.into() })
    }
}

impl ServerPlugin for ProbeServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive_connect_request(
        &self,
        payload_len: u32,
        pipe: &mut PipeReader,
    ) -> io::Result<Option<PluginState>> {
        pipe.skip(payload_len as usize)?;
        Ok(Some(Box::new(())))
    }
}
