//! Disconnect handling: polite leaves, server shutdown, and abrupt drops.

mod common;

use std::time::{Duration, Instant};

use common::{connect, drive, start_server, TIMEOUT};

#[test]
fn polite_disconnect_removes_the_client() {
    let (server, addr) = start_server(vec![]);

    let mut c1 = connect(&addr, "stayer", vec![]).unwrap();
    let mut c2 = connect(&addr, "leaver", vec![]).unwrap();
    assert!(drive(&server, &mut [&mut c1, &mut c2], |clients| {
        clients[0].remote_ids().len() == 1
    }));

    c2.disconnect().expect("clean disconnect");

    // The next ticks commit the removal and notify the remaining peer.
    assert!(drive(&server, &mut [&mut c1], |clients| {
        server.client_count() == 1 && clients[0].remote_ids().is_empty()
    }));
    assert!(c1.is_connected());
}

#[test]
fn server_shutdown_notifies_every_client() {
    let (mut server, addr) = start_server(vec![]);

    let mut c1 = connect(&addr, "one", vec![]).unwrap();
    let mut c2 = connect(&addr, "two", vec![]).unwrap();
    assert!(drive(&server, &mut [&mut c1, &mut c2], |_| {
        server.client_count() == 2
    }));

    // DISCONNECT_REPLY goes out to everyone; the receive threads observe
    // it and terminate, which each client reports through its frame.
    server.shutdown();

    let start = Instant::now();
    while start.elapsed() < TIMEOUT && (c1.frame() || c2.frame()) {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!c1.frame());
    assert!(!c2.frame());
    assert!(c1.remote_ids().is_empty());
    assert!(c2.remote_ids().is_empty());
}

#[test]
fn dropped_client_is_reaped() {
    let (server, addr) = start_server(vec![]);

    let mut c1 = connect(&addr, "survivor", vec![]).unwrap();
    let c2 = connect(&addr, "vanisher", vec![]).unwrap();
    assert!(drive(&server, &mut [&mut c1], |_| server.client_count() == 2));

    // Dropping the client kills its socket without a DISCONNECT_REQUEST;
    // the connection error must stay contained to that client.
    drop(c2);

    assert!(drive(&server, &mut [&mut c1], |clients| {
        server.client_count() == 1 && clients[0].remote_ids().is_empty()
    }));
    assert!(c1.is_connected());
}
