//! End-to-end scenarios wiring several in-process peers together.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::callback::Handler;
use crate::frame::{code, Message};
use crate::pal::{pipe, PalHandle};
use crate::{errno, Dupe, HelperState, IpcManager, RoleMask};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Poll `cond` until it holds; panic if it never does.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn recording_handler(log: &Arc<Mutex<Vec<Message>>>, verdict: i32) -> Handler {
    let log = Arc::clone(log);
    Arc::new(move |msg, _port| {
        let log = Arc::clone(&log);
        Box::pin(async move {
            log.lock().push(msg);
            verdict
        })
    })
}

async fn write_raw(handle: &PalHandle, msg: &Message) {
    handle.write(&msg.encode()).await.unwrap();
}

#[tokio::test]
async fn helper_dispatches_peer_messages() {
    let manager = IpcManager::new(1);
    manager.init_helper();
    let seen = Arc::new(Mutex::new(Vec::new()));
    manager
        .register_callback(code::FINDURI, recording_handler(&seen, 0))
        .unwrap();

    let (near, far) = pipe::pair();
    manager
        .admit_handle(7, near, RoleMask::LISTEN | RoleMask::IFPOLL, None)
        .unwrap();
    eventually("helper to come up", || {
        manager.helper_state() == HelperState::Alive
    })
    .await;

    // A 32-byte frame: header plus ten payload bytes.
    let msg = Message::new(code::FINDURI, 7, 1, Bytes::from_static(b"0123456789"));
    assert_eq!(msg.frame_len(), 32);
    write_raw(&far, &msg).await;

    eventually("callback to fire", || seen.lock().len() == 1).await;
    let seen = seen.lock();
    assert_eq!(seen[0].src, 7);
    assert_eq!(seen[0].seq, 0);
    drop(seen);

    manager.terminate_helper().await;
}

#[tokio::test]
async fn duplex_request_gets_its_answer() {
    let alice = IpcManager::new(1);
    let bob = IpcManager::new(9);
    let seen = Arc::new(Mutex::new(Vec::new()));
    // Bob's handler rejects with -2; his helper turns that into a
    // response frame.
    bob.register_callback(code::FINDURI, recording_handler(&seen, -2))
        .unwrap();

    let (alice_end, bob_end) = pipe::pair();
    let to_bob = alice
        .admit_handle(9, alice_end, RoleMask::LISTEN | RoleMask::IFPOLL, None)
        .unwrap();
    bob.admit_handle(1, bob_end, RoleMask::LISTEN | RoleMask::IFPOLL, None)
        .unwrap();
    alice.init_helper();
    bob.init_helper();

    let request = Message::new(code::FINDURI, 0, 9, Bytes::from_static(b"where"));
    let retval = alice.send_request(&to_bob, &request).await.unwrap();
    assert_eq!(retval, -2);
    assert_eq!(to_bob.pending_len(), 0);
    assert_eq!(seen.lock().len(), 1);
    assert_ne!(seen.lock()[0].seq, 0);

    alice.terminate_helper().await;
    bob.terminate_helper().await;
}

#[tokio::test]
async fn disconnect_fails_the_pending_request() {
    let manager = IpcManager::new(1);
    let (near, far) = pipe::pair();
    let port = manager
        .admit_handle(5, near, RoleMask::LISTEN | RoleMask::IFPOLL, None)
        .unwrap();
    manager.init_helper();

    let requester = {
        let manager = manager.dupe();
        let port = port.dupe();
        tokio::spawn(async move {
            let msg = Message::new(code::FINDURI, 0, 5, Bytes::new());
            manager.send_request(&port, &msg).await
        })
    };
    eventually("request to be parked", || port.pending_len() == 1).await;

    // Peer 5 goes away while the request is outstanding.
    far.close();

    let retval = requester.await.unwrap().unwrap();
    assert_eq!(retval, -errno::ECONNRESET);
    assert_eq!(port.pending_len(), 0);
    eventually("all memberships to drop", || Arc::strong_count(&port) == 1).await;
    assert!(port.handle().is_err());

    manager.terminate_helper().await;
}

#[tokio::test]
async fn server_port_accepts_clients() {
    let manager = IpcManager::new(7);
    let seen = Arc::new(Mutex::new(Vec::new()));
    manager
        .register_callback(code::FINDURI, recording_handler(&seen, 0))
        .unwrap();
    let server = pipe::listen("e2e-accept").unwrap();
    manager
        .admit_handle(0, server, RoleMask::SERVER | RoleMask::IFPOLL, None)
        .unwrap();
    manager.init_helper();

    let first = pipe::connect("e2e-accept").unwrap();
    let second = pipe::connect("e2e-accept").unwrap();

    let listeners = || {
        manager
            .registry()
            .collect_matching(RoleMask::LISTEN, &[])
            .len()
    };
    eventually("both clients to be admitted", || listeners() == 2).await;
    for port in manager.registry().collect_matching(RoleMask::LISTEN, &[]) {
        assert!(port.roles().contains(RoleMask::LISTEN | RoleMask::IFPOLL));
        assert_eq!(port.peer_id(), 0);
    }

    // The accepted ports are live: a message on either reaches a callback.
    write_raw(&first, &Message::new(code::FINDURI, 3, 7, Bytes::new())).await;
    write_raw(&second, &Message::new(code::FINDURI, 4, 7, Bytes::new())).await;
    eventually("messages from both clients", || seen.lock().len() == 2).await;

    manager.terminate_helper().await;
}

#[tokio::test]
async fn broadcast_honors_roles_and_exclusions() {
    let manager = IpcManager::new(1);
    let mut fars = Vec::new();
    let mut ports = Vec::new();
    for peer_id in [3u32, 4, 5] {
        let (near, far) = pipe::pair();
        let port = manager
            .admit_handle(peer_id, near, RoleMask::DIRPRT, None)
            .unwrap();
        fars.push((peer_id, far));
        ports.push(port);
    }
    let (bystander_near, bystander_far) = pipe::pair();
    let bystander = manager
        .admit_handle(6, bystander_near, RoleMask::LISTEN, None)
        .unwrap();

    let excluded = ports[2].dupe();
    let msg = Message::new(code::TELLURI, 0, 0, Bytes::from_static(b"uri"));
    manager
        .broadcast(&msg, &[excluded], RoleMask::DIRPRT)
        .await
        .unwrap();

    for (peer_id, far) in &fars[..2] {
        let mut buf = vec![0u8; 128];
        let n = far.read(&mut buf).await.unwrap();
        let delivered = Message::try_from(Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert_eq!(delivered.dst, *peer_id);
        assert_eq!(delivered.src, 1);
        // Exactly one copy.
        assert_eq!(far.attrs().unwrap().pending_size, 0);
    }
    assert_eq!(fars[2].1.attrs().unwrap().pending_size, 0);
    assert_eq!(bystander_far.attrs().unwrap().pending_size, 0);
    drop(bystander);
}

#[tokio::test]
async fn dedicated_stream_takes_the_broadcast_fast_path() {
    let manager = IpcManager::new(1);
    let (near, far) = pipe::pair();
    manager.set_broadcast_handle(near).unwrap();
    manager.init_helper();

    let msg = Message::new(code::TELLURI, 0, 0, Bytes::from_static(b"all"));
    manager.broadcast(&msg, &[], RoleMask::empty()).await.unwrap();

    let mut buf = vec![0u8; 128];
    let n = far.read(&mut buf).await.unwrap();
    let delivered = Message::try_from(Bytes::copy_from_slice(&buf[..n])).unwrap();
    assert_eq!(delivered.src, 1);

    // An echo coming back on the broadcast stream is swallowed, not
    // dispatched: our own id is in `src`.
    let seen = Arc::new(Mutex::new(Vec::new()));
    manager
        .register_callback(code::TELLURI, recording_handler(&seen, 0))
        .unwrap();
    write_raw(&far, &delivered).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.lock().is_empty());

    manager.terminate_helper().await;
}

#[tokio::test]
async fn handover_outlives_the_exit_call() {
    let manager = IpcManager::new(1);
    let shutdowns = Arc::new(AtomicUsize::new(0));
    {
        let shutdowns = Arc::clone(&shutdowns);
        manager.on_shutdown(move || {
            shutdowns.fetch_add(1, Ordering::Relaxed);
        });
    }

    let (near, far) = pipe::pair();
    manager
        .admit_handle(
            2,
            near,
            RoleMask::LISTEN | RoleMask::IFPOLL | RoleMask::KEEPALIVE,
            None,
        )
        .unwrap();
    manager.init_helper();
    eventually("helper to come up", || {
        manager.helper_state() == HelperState::Alive
    })
    .await;

    assert!(manager.exit_with_helper(true).await);
    assert_eq!(manager.helper_state(), HelperState::HandedOver);
    assert_eq!(shutdowns.load(Ordering::Relaxed), 0);

    // The keepalive peer closes; the helper finalizes the process.
    far.close();
    eventually("shutdown hook to fire", || {
        shutdowns.load(Ordering::Relaxed) == 1
    })
    .await;
    assert_eq!(manager.helper_state(), HelperState::NotAlive);
    assert_eq!(shutdowns.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn exit_without_keepalive_just_terminates() {
    let manager = IpcManager::new(1);
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        manager.on_shutdown(move || {
            fired.fetch_add(1, Ordering::Relaxed);
        });
    }
    let (near, _far) = pipe::pair();
    manager
        .admit_handle(2, near, RoleMask::LISTEN | RoleMask::IFPOLL, None)
        .unwrap();
    manager.init_helper();

    assert!(!manager.exit_with_helper(true).await);
    assert_eq!(manager.helper_state(), HelperState::NotAlive);
    // No handover, no shutdown hook.
    assert_eq!(fired.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn evicting_ifpoll_stops_the_watching() {
    let manager = IpcManager::new(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    manager
        .register_callback(code::FINDURI, recording_handler(&seen, 0))
        .unwrap();

    let (near, far) = pipe::pair();
    let port = manager
        .admit_handle(7, near, RoleMask::LISTEN | RoleMask::IFPOLL, None)
        .unwrap();
    manager.init_helper();

    write_raw(&far, &Message::new(code::FINDURI, 7, 1, Bytes::new())).await;
    eventually("first message dispatched", || seen.lock().len() == 1).await;
    // Watched: registry memberships (2) + helper (1) + ours (1).
    eventually("helper holds a reference", || Arc::strong_count(&port) == 4).await;

    manager.registry().evict_port(&port, RoleMask::IFPOLL);
    eventually("helper lets go", || Arc::strong_count(&port) == 3).await;
    assert!(port.in_list());

    // Nothing watches the port anymore; further traffic sits unread.
    write_raw(&far, &Message::new(code::FINDURI, 7, 1, Bytes::new())).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), 1);

    manager.terminate_helper().await;
}

#[tokio::test]
async fn waiter_matches_its_own_sequence_without_the_helper() {
    let manager = IpcManager::new(1);
    let (near, far) = pipe::pair();
    let port = manager
        .admit_handle(9, near, RoleMask::LISTEN, None)
        .unwrap();

    // The peer answers out of band: an unrelated one-way frame first,
    // then the response the waiter wants.
    let feeder = tokio::spawn(async move {
        write_raw(&far, &Message::new(code::TELLURI, 9, 1, Bytes::new())).await;
        write_raw(&far, &Message::response(9, 1, 0x5151, 17)).await;
        far
    });

    let response = manager.recv_response(&port, 0x5151).await.unwrap();
    assert_eq!(response.retval().unwrap(), 17);
    assert_eq!(response.src, 9);
    feeder.await.unwrap();
    drop(port);
}
