//! Connection lifecycle: keepalive, parking, upgrade, stall, failures.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use socket_link::net::{CloseReason, ConnectionState};
use socket_link::protocol::echo::LineProtocol;

mod common;

use common::{test_config, wait_until, ScriptedProtocol, TestServer};

#[test]
fn keepalive_reuses_one_connection_across_parking() {
    let server = TestServer::start(test_config(), Arc::new(LineProtocol));
    let mut client = server.connect();

    let first_id = client.request("ID");
    assert!(first_id.starts_with("conn-"), "unexpected id reply: {first_id}");

    for _ in 0..3 {
        // Longer than the keepalive thread timeout, so the connection parks.
        thread::sleep(Duration::from_millis(150));
        assert!(wait_until(Duration::from_secs(2), || server.ctx().poller().len() == 1));
        assert_eq!(client.request("ID"), first_id);
    }

    assert_eq!(client.request("QUIT"), "BYE");
    assert!(client.is_closed_by_server());

    let ctx = server.ctx();
    assert!(wait_until(Duration::from_secs(2), || ctx.registry().is_empty()));
    let record = ctx.registry().last_close().unwrap();
    assert_eq!(record.reason, CloseReason::Completed);
    assert_eq!(record.requests, 5);
    assert_eq!(ctx.connections().stats().allocated, 1);
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    let server = TestServer::start(test_config(), Arc::new(LineProtocol));
    let mut client = server.connect();

    client.send(b"PING\nECHO one\nECHO two\n");
    assert_eq!(client.read_line(), "PONG");
    assert_eq!(client.read_line(), "one");
    assert_eq!(client.read_line(), "two");
}

#[test]
fn upgrade_switches_to_duplex_once() {
    let server = TestServer::start(test_config(), Arc::new(LineProtocol));
    let mut client = server.connect();

    assert_eq!(client.request("UPGRADE"), "UPGRADED");

    client.send(b"raw bytes");
    assert_eq!(client.read_exact(9), b"raw bytes");

    // Commands are plain bytes now.
    client.send(b"ID\n");
    assert_eq!(client.read_exact(3), b"ID\n");

    // Survives a trip through the poller.
    thread::sleep(Duration::from_millis(150));
    client.send(b"again");
    assert_eq!(client.read_exact(5), b"again");

    let snapshots = server.ctx().registry().snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].state, ConnectionState::DuplexActive);
    assert_eq!(snapshots[0].upgrades, 1);
}

#[test]
fn duplex_session_completes_once_on_peer_close() {
    let protocol = ScriptedProtocol::new();
    let server = TestServer::start(test_config(), protocol.clone());
    let mut client = server.connect();

    assert_eq!(client.request("UPGRADE"), "UPGRADED");
    client.send(b"x");
    assert_eq!(client.read_exact(1), b"x");
    drop(client);

    let ctx = server.ctx();
    assert!(wait_until(Duration::from_secs(3), || ctx.registry().is_empty()));
    assert_eq!(protocol.completions.load(Ordering::SeqCst), 1);
    assert_eq!(
        ctx.registry().last_close().unwrap().reason,
        CloseReason::PeerClosed
    );
}

#[test]
fn stalled_duplex_handler_is_closed_after_one_iteration() {
    let protocol = ScriptedProtocol::new();
    let mut config = test_config();
    config.threads.max = 1;
    let server = TestServer::start(config, protocol.clone());
    let mut client = server.connect();

    assert_eq!(client.request("STALL"), "STALLING");
    client.send(b"data the handler never reads");
    assert!(client.is_closed_by_server());

    let ctx = server.ctx();
    assert!(wait_until(Duration::from_secs(2), || ctx.registry().is_empty()));
    assert_eq!(protocol.stall_calls.load(Ordering::SeqCst), 1);
    assert_eq!(protocol.completions.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.registry().last_close().unwrap().reason, CloseReason::Stall);

    // The only worker is free again.
    assert!(wait_until(Duration::from_secs(2), || ctx.launcher().counts().active == 0));
    let mut other = server.connect();
    assert_eq!(other.request("PING"), "PONG");
}

#[test]
fn idle_keepalive_connection_times_out() {
    let mut config = test_config();
    config.keepalive.timeout_ms = 200;
    let server = TestServer::start(config, Arc::new(LineProtocol));
    let mut client = server.connect();

    assert_eq!(client.request("PING"), "PONG");
    assert!(client.is_closed_by_server());

    let ctx = server.ctx();
    assert!(wait_until(Duration::from_secs(2), || ctx.registry().is_empty()));
    assert_eq!(
        ctx.registry().last_close().unwrap().reason,
        CloseReason::IdleTimeout
    );
    assert_eq!(ctx.poller().len(), 0);
}

#[test]
fn max_requests_closes_after_the_last_reply() {
    let mut config = test_config();
    config.keepalive.max_requests = 2;
    let server = TestServer::start(config, Arc::new(LineProtocol));
    let mut client = server.connect();

    assert_eq!(client.request("PING"), "PONG");
    assert_eq!(client.request("PING"), "PONG");
    assert!(client.is_closed_by_server());

    let ctx = server.ctx();
    assert!(wait_until(Duration::from_secs(2), || ctx.registry().is_empty()));
    assert_eq!(
        ctx.registry().last_close().unwrap().reason,
        CloseReason::MaxRequests
    );
}

#[test]
fn handler_panic_closes_only_that_connection() {
    let protocol = ScriptedProtocol::new();
    let mut config = test_config();
    config.threads.max = 1;
    let server = TestServer::start(config, protocol.clone());

    let mut healthy = server.connect();
    assert_eq!(healthy.request("PING"), "PONG");

    let mut doomed = server.connect();
    doomed.send_line("PANIC");
    assert!(doomed.is_closed_by_server());

    let ctx = server.ctx();
    assert!(wait_until(Duration::from_secs(2), || {
        ctx.registry()
            .last_close()
            .is_some_and(|r| r.reason == CloseReason::HandlerPanic)
    }));

    assert_eq!(healthy.request("PING"), "PONG");
    assert_eq!(ctx.launcher().counts().total(), 1);
}

#[test]
fn handler_error_closes_the_connection() {
    let server = TestServer::start(test_config(), ScriptedProtocol::new());
    let mut client = server.connect();

    client.send_line("FAIL");
    assert!(client.is_closed_by_server());

    let ctx = server.ctx();
    assert!(wait_until(Duration::from_secs(2), || ctx.registry().is_empty()));
    assert_eq!(
        ctx.registry().last_close().unwrap().reason,
        CloseReason::HandlerError
    );
}

#[test]
fn shutdown_closes_parked_and_active_connections() {
    let server = TestServer::start(test_config(), ScriptedProtocol::new());

    let mut parked = server.connect();
    assert_eq!(parked.request("PING"), "PONG");
    assert!(wait_until(Duration::from_secs(2), || server.ctx().poller().len() == 1));

    let mut busy = server.connect();
    busy.send_line("SLEEP 300");
    assert!(wait_until(Duration::from_secs(2), || {
        server.ctx().launcher().counts().active == 1
    }));

    let ctx = Arc::clone(server.ctx());
    assert!(server.stop());

    assert!(parked.is_closed_by_server());
    assert!(busy.is_closed_by_server());
    assert!(ctx.registry().is_empty());
    assert_eq!(ctx.launcher().counts().total(), 0);
}

#[test]
fn idle_duplex_session_times_out_before_completing() {
    let protocol = ScriptedProtocol::new();
    let mut config = test_config();
    config.duplex.idle_timeout_ms = 200;
    let server = TestServer::start(config, protocol.clone());
    let mut client = server.connect();

    assert_eq!(client.request("UPGRADE"), "UPGRADED");
    client.send(b"x");
    assert_eq!(client.read_exact(1), b"x");
    assert!(client.is_closed_by_server());

    let ctx = server.ctx();
    assert!(wait_until(Duration::from_secs(2), || ctx.registry().is_empty()));
    assert_eq!(
        ctx.registry().last_close().unwrap().reason,
        CloseReason::IdleTimeout
    );
    assert_eq!(
        *protocol.duplex_events.lock().unwrap(),
        vec!["timeout", "complete"]
    );
}

#[test]
fn on_accept_runs_once_per_connection() {
    let protocol = ScriptedProtocol::new();
    let server = TestServer::start(test_config(), protocol.clone());
    let mut client = server.connect();

    assert_eq!(client.request("PING"), "PONG");
    for _ in 0..2 {
        thread::sleep(Duration::from_millis(150));
        assert!(wait_until(Duration::from_secs(2), || server.ctx().poller().len() == 1));
        assert_eq!(client.request("PING"), "PONG");
    }
    assert_eq!(protocol.accepts.load(Ordering::SeqCst), 1);

    let mut other = server.connect();
    assert_eq!(other.request("PING"), "PONG");
    assert_eq!(protocol.accepts.load(Ordering::SeqCst), 2);
}

#[test]
fn reloaded_settings_reach_running_connections() {
    let mut config = test_config();
    config.keepalive.timeout_ms = 30_000;
    let server = TestServer::start(config.clone(), Arc::new(LineProtocol));
    let ctx = Arc::clone(server.ctx());

    let mut client = server.connect();
    assert_eq!(client.request("PING"), "PONG");
    assert!(wait_until(Duration::from_secs(2), || ctx.poller().len() == 1));

    config.keepalive.timeout_ms = 200;
    config.threads.max = 2;
    ctx.apply_config(&config);
    assert_eq!(ctx.launcher().limits().max, 2);
    assert_eq!(ctx.settings().keepalive_timeout, Duration::from_millis(200));

    // The parked connection now idles out under the shorter timeout.
    assert!(client.is_closed_by_server());
    assert!(wait_until(Duration::from_secs(2), || ctx.registry().is_empty()));
    assert_eq!(
        ctx.registry().last_close().unwrap().reason,
        CloseReason::IdleTimeout
    );
}

#[test]
fn non_utf8_request_closes_as_handler_error() {
    let server = TestServer::start(test_config(), Arc::new(LineProtocol));
    let mut client = server.connect();

    client.send(b"PI\xffNG\n");
    assert!(client.is_closed_by_server());

    let ctx = server.ctx();
    assert!(wait_until(Duration::from_secs(2), || ctx.registry().is_empty()));
    assert_eq!(
        ctx.registry().last_close().unwrap().reason,
        CloseReason::HandlerError
    );
}
