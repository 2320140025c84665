//! Shared utilities for integration tests.
//!
//! Every test binds its own listener on `127.0.0.1:0` and drives it with
//! plain blocking TCP clients.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use socket_link::config::LinkConfig;
use socket_link::net::{Connection, LinkContext, Listener};
use socket_link::protocol::{DuplexHandler, Protocol, ProtocolError, RequestOutcome};
use socket_link::Shutdown;

/// Small, fast settings suited to tests.
pub fn test_config() -> LinkConfig {
    let mut config = LinkConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.listener.request_read_timeout_ms = 2_000;
    config.listener.accept_retry_attempts = 3;
    config.listener.accept_retry_base_ms = 5;
    config.listener.accept_retry_max_ms = 20;
    config.threads.min = 1;
    config.threads.max = 4;
    config.threads.idle_timeout_ms = 5_000;
    config.threads.queue_capacity = 16;
    config.threads.name_prefix = "it-worker".into();
    config.keepalive.thread_timeout_ms = 50;
    config.keepalive.poll_interval_ms = 5;
    config.observability.metrics_enabled = false;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    listener: Arc<Listener>,
    accept_thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: LinkConfig, protocol: Arc<dyn Protocol>) -> Self {
        let listener = Arc::new(Listener::bind(&config, protocol, Shutdown::new()).unwrap());
        let addr = listener.local_addr();
        let runner = Arc::clone(&listener);
        let accept_thread = thread::Builder::new()
            .name("it-accept".into())
            .spawn(move || runner.run())
            .unwrap();
        Self {
            addr,
            listener,
            accept_thread: Some(accept_thread),
        }
    }

    pub fn ctx(&self) -> &Arc<LinkContext> {
        self.listener.context()
    }

    pub fn connect(&self) -> Client {
        Client::connect(self.addr)
    }

    /// Stop accepting and drain. Returns whether every worker exited.
    pub fn stop(mut self) -> bool {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> bool {
        let Some(thread) = self.accept_thread.take() else {
            return true;
        };
        self.listener.handle().stop();
        thread.join().unwrap();
        self.listener.shutdown(Duration::from_secs(5))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

pub struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn send_line(&mut self, line: &str) {
        self.send(format!("{line}\n").as_bytes());
    }

    /// Next line without its terminator; empty at end of stream.
    pub fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end().to_string()
    }

    pub fn request(&mut self, line: &str) -> String {
        self.send_line(line);
        self.read_line()
    }

    pub fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0; n];
        self.reader.read_exact(&mut buf).unwrap();
        buf
    }

    /// True once the server has closed the connection.
    pub fn is_closed_by_server(&mut self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return false,
                Err(_) => return true,
            }
        }
    }
}

pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

/// Instrumented protocol for exercising the core.
///
/// | Command      | Behaviour                                      |
/// |--------------|------------------------------------------------|
/// | `PING`       | `PONG`                                         |
/// | `SLEEP <ms>` | sleeps on the worker, then `SLEPT`             |
/// | `PANIC`      | panics inside the handler                      |
/// | `FAIL`       | returns a handler error                        |
/// | `STALL`      | `STALLING`, then a duplex handler that reads nothing |
/// | `UPGRADE`    | `UPGRADED`, then a duplex echo handler          |
/// | `QUIT`       | `BYE`, then close                              |
///
/// `on_accept` calls are counted; `on_busy` replies `BUSY` unless built with
/// [`ScriptedProtocol::panicking_on_busy`].
#[derive(Default)]
pub struct ScriptedProtocol {
    pub in_flight: Mutex<HashSet<u64>>,
    pub violations: AtomicUsize,
    pub requests: AtomicUsize,
    pub accepts: AtomicUsize,
    pub stall_calls: Arc<AtomicUsize>,
    pub completions: Arc<AtomicUsize>,
    /// Duplex hook calls in order: `"timeout"`, `"complete"`.
    pub duplex_events: Arc<Mutex<Vec<&'static str>>>,
    pub hold: Duration,
    pub panic_on_busy: bool,
}

impl ScriptedProtocol {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keep each request "in flight" for `hold` to widen race windows.
    pub fn holding(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            ..Self::default()
        })
    }

    /// `on_busy` panics instead of replying.
    pub fn panicking_on_busy() -> Arc<Self> {
        Arc::new(Self {
            panic_on_busy: true,
            ..Self::default()
        })
    }

    fn enter(&self, id: u64) {
        if !self.in_flight.lock().unwrap().insert(id) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self, id: u64) {
        self.in_flight.lock().unwrap().remove(&id);
    }

    fn handle(&self, conn: &mut Connection) -> Result<RequestOutcome, ProtocolError> {
        let mut line = String::new();
        if conn.read_stream().read_line(&mut line)? == 0 {
            return Ok(RequestOutcome::Close);
        }
        if !self.hold.is_zero() {
            thread::sleep(self.hold);
        }

        let command = line.trim_end();
        let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
        let out = conn.write_stream();
        match verb {
            "PING" => out.write_all(b"PONG\n")?,
            "SLEEP" => {
                let ms = arg
                    .parse()
                    .map_err(|_| ProtocolError::Malformed(arg.to_string()))?;
                thread::sleep(Duration::from_millis(ms));
                out.write_all(b"SLEPT\n")?;
            }
            "PANIC" => panic!("scripted panic"),
            "FAIL" => return Err(ProtocolError::Handler("scripted failure".into())),
            "STALL" => {
                out.write_all(b"STALLING\n")?;
                return Ok(RequestOutcome::Upgrade(Box::new(StallHandler {
                    calls: Arc::clone(&self.stall_calls),
                    completions: Arc::clone(&self.completions),
                })));
            }
            "UPGRADE" => {
                out.write_all(b"UPGRADED\n")?;
                return Ok(RequestOutcome::Upgrade(Box::new(EchoHandler {
                    completions: Arc::clone(&self.completions),
                    events: Arc::clone(&self.duplex_events),
                })));
            }
            "QUIT" => {
                out.write_all(b"BYE\n")?;
                return Ok(RequestOutcome::Close);
            }
            _ => out.write_all(b"ERR\n")?,
        }
        Ok(RequestOutcome::Keepalive)
    }
}

impl Protocol for ScriptedProtocol {
    fn process_request(&self, conn: &mut Connection) -> Result<RequestOutcome, ProtocolError> {
        let id = conn.id().as_u64();
        self.enter(id);
        self.requests.fetch_add(1, Ordering::SeqCst);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.handle(conn)));
        self.leave(id);
        match result {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn on_accept(&self, _conn: &mut Connection) -> Result<(), ProtocolError> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_busy(&self, conn: &mut Connection) {
        if self.panic_on_busy {
            panic!("scripted busy panic");
        }
        let out = conn.write_stream();
        let _ = out.write_all(b"BUSY\n").and_then(|_| out.flush());
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Never consumes input.
pub struct StallHandler {
    calls: Arc<AtomicUsize>,
    completions: Arc<AtomicUsize>,
}

impl DuplexHandler for StallHandler {
    fn service_read(&mut self, _conn: &mut Connection) -> Result<(), ProtocolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_complete(&mut self, _conn: &mut Connection) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Echoes buffered bytes back.
pub struct EchoHandler {
    completions: Arc<AtomicUsize>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl DuplexHandler for EchoHandler {
    fn service_read(&mut self, conn: &mut Connection) -> Result<(), ProtocolError> {
        let (input, output) = conn.streams();
        let chunk = input.fill_buf()?;
        let n = chunk.len();
        output.write_all(chunk)?;
        input.consume(n);
        output.flush()?;
        Ok(())
    }

    fn on_timeout(&mut self, _conn: &mut Connection) {
        self.events.lock().unwrap().push("timeout");
    }

    fn on_complete(&mut self, _conn: &mut Connection) {
        self.events.lock().unwrap().push("complete");
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}
