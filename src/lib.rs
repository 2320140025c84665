//! Connection acceptor and elastic worker-thread dispatcher.
//!
//! A `Listener` accepts TCP connections and hands each one, as a task, to a
//! bounded pool of OS worker threads. A task runs request/response cycles
//! through a pluggable `Protocol`, parks idle connections with the keepalive
//! poller, and can upgrade a connection into raw duplex streaming.

pub mod admin;
pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod resilience;
pub mod task;

pub use config::schema::LinkConfig;
pub use lifecycle::Shutdown;
pub use net::{Connection, LinkContext, Listener, ListenerHandle};
pub use protocol::{DuplexHandler, Protocol, ProtocolError, RequestOutcome};
