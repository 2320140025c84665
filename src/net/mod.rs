//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, bounded scheduling retry)
//!     → recycle.rs (connection built from pooled buffers)
//!     → registry.rs (diagnostics entry)
//!     → task/ (request loop on a worker)
//!     → poller.rs (while idle) or recycle.rs (when done)
//!
//! Connection States:
//!     Accepted → RequestActive ⇄ RequestKeepaliveWait → (DuplexActive) → Closed
//! ```
//!
//! # Design Decisions
//! - Blocking sockets on OS worker threads; no async runtime in the data path
//! - Each connection tracked for diagnostics and forced shutdown
//! - Only buffers are recycled, never connection state

pub mod connection;
pub mod context;
pub mod listener;
pub mod poller;
pub mod recycle;
pub mod registry;
pub mod stream;

pub use connection::{CloseReason, Connection, ConnectionError, ConnectionId, ConnectionState};
pub use context::{LinkContext, LinkReport, LinkSettings};
pub use listener::{Listener, ListenerError, ListenerHandle};
