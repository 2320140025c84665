//! Application protocol seam.
//!
//! The core never parses bytes. A `Protocol` turns buffered input into
//! responses one request at a time and tells the caller what to do next; a
//! `DuplexHandler` takes over the socket after an upgrade.
//!
//! # Data Flow
//! ```text
//! ReadTask
//!     → Protocol::process_request (one request)
//!     → RequestOutcome::{Continue, Keepalive, Upgrade, Close}
//!
//! Upgrade(handler)
//!     → DuplexReadTask
//!     → DuplexHandler::service_read (once per wake-up with data)
//! ```

pub mod echo;

use std::io;

use thiserror::Error;

use crate::net::connection::{Connection, ConnectionError};

/// What the protocol wants after a request.
pub enum RequestOutcome {
    /// More input is already buffered for the next request; go again.
    Continue,
    /// Response done; wait for the next request on this connection.
    Keepalive,
    /// Switch to raw duplex streaming with this handler.
    Upgrade(Box<dyn DuplexHandler>),
    /// Close the connection.
    Close,
}

impl std::fmt::Debug for RequestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => f.write_str("Continue"),
            Self::Keepalive => f.write_str("Keepalive"),
            Self::Upgrade(_) => f.write_str("Upgrade(..)"),
            Self::Close => f.write_str("Close"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Request/response protocol spoken on a listener.
pub trait Protocol: Send + Sync + 'static {
    /// Read and answer one request.
    fn process_request(&self, conn: &mut Connection) -> Result<RequestOutcome, ProtocolError>;

    /// Runs once, the first time a worker picks the connection up.
    fn on_accept(&self, _conn: &mut Connection) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Last chance to tell the peer the server is saturated before close.
    fn on_busy(&self, _conn: &mut Connection) {}

    fn name(&self) -> &'static str {
        "protocol"
    }
}

/// Services a connection after an upgrade.
pub trait DuplexHandler: Send + 'static {
    /// Consume available input. Must make progress: an iteration that reads
    /// nothing is treated as a stall and closes the connection.
    fn service_read(&mut self, conn: &mut Connection) -> Result<(), ProtocolError>;

    fn on_start(&mut self, _conn: &mut Connection) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// The connection was idle past its duplex timeout.
    fn on_timeout(&mut self, _conn: &mut Connection) {}

    /// Called exactly once when the duplex session ends, for any reason.
    fn on_complete(&mut self, _conn: &mut Connection) {}
}
