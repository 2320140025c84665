//! Connection tasks run by the worker pool.
//!
//! # Data Flow
//! ```text
//! Listener::dispatch / KeepalivePoller wake-up
//!     → LinkTask::{Read, Duplex} scheduled on the WorkerPool
//!     → read.rs: request loop until Suspend, Exit or Upgrade
//!     → duplex.rs: raw streaming loop with stall detection
//!     → park (Suspend) or release (Exit)
//! ```
//!
//! # Design Decisions
//! - A task owns its `Box<Connection>`; handing the box on is the only way
//!   another thread can touch the connection
//! - Protocol errors and panics stop at the task boundary and close only the
//!   affected connection

pub mod duplex;
pub mod read;

use std::any::Any;
use std::sync::Arc;

use crate::net::connection::{CloseReason, Connection, ConnectionId};
use crate::net::context::LinkContext;
use crate::pool::Task;
use crate::protocol::ProtocolError;

pub use duplex::{DuplexController, DuplexReadTask};
pub use read::ReadTask;

/// Result of one unit of connection work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Input is ready; process another unit on this thread.
    Request,
    /// Nothing to read yet; hand the connection to the poller.
    Suspend,
    /// Done with this connection on this path.
    Exit,
}

/// Anything the pool can run for a connection.
#[derive(Debug)]
pub enum LinkTask {
    Read(ReadTask),
    Duplex(DuplexReadTask),
}

impl LinkTask {
    /// First task for a freshly accepted connection.
    pub fn read(conn: Box<Connection>, ctx: Arc<LinkContext>) -> Self {
        Self::Read(ReadTask::new(conn, ctx))
    }

    /// Task for a connection woken up by the poller.
    pub fn resume(
        conn: Box<Connection>,
        duplex: Option<DuplexController>,
        ctx: Arc<LinkContext>,
    ) -> Self {
        match duplex {
            Some(controller) => Self::Duplex(DuplexReadTask::new(conn, controller, ctx)),
            None => Self::Read(ReadTask::new(conn, ctx)),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Self::Read(task) => task.connection_id(),
            Self::Duplex(task) => task.connection_id(),
        }
    }

    pub fn into_parts(self) -> (Box<Connection>, Option<DuplexController>, Arc<LinkContext>) {
        match self {
            Self::Read(task) => task.into_parts(),
            Self::Duplex(task) => {
                let (conn, controller, ctx) = task.into_parts();
                (conn, Some(controller), ctx)
            }
        }
    }
}

impl Task for LinkTask {
    fn run(self) {
        match self {
            Self::Read(task) => task.run(),
            Self::Duplex(task) => task.run(),
        }
    }

    fn reject(self) {
        let (mut conn, duplex, ctx) = self.into_parts();
        conn.close(CloseReason::Shutdown);
        ctx.finish(conn, duplex);
    }
}

/// Close a connection after a protocol failure.
pub(crate) fn close_on_error(conn: &mut Connection, err: &ProtocolError) {
    if conn.is_closed() {
        tracing::debug!(connection_id = %conn.id(), error = %err, "Closed connection failed");
        return;
    }
    let reason = match err {
        ProtocolError::Io(_) => CloseReason::IoError,
        _ => CloseReason::HandlerError,
    };
    tracing::error!(
        connection_id = %conn.id(),
        peer = %conn.peer_addr(),
        error = %err,
        reason = %reason,
        "Connection task failed"
    );
    conn.close(reason);
}

/// Close a connection after a handler panic.
pub(crate) fn close_on_panic(conn: &mut Connection, panic: &(dyn Any + Send)) {
    tracing::error!(
        connection_id = %conn.id(),
        peer = %conn.peer_addr(),
        panic = panic_message(panic),
        "Connection handler panicked"
    );
    conn.close(CloseReason::HandlerPanic);
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
