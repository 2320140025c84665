//! Post-upgrade streaming loop.
//!
//! # Responsibilities
//! - Feed available input to the connection's `DuplexHandler`
//! - Suspend to the poller when the peer goes quiet
//! - Close a connection whose handler stops consuming input
//!
//! # Design Decisions
//! - Progress is measured by `ReadStream::position`: a handler call that
//!   leaves it unchanged while input was ready is a stall, and the connection
//!   is closed on that first iteration rather than spun on
//! - The controller travels with the connection through suspension, so
//!   `on_start` and `on_complete` run exactly once per session

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::net::connection::{CloseReason, Connection, ConnectionId};
use crate::net::context::LinkContext;
use crate::observability::metrics;
use crate::protocol::{DuplexHandler, ProtocolError};
use crate::task::{close_on_error, close_on_panic, RequestState};

/// Owns a duplex handler for the lifetime of the session.
pub struct DuplexController {
    handler: Box<dyn DuplexHandler>,
    started: bool,
    completed: bool,
}

impl DuplexController {
    pub fn new(handler: Box<dyn DuplexHandler>) -> Self {
        Self {
            handler,
            started: false,
            completed: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn start(&mut self, conn: &mut Connection) -> Result<(), ProtocolError> {
        if !self.started {
            self.started = true;
            self.handler.on_start(conn)?;
        }
        Ok(())
    }

    /// End the session: `on_timeout` if it idled out, then `on_complete`.
    /// Only the first call does anything. Hook panics are contained here
    /// since this also runs on the poller thread.
    pub fn complete(&mut self, conn: &mut Connection) {
        if self.completed {
            return;
        }
        self.completed = true;

        let handler = &mut self.handler;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            if conn.close_reason() == Some(CloseReason::IdleTimeout) {
                handler.on_timeout(conn);
            }
            handler.on_complete(conn);
        }));
        if result.is_err() {
            tracing::error!(connection_id = %conn.id(), "Duplex completion hook panicked");
        }
    }
}

impl fmt::Debug for DuplexController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexController")
            .field("started", &self.started)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

/// Services an upgraded connection.
pub struct DuplexReadTask {
    conn: Box<Connection>,
    controller: DuplexController,
    ctx: Arc<LinkContext>,
}

impl DuplexReadTask {
    pub fn new(conn: Box<Connection>, controller: DuplexController, ctx: Arc<LinkContext>) -> Self {
        Self {
            conn,
            controller,
            ctx,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn into_parts(self) -> (Box<Connection>, DuplexController, Arc<LinkContext>) {
        (self.conn, self.controller, self.ctx)
    }

    /// Service input until the peer goes quiet, the connection closes, or the
    /// handler stalls. Never returns `Request`.
    pub fn do_task(&mut self) -> Result<RequestState, ProtocolError> {
        self.conn.to_duplex_active()?;
        self.controller.start(&mut self.conn)?;

        let settings = self.ctx.settings();
        loop {
            let state = self
                .conn
                .process_keepalive(settings.keepalive_thread_timeout, settings.duplex_idle_timeout);
            if state != RequestState::Request {
                return Ok(state);
            }

            let before = self.conn.read_stream().position();
            self.controller.handler.service_read(&mut self.conn)?;
            if self.conn.is_closed() {
                return Ok(RequestState::Exit);
            }

            let after = self.conn.read_stream().position();
            if after == before {
                tracing::warn!(
                    connection_id = %self.conn.id(),
                    peer = %self.conn.peer_addr(),
                    position = after,
                    "Duplex handler made no progress, closing stalled connection"
                );
                metrics::record_stall();
                self.conn.close(CloseReason::Stall);
                return Ok(RequestState::Exit);
            }
        }
    }

    pub fn run(mut self) {
        let state = match panic::catch_unwind(AssertUnwindSafe(|| self.do_task())) {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                close_on_error(&mut self.conn, &e);
                RequestState::Exit
            }
            Err(panic) => {
                close_on_panic(&mut self.conn, &*panic);
                RequestState::Exit
            }
        };

        let DuplexReadTask {
            conn,
            controller,
            ctx,
        } = self;
        match state {
            RequestState::Suspend => ctx.park(conn, Some(controller)),
            _ => ctx.finish(conn, Some(controller)),
        }
    }
}

impl fmt::Debug for DuplexReadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexReadTask")
            .field("connection_id", &self.conn.id())
            .field("controller", &self.controller)
            .finish()
    }
}
