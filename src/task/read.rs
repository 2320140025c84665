//! Request loop for one connection.

use std::fmt;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::net::connection::{CloseReason, Connection, ConnectionId, ConnectionState};
use crate::net::context::LinkContext;
use crate::observability::metrics;
use crate::protocol::{ProtocolError, RequestOutcome};
use crate::task::duplex::{DuplexController, DuplexReadTask};
use crate::task::{close_on_error, close_on_panic, RequestState};

/// Drives request/response cycles until the connection suspends, upgrades
/// or closes.
pub struct ReadTask {
    conn: Box<Connection>,
    ctx: Arc<LinkContext>,
    upgrade: Option<DuplexController>,
}

impl ReadTask {
    pub fn new(conn: Box<Connection>, ctx: Arc<LinkContext>) -> Self {
        Self {
            conn,
            ctx,
            upgrade: None,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn into_parts(self) -> (Box<Connection>, Option<DuplexController>, Arc<LinkContext>) {
        (self.conn, self.upgrade, self.ctx)
    }

    /// Process one unit of work.
    pub fn do_task(&mut self) -> Result<RequestState, ProtocolError> {
        let settings = self.ctx.settings();
        let protocol = self.ctx.protocol();

        if self.conn.state() == ConnectionState::Accepted {
            self.conn.to_request_active()?;
            protocol.on_accept(&mut self.conn)?;
            self.conn.write_stream().flush()?;

            // Nothing sent yet: wait like any keepalive connection instead of
            // pinning the worker in a blocking request read.
            self.conn.to_keepalive_wait()?;
            let state = self
                .conn
                .process_keepalive(settings.keepalive_thread_timeout, settings.keepalive_timeout);
            if state != RequestState::Request {
                return Ok(state);
            }
        }

        self.conn.to_request_active()?;
        let started = Instant::now();
        let outcome = protocol.process_request(&mut self.conn)?;
        self.conn.finish_request();
        metrics::record_request(started);

        match outcome {
            RequestOutcome::Continue => Ok(RequestState::Request),
            RequestOutcome::Keepalive => {
                self.conn.write_stream().flush()?;

                let max = settings.keepalive_max_requests;
                if max > 0 && self.conn.request_count() >= max {
                    self.conn.close(CloseReason::MaxRequests);
                    return Ok(RequestState::Exit);
                }

                self.conn.to_keepalive_wait()?;
                Ok(self
                    .conn
                    .process_keepalive(settings.keepalive_thread_timeout, settings.keepalive_timeout))
            }
            RequestOutcome::Upgrade(handler) => {
                self.conn.write_stream().flush()?;
                self.conn.to_duplex_active()?;
                self.upgrade = Some(DuplexController::new(handler));
                Ok(RequestState::Exit)
            }
            RequestOutcome::Close => {
                self.conn.write_stream().flush()?;
                self.conn.close(CloseReason::Completed);
                Ok(RequestState::Exit)
            }
        }
    }

    /// Loop until the connection leaves this worker, then hand it on.
    pub fn run(mut self) {
        let state = loop {
            match panic::catch_unwind(AssertUnwindSafe(|| self.do_task())) {
                Ok(Ok(RequestState::Request)) => continue,
                Ok(Ok(state)) => break state,
                Ok(Err(e)) => {
                    close_on_error(&mut self.conn, &e);
                    break RequestState::Exit;
                }
                Err(panic) => {
                    close_on_panic(&mut self.conn, &*panic);
                    break RequestState::Exit;
                }
            }
        };

        let ReadTask { conn, ctx, upgrade } = self;
        match upgrade {
            Some(controller) if !conn.is_closed() => {
                DuplexReadTask::new(conn, controller, ctx).run();
            }
            Some(controller) => ctx.finish(conn, Some(controller)),
            None if state == RequestState::Suspend => ctx.park(conn, None),
            None => ctx.release(conn),
        }
    }
}

impl fmt::Debug for ReadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadTask")
            .field("connection_id", &self.conn.id())
            .field("state", &self.conn.state())
            .field("upgraded", &self.upgrade.is_some())
            .finish()
    }
}
