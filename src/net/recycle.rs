//! Connection allocation and buffer recycling.
//!
//! Only buffers are recycled. A closed `Connection` is consumed by `free`,
//! so a new connection can never observe state left behind by an old one.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ListenerConfig;
use crate::net::connection::Connection;
use crate::net::registry::ConnectionRegistry;

pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Read and write buffers of one connection.
#[derive(Debug)]
pub struct LinkBuffers {
    pub read: Vec<u8>,
    pub write: Vec<u8>,
}

impl LinkBuffers {
    pub fn new(read_size: usize, write_size: usize) -> Self {
        Self {
            read: vec![0; read_size],
            write: Vec::with_capacity(write_size),
        }
    }
}

/// Recycle pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecycleStats {
    pub allocated: u64,
    pub reused: u64,
    pub freed: u64,
    pub pooled: usize,
}

#[derive(Debug)]
pub struct ConnectionPool {
    free: Mutex<Vec<LinkBuffers>>,
    capacity: usize,
    read_size: usize,
    write_size: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    freed: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: &ListenerConfig) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity: config.connection_pool_size,
            read_size: config.read_buffer_size,
            write_size: config.write_buffer_size,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        }
    }

    /// Build a connection for a freshly accepted socket, reusing pooled
    /// buffers when any are available.
    pub fn allocate(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        read_timeout: Duration,
        registry: &Arc<ConnectionRegistry>,
    ) -> io::Result<Box<Connection>> {
        let pooled = self.free.lock().pop();
        let buffers = match pooled {
            Some(buffers) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buffers
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                LinkBuffers::new(self.read_size, self.write_size)
            }
        };

        let conn = Connection::new(
            socket,
            peer_addr,
            buffers,
            self.write_size,
            read_timeout,
            registry,
        )?;
        Ok(Box::new(conn))
    }

    /// Consume a connection, closing it if still open, and keep its buffers.
    pub fn free(&self, conn: Box<Connection>) {
        let buffers = conn.into_buffers();
        self.freed.fetch_add(1, Ordering::Relaxed);

        let mut free = self.free.lock();
        if free.len() < self.capacity && buffers.read.len() == self.read_size {
            free.push(buffers);
        }
    }

    pub fn stats(&self) -> RecycleStats {
        RecycleStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            pooled: self.free.lock().len(),
        }
    }
}
