//! Connection membership and per-connection outbound queues.
//!
//! The registry is the authoritative set of live connections. It owns each
//! connection's socket and queued output; nothing outside the reactor holds
//! a reference that outlives removal. Slab allocation gives O(1) insert,
//! lookup, and remove, and the slab key doubles as the poll token.

use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use slab::Slab;
use std::collections::VecDeque;

/// A contiguous, partially-consumable span of broadcast payload.
///
/// The payload is immutable once created. A partial send advances the view
/// over the shared buffer rather than reallocating; a fully sent chunk is
/// popped from the queue, never retained empty.
#[derive(Debug, Clone)]
pub struct Chunk {
    data: Bytes,
}

impl Chunk {
    /// Create a chunk over a non-empty payload.
    pub fn new(data: Bytes) -> Self {
        debug_assert!(!data.is_empty(), "chunks are never empty");
        Self { data }
    }

    /// Bytes still awaiting transmission.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Remaining length, always > 0.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Drop the first `n` sent bytes, keeping the unsent suffix.
    ///
    /// Callers pop the chunk instead when `n` equals its length.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n < self.data.len(), "fully sent chunks must be popped");
        self.data.advance(n);
    }
}

/// A single client connection: its socket plus FIFO outbound queue.
#[derive(Debug)]
pub struct Connection {
    /// Non-blocking socket, registered with the poll under the slab key.
    pub(crate) stream: TcpStream,
    /// Queued broadcast output; append at tail, drain from head.
    pub(crate) outbound: VecDeque<Chunk>,
    /// Cached write-interest state. Cleared whenever the queue drains so the
    /// next refill always reregisters, re-arming edge-triggered readiness.
    pub(crate) write_interest: bool,
}

impl Connection {
    /// Wrap an accepted, already non-blocking stream with an empty queue.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            outbound: VecDeque::new(),
            write_interest: false,
        }
    }

    /// Append a payload to the outbound queue tail.
    ///
    /// Empty payloads enqueue nothing, preserving the non-empty-chunk
    /// invariant.
    pub fn enqueue(&mut self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        self.outbound.push_back(Chunk::new(payload));
    }

    /// Whether any output is queued.
    pub fn has_pending(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Number of queued chunks.
    pub fn pending_chunks(&self) -> usize {
        self.outbound.len()
    }
}

/// Registry of active connections using slab allocation.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_clients: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_clients: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_clients),
            max_clients,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Fails with `CapacityExceeded` when the membership is full. The
    /// refused connection is returned inside the error so the caller can
    /// drop (close) or park it.
    pub fn add(&mut self, conn: Connection) -> Result<usize, RegistryError> {
        if self.connections.len() >= self.max_clients {
            return Err(RegistryError::CapacityExceeded(conn));
        }
        Ok(self.connections.insert(conn))
    }

    /// Remove a connection, returning it so the caller can deregister the
    /// stream before it is dropped (closing the socket and discarding any
    /// unsent queued chunks).
    ///
    /// Double-remove of the same id is reported as `NotFound`.
    pub fn remove(&mut self, id: usize) -> Result<Connection, RegistryError> {
        if self.connections.contains(id) {
            Ok(self.connections.remove(id))
        } else {
            Err(RegistryError::NotFound)
        }
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_clients
    }

    /// Snapshot of current member ids, in stable slab order.
    ///
    /// Iterating the snapshot tolerates removal of the member being visited;
    /// `contains` guards against entries removed earlier in the walk.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}

/// Errors from registry membership operations.
#[derive(Debug)]
pub enum RegistryError {
    /// The membership is at capacity; the refused connection is handed back.
    CapacityExceeded(Connection),
    /// No member with the given id.
    NotFound,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::CapacityExceeded(_) => write!(f, "connection limit reached"),
            RegistryError::NotFound => write!(f, "connection not found"),
        }
    }
}

impl std::error::Error for RegistryError {}
