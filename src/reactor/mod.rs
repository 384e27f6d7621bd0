//! Event-driven connection manager.
//!
//! Two pieces, the second depending on the first:
//! - `ConnectionRegistry`: the authoritative membership set with a capacity
//!   bound and per-connection outbound queues.
//! - `Reactor`: the single control loop that computes readiness interests,
//!   blocks on the poll, accepts within capacity, reads into the broadcast
//!   fan-out, and flushes queued output across partial writes.

mod event_loop;
mod registry;

pub use event_loop::{Reactor, ShutdownHandle};
pub(crate) use registry::{Connection, ConnectionRegistry};
