//! mio event loop for the broadcast relay.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS.
//!
//! Single-threaded by design: the poll call is the only suspension point, so
//! the registry and every outbound queue are touched by exactly one thread.
//!
//! mio is edge-triggered, so readiness is not re-reported while it persists.
//! Reads therefore drain a socket until `WouldBlock` within a tick, and a
//! sticky accept-pending flag retries the accept phase at the end of any tick
//! in which a capacity slot may have freed, picking up clients parked in the
//! OS backlog.

use crate::config::Config;
use crate::reactor::{Connection, ConnectionRegistry};
use crate::transform::Transform;
use bytes::Bytes;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Upper bound for a single read.
const READ_CHUNK: usize = 4095;

const EVENT_CAPACITY: usize = 256;

/// Requests shutdown of a running reactor from another thread or a signal
/// handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Flag the reactor for shutdown and wake its blocked readiness wait.
    ///
    /// Usable from a signal handler: an atomic store plus the waker's write
    /// to an already-open descriptor.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// The single-threaded reactor: listener, poll, registry, and the transform
/// applied to every inbound chunk before fan-out.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    registry: ConnectionRegistry,
    transform: Transform,
    read_buf: Vec<u8>,
    /// Listener readiness observed but not fully drained (capacity refusal).
    accept_pending: bool,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Reactor {
    /// Bind the listener and set up the poll.
    ///
    /// The listener gets SO_REUSEADDR, non-blocking mode, and a backlog at
    /// least as large as the connection capacity.
    pub fn new(config: &Config, transform: Transform) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = create_listener(addr, config.max_clients)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            registry: ConnectionRegistry::new(config.max_clients),
            transform,
            read_buf: vec![0u8; READ_CHUNK],
            accept_pending: false,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Resolved listen address (useful when binding port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for requesting shutdown from outside the loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run ticks until shutdown is requested.
    ///
    /// On shutdown the registry is drained synchronously: every connection is
    /// removed and closed, unsent output discarded. A poll failure is fatal
    /// and propagates to the caller.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.drain_all();
                return Ok(());
            }
            self.tick()?;
        }
    }

    /// One pass of the loop: refresh interests, block on readiness, service
    /// ready connections, then accept while capacity allows.
    fn tick(&mut self) -> io::Result<()> {
        self.refresh_interests();

        match self.poll.poll(&mut self.events, None) {
            Ok(()) => {}
            // A signal interrupting the wait is a wakeup; the run loop
            // re-checks the shutdown flag before the next tick.
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable() || event.is_write_closed(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            match token {
                LISTENER_TOKEN => self.accept_pending = true,
                WAKER_TOKEN => {}
                Token(conn_id) => {
                    if let Err(e) = self.service_connection(conn_id, readable, writable) {
                        debug!(conn_id, error = %e, "Connection error");
                        self.close_connection(conn_id);
                    }
                }
            }
        }

        // Runs after event processing so removals in this tick can free
        // capacity for clients waiting in the backlog.
        if self.accept_pending {
            self.accept_ready()?;
        }

        Ok(())
    }

    /// Write interest follows the outbound queue: on iff non-empty.
    /// Reregistration also re-arms edge-triggered readiness.
    fn refresh_interests(&mut self) {
        for id in self.registry.ids() {
            let Some(conn) = self.registry.get_mut(id) else {
                continue;
            };
            let want_write = conn.has_pending();
            if want_write == conn.write_interest {
                continue;
            }
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let res = self
                .poll
                .registry()
                .reregister(&mut conn.stream, Token(id), interest);
            match res {
                Ok(()) => conn.write_interest = want_write,
                Err(e) => {
                    debug!(conn_id = id, error = %e, "Reregister failed");
                    self.close_connection(id);
                }
            }
        }
    }

    /// Accept until the backlog is empty or capacity is reached.
    ///
    /// At capacity the remainder stays in the OS backlog and
    /// `accept_pending` stays set, so the phase reruns once a slot frees.
    fn accept_ready(&mut self) -> io::Result<()> {
        loop {
            if self.registry.len() >= self.registry.capacity() {
                warn!(
                    max_clients = self.registry.capacity(),
                    "Connection limit reached, leaving new connections in the backlog"
                );
                return Ok(());
            }

            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    // mio-accepted streams are already non-blocking
                    let Ok(id) = self.registry.add(Connection::new(stream)) else {
                        // Capacity is checked above; add cannot refuse here
                        continue;
                    };
                    let res = match self.registry.get_mut(id) {
                        Some(conn) => self.poll.registry().register(
                            &mut conn.stream,
                            Token(id),
                            Interest::READABLE,
                        ),
                        None => Ok(()),
                    };
                    match res {
                        Ok(()) => {
                            debug!(conn_id = id, peer = %peer_addr, "Accepted connection");
                        }
                        Err(e) => {
                            // Contained: only this connection is lost
                            debug!(conn_id = id, peer = %peer_addr, error = %e, "Register failed");
                            self.close_connection(id);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.accept_pending = false;
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    self.accept_pending = false;
                    return Ok(());
                }
            }
        }
    }

    /// Service one connection's readiness. An error return means the
    /// connection is unrecoverable and the caller removes it; other
    /// connections in the same tick are unaffected.
    fn service_connection(&mut self, id: usize, readable: bool, writable: bool) -> io::Result<()> {
        if !self.registry.contains(id) {
            return Ok(());
        }

        if readable {
            self.service_read(id)?;
        }

        if !self.registry.contains(id) {
            return Ok(());
        }

        if writable {
            self.service_write(id)?;
        }

        Ok(())
    }

    /// Drain the socket in bounded reads, broadcasting each chunk to every
    /// other registered connection.
    fn service_read(&mut self, id: usize) -> io::Result<()> {
        loop {
            let n = {
                let Some(conn) = self.registry.get_mut(id) else {
                    return Ok(());
                };
                match conn.stream.read(&mut self.read_buf) {
                    Ok(0) => {
                        return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer closed"))
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };

            trace!(conn_id = id, bytes = n, "Received");
            let payload = Bytes::from((self.transform)(&self.read_buf[..n]));
            self.broadcast(id, payload);
        }
    }

    /// Enqueue the payload on every connection except the sender.
    ///
    /// Each recipient gets its own chunk over the shared immutable payload;
    /// consuming one queue never affects another.
    fn broadcast(&mut self, sender: usize, payload: Bytes) {
        for id in self.registry.ids() {
            if id == sender {
                continue;
            }
            if let Some(conn) = self.registry.get_mut(id) {
                conn.enqueue(payload.clone());
            }
        }
    }

    /// Flush the outbound queue head-first.
    ///
    /// A partial send retains the unsent suffix and stops the drain for this
    /// tick, preserving byte order under backpressure. A fully sent chunk is
    /// popped and the next one tried in the same tick.
    fn service_write(&mut self, id: usize) -> io::Result<()> {
        loop {
            let Some(conn) = self.registry.get_mut(id) else {
                return Ok(());
            };
            let Some(chunk) = conn.outbound.front() else {
                return Ok(());
            };
            let len = chunk.len();

            match conn.stream.write(chunk.as_bytes()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
                }
                Ok(n) if n < len => {
                    if let Some(front) = conn.outbound.front_mut() {
                        front.advance(n);
                    }
                    return Ok(());
                }
                Ok(_) => {
                    conn.outbound.pop_front();
                    if conn.outbound.is_empty() {
                        // Drained mid-tick: clear the cached interest so a
                        // refill later this tick reregisters and re-arms the
                        // write edge
                        conn.write_interest = false;
                        return Ok(());
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove a connection: deregister, close the socket, discard unsent
    /// output.
    fn close_connection(&mut self, id: usize) {
        if let Ok(mut conn) = self.registry.remove(id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(
                conn_id = id,
                dropped_chunks = conn.pending_chunks(),
                "Connection closed"
            );
        }
    }

    /// Synchronous one-shot cleanup walk over the whole registry.
    fn drain_all(&mut self) {
        let count = self.registry.len();
        for id in self.registry.ids() {
            self.close_connection(id);
        }
        info!(connections = count, "Drained all connections");
    }
}

/// Create the listening socket: SO_REUSEADDR, non-blocking, bound, with a
/// backlog no smaller than the connection capacity.
fn create_listener(addr: SocketAddr, backlog: usize) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::uppercase;
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    /// Time for the reactor to observe connects/disconnects.
    const SETTLE: Duration = Duration::from_millis(200);

    fn start_relay(
        max_clients: usize,
    ) -> (SocketAddr, ShutdownHandle, thread::JoinHandle<io::Result<()>>) {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_clients,
            log_level: "info".to_string(),
        };
        let mut reactor = Reactor::new(&config, uppercase).unwrap();
        let addr = reactor.local_addr().unwrap();
        let shutdown = reactor.shutdown_handle();
        let handle = thread::spawn(move || reactor.run());
        (addr, shutdown, handle)
    }

    fn recv_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn expect_silence(stream: &mut TcpStream) {
        stream.set_read_timeout(Some(SETTLE)).unwrap();
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(0) => panic!("peer closed unexpectedly"),
            Ok(n) => panic!("unexpected {} bytes received", n),
            Err(e) => assert!(
                matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                "unexpected error: {e}"
            ),
        }
    }

    #[test]
    fn test_three_client_broadcast_scenario() {
        let (addr, shutdown, handle) = start_relay(30);

        let mut c1 = TcpStream::connect(addr).unwrap();
        let mut c2 = TcpStream::connect(addr).unwrap();
        let mut c3 = TcpStream::connect(addr).unwrap();
        thread::sleep(SETTLE);

        c1.write_all(b"hi").unwrap();
        assert_eq!(recv_exact(&mut c2, 2), b"HI");
        assert_eq!(recv_exact(&mut c3, 2), b"HI");
        // Exactly once per recipient, and never echoed to the sender
        expect_silence(&mut c2);
        expect_silence(&mut c3);
        expect_silence(&mut c1);

        drop(c2);
        thread::sleep(SETTLE);

        c1.write_all(b"go").unwrap();
        assert_eq!(recv_exact(&mut c3, 2), b"GO");
        expect_silence(&mut c1);

        shutdown.request();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_capacity_refusal_and_backlog_pickup() {
        let (addr, shutdown, handle) = start_relay(2);

        let mut c1 = TcpStream::connect(addr).unwrap();
        let mut c2 = TcpStream::connect(addr).unwrap();
        thread::sleep(SETTLE);

        // Third connect succeeds at the transport level but is not
        // registered while the relay is full
        let mut c3 = TcpStream::connect(addr).unwrap();
        thread::sleep(SETTLE);

        c1.write_all(b"abc").unwrap();
        assert_eq!(recv_exact(&mut c2, 3), b"ABC");
        expect_silence(&mut c3);

        // Freeing a slot picks the parked client up from the backlog
        drop(c1);
        thread::sleep(SETTLE);

        c2.write_all(b"x").unwrap();
        assert_eq!(recv_exact(&mut c3, 1), b"X");

        shutdown.request();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_backpressure_preserves_bytes_and_order() {
        let (addr, shutdown, handle) = start_relay(4);

        let mut sender = TcpStream::connect(addr).unwrap();
        let mut receiver = TcpStream::connect(addr).unwrap();
        thread::sleep(SETTLE);

        // Push enough data through a non-reading receiver to force queueing
        // and partial flushes once its socket buffer fills
        const TOTAL: usize = 256 * 1024;
        let sent: Vec<u8> = (0..TOTAL).map(|i| b'a' + (i % 26) as u8).collect();
        for piece in sent.chunks(8192) {
            sender.write_all(piece).unwrap();
        }
        thread::sleep(SETTLE);

        receiver
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut received = Vec::with_capacity(TOTAL);
        let mut buf = [0u8; 8192];
        while received.len() < TOTAL {
            let n = receiver.read(&mut buf).unwrap();
            assert!(n > 0, "relay closed before delivering everything");
            received.extend_from_slice(&buf[..n]);
        }

        let expected: Vec<u8> = sent.iter().map(|b| b.to_ascii_uppercase()).collect();
        assert_eq!(received, expected);
        expect_silence(&mut receiver);

        shutdown.request();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_drain_refill_rounds_redeliver() {
        let (addr, shutdown, handle) = start_relay(4);

        let mut sender = TcpStream::connect(addr).unwrap();
        let mut receiver = TcpStream::connect(addr).unwrap();
        thread::sleep(SETTLE);

        // Each round empties the receiver's queue before the next refills
        // it; delivery must resume every round
        for i in 0..40u8 {
            let msg = [b'a' + (i % 26)];
            sender.write_all(&msg).unwrap();
            assert_eq!(recv_exact(&mut receiver, 1), [msg[0].to_ascii_uppercase()]);
        }

        shutdown.request();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_failed_connection_does_not_stop_serving() {
        let (addr, shutdown, handle) = start_relay(4);

        // A client that vanishes right after connecting is contained; later
        // clients are still accepted and served
        let doomed = TcpStream::connect(addr).unwrap();
        drop(doomed);

        let mut c1 = TcpStream::connect(addr).unwrap();
        let mut c2 = TcpStream::connect(addr).unwrap();
        thread::sleep(SETTLE);

        c1.write_all(b"ok").unwrap();
        assert_eq!(recv_exact(&mut c2, 2), b"OK");

        shutdown.request();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_drains_and_closes_clients() {
        let (addr, shutdown, handle) = start_relay(4);

        let mut c1 = TcpStream::connect(addr).unwrap();
        let mut c2 = TcpStream::connect(addr).unwrap();
        thread::sleep(SETTLE);

        shutdown.request();
        handle.join().unwrap().unwrap();

        // Both clients observe EOF once the registry is drained
        c1.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        c2.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(c1.read(&mut buf).unwrap(), 0);
        assert_eq!(c2.read(&mut buf).unwrap(), 0);
    }
}
