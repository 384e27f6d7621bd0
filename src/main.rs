//! relaycast: a TCP broadcast relay.
//!
//! Every byte a client sends is transformed (uppercase ASCII by default) and
//! echoed to all other connected clients. One thread, one poll loop, bounded
//! connection capacity, per-connection outbound queues that survive partial
//! writes.

mod config;
mod reactor;
mod transform;

use config::Config;
use reactor::{Reactor, ShutdownHandle};
use std::sync::OnceLock;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

static SHUTDOWN: OnceLock<ShutdownHandle> = OnceLock::new();

extern "C" fn on_signal(_sig: libc::c_int) {
    if let Some(handle) = SHUTDOWN.get() {
        handle.request();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut reactor = Reactor::new(&config, transform::uppercase)?;

    info!(
        addr = %reactor.local_addr()?,
        max_clients = config.max_clients,
        "Server listening"
    );

    // SIGINT/SIGTERM flag the shutdown handle; the reactor drains the
    // registry and returns on its own
    let _ = SHUTDOWN.set(reactor.shutdown_handle());
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    if let Err(e) = reactor.run() {
        error!(error = %e, "Reactor failed");
        return Err(e.into());
    }

    info!("Server shut down");
    Ok(())
}
