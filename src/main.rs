//! Pollnet demo
//!
//! Opens a session on the given address and echoes every frame it receives.
//! A server also relays each frame to its other peers.
//!
//! ```text
//! pollnet <address> [data_type]
//! pollnet "<tcp://4000" string
//! pollnet ">ws://127.0.0.1:4000" json
//! ```

use std::env;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pollnet::net::session::OPTION_DATA_TYPE;
use pollnet::{Protocols, Role, Session, SessionConfig, VERSION};

fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    let mut args = env::args().skip(1);
    let Some(address) = args.next() else {
        bail!("usage: pollnet <address> [data_type]");
    };
    let data_type = args.next();

    info!("Pollnet demo v{}", VERSION);

    // Load configuration
    let config = SessionConfig::load()?;
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    let mut session = Session::with_config(config).context("Failed to create session")?;
    if let Some(data_type) = &data_type {
        session.set_option(OPTION_DATA_TYPE, data_type);
    }

    session.set_on_established(|session, peer| match peer {
        Some(peer) => info!(peer, "Established"),
        None => {
            warn!("Connection failed");
            session.close();
        }
    });
    session.set_on_disconnected(|session, peer| {
        info!(peer, "Disconnected");
        if !session.is_bound() {
            session.close();
        }
    });
    session.set_on_received(|session, frame, size, peer| {
        info!(peer, size, frame = ?frame, "Received");
        if session.is_bound() && session.is_connection_oriented() {
            session.broadcast(frame, true);
        }
        if !session.send(frame) {
            warn!(peer, "Echo failed");
        }
    });

    let role = session
        .open(&address, protocols_for(&address))
        .with_context(|| format!("Failed to open {}", address))?;
    info!(role = ?role, data_type = %session.data_type(), "Session open");

    if role == Role::Connect && session.is_connection_oriented() && !session.establish() {
        bail!("Could not connect to {}", address);
    }

    while session.is_open() {
        session.update();
    }

    info!("Session finished. Goodbye!");
    Ok(())
}

/// WebSocket only participates when the address names it
fn protocols_for(address: &str) -> Protocols {
    if address.to_ascii_lowercase().contains("ws://") {
        Protocols::WEBSOCKET
    } else {
        Protocols::UDP | Protocols::TCP
    }
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pollnet=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();
}
