//! tcp-engine: echo server on top of the engine.
//!
//! Every byte a client sends is written back to it. Useful for exercising the
//! engine under load and for checking shutdown behavior with live clients.

use std::io;
use tcp_engine::config::Config;
use tcp_engine::{ServerHandler, SessionId, TcpServer, TcpSession};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

struct EchoHandler;

impl ServerHandler for EchoHandler {
    fn on_started_listening(&self) {
        info!("Accepting connections");
    }

    fn on_stopped_listening(&self) {
        info!("Stopped listening");
    }

    fn on_session_created(&self, session: &TcpSession) {
        match session.remote_endpoint() {
            Ok(peer) => debug!(session = session.id(), peer = %peer, "Client connected"),
            Err(_) => debug!(session = session.id(), "Client connected"),
        }
    }

    fn on_data_available(&self, session: &TcpSession, data: &[u8]) {
        if let Err(e) = session.write(data) {
            debug!(session = session.id(), error = %e, "Dropping echo");
        }
    }

    fn on_session_disconnected(&self, id: SessionId, error: Option<io::Error>) {
        match error {
            Some(e) => warn!(session = id, error = %e, "Client disconnected with error"),
            None => debug!(session = id, "Client disconnected"),
        }
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

    info!(
        listen = ?config.listen.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        threads = config.threads,
        aux_workers = config.aux_workers,
        read_buffer_size = config.read_buffer_size,
        "Starting tcp-engine echo server"
    );

    let server = TcpServer::new(config.server_options());
    server.start(&config.listen, EchoHandler, config.threads)?;

    if config.keepalive.is_some() {
        server.set_keepalive(config.keepalive.as_ref())?;
    }
    if config.timeout.is_some() {
        server.set_timeout(config.timeout)?;
    }

    wait_for_ctrl_c()?;

    info!(sessions = server.clients_count(), "Shutting down");
    server.stop()?;
    info!(sessions = server.clients_count(), "Shutdown complete");
    Ok(())
}

/// Block the main thread until Ctrl-C, on a runtime separate from the engine.
fn wait_for_ctrl_c() -> io::Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())
}
