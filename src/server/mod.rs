//! Device-facing TCP server.
//!
//! This module contains:
//! - Session state and the pending-command map
//! - The online-device registry and command entry point
//! - The per-connection dispatch task
//! - The accept loop with graceful shutdown

mod connection;
mod registry;
mod session;

pub use registry::{CommandOutcome, SessionHandle, SessionRegistry, Stats};
pub use session::{DeviceSession, Observation, PendingCommand, PendingCommands, SessionInfo};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, TransportError};

/// The device-facing TCP server.
pub struct DeviceServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
}

impl DeviceServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.listen_port));
        Self { config, registry }
    }

    /// The registry backing this server, shared with the control surface.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind the device port. Failure here is process-fatal by contract.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_host, self.config.listen_port)
            .parse()
            .map_err(|e| crate::Error::Config(format!("bad listen address: {e}")))?;

        TcpListener::bind(addr).await.map_err(|e| {
            TransportError::BindFailed {
                addr,
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Accept connections until shutdown, then drain.
    ///
    /// On shutdown the listener stops accepting and existing sessions are
    /// left to finish on their own; the call returns when the registry is
    /// empty or the grace deadline elapses.
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "device listener up");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            warn!(remote = %remote, error = %err, "set_nodelay failed");
                        }
                        let registry = Arc::clone(&self.registry);
                        let queue = self.config.outbound_queue;
                        tokio::spawn(connection::run(stream, remote, registry, queue));
                    }
                    Err(err) => {
                        // Transient accept failures (EMFILE and friends)
                        // should not kill the listener.
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
        drop(listener);

        info!(
            sessions = self.registry.session_count(),
            grace = ?self.config.shutdown_grace,
            "draining sessions"
        );
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while !self.registry.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.registry.session_count(),
                    "shutdown grace elapsed"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        Ok(())
    }
}
