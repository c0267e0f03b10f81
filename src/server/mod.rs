//! Listener, accept loop and per-connection supervision.
//!
//! [`Server::bind`] owns the listening socket and precomputes the
//! `/json/version` document from the bound address. [`Server::run`]
//! accepts connections and hands each to a [`Session`], which runs it on
//! its own thread. Only one session is served at a time: a newly
//! accepted connection shuts down and joins the previous session before
//! taking its place.
//!
//! Nothing in this module is fatal to the process. Accept failures are
//! logged and retried; everything that goes wrong inside a connection
//! stays inside that connection.

mod client;
mod session;

pub use client::{Client, Flow, ReadOutcome};
pub use session::Session;

use crate::budget::BudgetExceeded;
use crate::cdp::DispatcherFactory;
use crate::config::ServerConfig;
use crate::http::FetcherPool;
use crate::ws::frame::FrameError;
use crate::ws::handshake::{self, UpgradeError};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use thiserror::Error;

/// Everything that can end a session early.
///
/// All of these are recoverable at per-session granularity; none abort
/// the process, and none are retried.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Socket-level failure (including interrupted reads on shutdown).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// WebSocket framing violation; the close frame has been sent
    /// best-effort by the time this propagates.
    #[error("websocket error: {0}")]
    Frame(#[from] FrameError),
    /// HTTP/upgrade failure; the 4xx response has been sent best-effort.
    #[error("upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),
    /// The session's memory ceiling was hit.
    #[error("resource limit: {0}")]
    Budget(#[from] BudgetExceeded),
}

/// The listening server.
pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    pool: Arc<FetcherPool>,
    factory: Arc<dyn DispatcherFactory>,
    json_version: Vec<u8>,
}

impl Server {
    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Propagates bind failures.
    pub fn bind(config: ServerConfig, factory: Arc<dyn DispatcherFactory>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen)?;
        let addr = listener.local_addr()?;
        let json_version = handshake::json_version_response(&addr.ip().to_string(), addr.port());
        tracing::info!(%addr, "listening");
        Ok(Self {
            listener,
            config: Arc::new(config),
            pool: Arc::new(FetcherPool::new()),
            factory,
            json_version,
        })
    }

    /// The bound address (useful when binding port 0).
    ///
    /// # Errors
    ///
    /// Propagates `getsockname` failures.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one live session at a time.
    ///
    /// # Errors
    ///
    /// Never returns under normal operation; the signature leaves room
    /// for fatal listener errors.
    pub fn run(&self) -> io::Result<()> {
        let mut active: Option<Session> = None;

        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };
            tracing::info!(%peer, "connection accepted");

            if let Some(previous) = active.take() {
                previous.shutdown();
                previous.join();
            }

            match Session::spawn(
                stream,
                Arc::clone(&self.config),
                Arc::clone(&self.pool),
                Arc::clone(&self.factory),
                self.json_version.clone(),
            ) {
                Ok(session) => active = Some(session),
                Err(err) => tracing::error!(error = %err, "failed to start session"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::NullDispatcherFactory;

    #[test]
    fn bind_ephemeral_port() {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        let server = Server::bind(config, Arc::new(NullDispatcherFactory)).unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let text = String::from_utf8(server.json_version.clone()).unwrap();
        assert!(text.contains(&format!("ws://{}:{}/", addr.ip(), addr.port())));
    }
}
