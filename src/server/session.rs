//! Per-connection supervisor.
//!
//! Each accepted connection gets its own OS thread, its own memory
//! budget, and its own outbound HTTP client instance built from the
//! shared pool. Within the thread everything is synchronous; the only
//! cross-thread state is the atomic shutdown flag.
//!
//! The thread drives two phases. The HTTP phase polls the fetcher until
//! the socket is readable, feeds the client, and breaks out once the
//! connection upgrades. The protocol phase multiplexes two wake sources —
//! the control socket and the dispatcher's page work — under one
//! inactivity budget: `ms_remaining` counts down while the dispatcher is
//! idle and resets to the full timeout on socket activity.
//!
//! Cancellation is cooperative: [`Session::shutdown`] sets the flag and
//! shuts down the read side of the socket (full close where half-close
//! is unsupported), which surfaces any in-progress blocking read as EOF.
//! The thread notices either at its next loop iteration.

use crate::budget::MemBudget;
use crate::cdp::{DispatcherFactory, PageWait};
use crate::config::ServerConfig;
use crate::http::{Fetcher, FetcherPool, Tick};
use crate::server::client::{Client, Flow, ReadOutcome};
use crate::server::SessionError;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    /// Peer closed the connection.
    Eof,
    /// Clean protocol-level close.
    Closed,
    /// Nothing happened for longer than the inactivity timeout.
    Timeout,
    /// External shutdown request.
    Shutdown,
}

/// Handle to one connection's thread.
///
/// The supervisor keeps its own clone of the socket so it can interrupt
/// a blocking read; all other per-connection state lives on the session
/// thread and is owned exclusively by it.
pub struct Session {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stream: TcpStream,
}

impl Session {
    /// Spawn the session thread for an accepted socket.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be cloned or the thread cannot be
    /// spawned.
    pub fn spawn(
        stream: TcpStream,
        config: Arc<ServerConfig>,
        pool: Arc<FetcherPool>,
        factory: Arc<dyn DispatcherFactory>,
        json_version: Vec<u8>,
    ) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let supervisor_stream = stream.try_clone()?;
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("wirehead-session".into())
            .spawn(move || run(stream, &flag, &config, &pool, factory.as_ref(), json_version))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
            stream: supervisor_stream,
        })
    }

    /// Request cooperative shutdown and interrupt any blocking read.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        #[cfg(unix)]
        let _ = self.stream.shutdown(Shutdown::Read);
        #[cfg(not(unix))]
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Block until the session thread has fully exited.
    pub fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("session thread panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
            self.join_inner();
        }
    }
}

/// Session thread body: set up per-connection state, run both phases,
/// log the outcome. Never panics outward; every failure is local to the
/// connection.
fn run(
    stream: TcpStream,
    shutdown: &AtomicBool,
    config: &ServerConfig,
    pool: &Arc<FetcherPool>,
    factory: &dyn DispatcherFactory,
    json_version: Vec<u8>,
) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| String::from("<unknown>"), |a| a.to_string());
    tracing::debug!(%peer, "session started");

    let result = (|| -> Result<End, SessionError> {
        let budget = Rc::new(MemBudget::new(config.memory_limit));
        let mut client = Client::new(
            stream,
            budget,
            config.max_message_size,
            json_version,
        )?;
        let mut fetcher = FetcherPool::create(pool)?;
        fetcher.register_conn(client.stream().as_raw_fd())?;

        if let Some(end) = http_phase(&mut client, &mut fetcher, shutdown, config, factory)? {
            return Ok(end);
        }
        cdp_phase(&mut client, &mut fetcher, shutdown, config, factory)
    })();

    match result {
        Ok(End::Timeout) => tracing::info!(%peer, "session closed after inactivity timeout"),
        Ok(end) => tracing::debug!(%peer, reason = ?end, "session ended"),
        Err(err) => tracing::warn!(%peer, error = %err, "session ended with error"),
    }
}

/// Pre-upgrade phase. Returns `None` once the connection upgrades.
fn http_phase(
    client: &mut Client,
    fetcher: &mut dyn Fetcher,
    shutdown: &AtomicBool,
    config: &ServerConfig,
    factory: &dyn DispatcherFactory,
) -> Result<Option<End>, SessionError> {
    let mut deadline = Instant::now() + config.timeout;

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return Ok(Some(End::Timeout));
        }
        // Anything other than "the control socket is readable" counts as
        // inactivity here: there is no page work before the upgrade.
        match fetcher.tick(deadline - now, client)? {
            Tick::Normal => return Ok(Some(End::Timeout)),
            Tick::SocketReady => {}
        }

        match client.read_socket() {
            Ok(ReadOutcome::Eof) => return Ok(Some(End::Eof)),
            Ok(ReadOutcome::WouldBlock) => continue,
            Ok(ReadOutcome::Data(_)) => deadline = Instant::now() + config.timeout,
            // Outside the upgrade taxonomy (resource ceiling, most
            // likely): answer 500 before tearing down.
            Err(err @ SessionError::Budget(_)) => {
                client.http_internal_error();
                return Err(err);
            }
            Err(err) => return Err(err),
        }
        match client.process(factory)? {
            Flow::Upgraded => return Ok(None),
            Flow::Closed => return Ok(Some(End::Closed)),
            Flow::Continue => {}
        }
    }
    Ok(Some(End::Shutdown))
}

/// Post-upgrade phase: multiplex the control socket with the
/// dispatcher's page work under the inactivity budget.
fn cdp_phase(
    client: &mut Client,
    fetcher: &mut dyn Fetcher,
    shutdown: &AtomicBool,
    config: &ServerConfig,
    factory: &dyn DispatcherFactory,
) -> Result<End, SessionError> {
    // Frames may have arrived in the same bytes as the handshake.
    if let Some(end) = drain(client, factory)? {
        return Ok(end);
    }

    let timeout_ms = config.timeout.as_millis() as u64;
    let mut last_activity = Instant::now();
    let mut ms_remaining = timeout_ms;

    while !shutdown.load(Ordering::Relaxed) {
        match client.page_wait(ms_remaining) {
            PageWait::SocketReady => {
                if let Some(end) = drain(client, factory)? {
                    return Ok(end);
                }
                ms_remaining = timeout_ms;
                last_activity = Instant::now();
            }
            PageWait::NoPage => {
                match fetcher.tick(Duration::from_millis(ms_remaining), client)? {
                    Tick::SocketReady => {
                        if let Some(end) = drain(client, factory)? {
                            return Ok(end);
                        }
                        ms_remaining = timeout_ms;
                        last_activity = Instant::now();
                    }
                    Tick::Normal => return Ok(End::Timeout),
                }
            }
            PageWait::Done => {
                let elapsed = last_activity.elapsed().as_millis() as u64;
                if elapsed > ms_remaining {
                    return Ok(End::Timeout);
                }
                ms_remaining -= elapsed;
                last_activity = Instant::now();
            }
        }
    }
    Ok(End::Shutdown)
}

/// One read followed by processing of everything complete.
fn drain(client: &mut Client, factory: &dyn DispatcherFactory) -> Result<Option<End>, SessionError> {
    match client.read_socket()? {
        ReadOutcome::Eof => return Ok(Some(End::Eof)),
        ReadOutcome::WouldBlock => {}
        ReadOutcome::Data(_) => {}
    }
    match client.process(factory)? {
        Flow::Closed => Ok(Some(End::Closed)),
        Flow::Upgraded | Flow::Continue => Ok(None),
    }
}
