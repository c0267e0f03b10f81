//! The embedded outbound HTTP client seam.
//!
//! Every session owns one outbound client instance, created from a shared
//! [`FetcherPool`]. The session engine never looks inside it — transfers,
//! connection reuse and TLS are the client's own business — it only
//! consumes the narrow polling interface: [`Fetcher::tick`] blocks for at
//! most the given timeout and reports whether the registered control
//! socket became readable.
//!
//! While a fetcher is mid-transfer it may need to block without returning
//! control to the session loop; the [`ConnHooks`] bridge lets it service
//! reads on the control socket synchronously during its own polling
//! (enter blocking mode, perform one blocking read, restore). The hooks
//! are passed by reference at every tick — no global registries.

use polling::{Event, Poller};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll key for the registered control socket.
const CONN_KEY: usize = 0;

/// What a [`Fetcher::tick`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The registered control socket became readable.
    SocketReady,
    /// The timeout elapsed or only the fetcher's own transfers made
    /// progress.
    Normal,
}

/// Blocking-read bridge for the control socket.
///
/// Three callbacks, bracket-style: `enter_blocking_read` flips the socket
/// to blocking mode, `blocking_read_once` performs a single read (0 means
/// peer EOF), `exit_blocking_read` restores non-blocking mode. A fetcher
/// must always pair enter with exit.
pub trait ConnHooks {
    /// Switch the control socket to blocking mode.
    ///
    /// # Errors
    ///
    /// Propagates `fcntl`-level failures.
    fn enter_blocking_read(&mut self) -> io::Result<()>;

    /// Perform one blocking read into the session's buffer. Returns the
    /// byte count; 0 means the peer closed.
    ///
    /// # Errors
    ///
    /// Propagates socket read failures.
    fn blocking_read_once(&mut self) -> io::Result<usize>;

    /// Restore non-blocking mode.
    ///
    /// # Errors
    ///
    /// Propagates `fcntl`-level failures.
    fn exit_blocking_read(&mut self) -> io::Result<()>;
}

/// Per-session outbound HTTP client, as seen by the session engine.
pub trait Fetcher {
    /// Register the raw control-socket descriptor this fetcher watches
    /// alongside its own transfers.
    ///
    /// # Errors
    ///
    /// Propagates poller registration failures.
    fn register_conn(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` for readiness.
    ///
    /// # Errors
    ///
    /// Propagates poll failures.
    fn tick(&mut self, timeout: Duration, hooks: &mut dyn ConnHooks) -> io::Result<Tick>;
}

/// Shared, thread-safe factory for per-session fetchers.
///
/// Sessions on different threads create their instances from one pool;
/// the instances themselves are single-threaded.
#[derive(Debug, Default)]
pub struct FetcherPool {
    active: AtomicUsize,
}

impl FetcherPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fetcher for one session.
    ///
    /// # Errors
    ///
    /// Fails if the OS poller cannot be created.
    pub fn create(pool: &Arc<Self>) -> io::Result<PollFetcher> {
        let poller = Poller::new()?;
        let n = pool.active.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(active = n, "outbound client created");
        Ok(PollFetcher {
            pool: Arc::clone(pool),
            poller,
            events: Vec::new(),
            conn: None,
        })
    }

    /// Number of live fetcher instances.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Readiness-polling fetcher over the OS poller.
///
/// With no transfer in flight its tick degenerates to a plain wait on the
/// control socket, which is exactly what the session's idle phases need.
/// The [`ConnHooks`] bridge is part of the tick contract but only comes
/// into play during a blocking transfer segment.
pub struct PollFetcher {
    pool: Arc<FetcherPool>,
    poller: Poller,
    events: Vec<Event>,
    conn: Option<RawFd>,
}

impl Fetcher for PollFetcher {
    fn register_conn(&mut self, fd: RawFd) -> io::Result<()> {
        self.poller.add(fd, Event::readable(CONN_KEY))?;
        self.conn = Some(fd);
        Ok(())
    }

    fn tick(&mut self, timeout: Duration, _hooks: &mut dyn ConnHooks) -> io::Result<Tick> {
        let fd = self
            .conn
            .ok_or_else(|| io::Error::other("no control socket registered"))?;

        // The poller is oneshot: re-arm before every wait.
        self.poller.modify(fd, Event::readable(CONN_KEY))?;
        self.events.clear();
        self.poller.wait(&mut self.events, Some(timeout))?;

        if self
            .events
            .iter()
            .any(|ev| ev.key == CONN_KEY && ev.readable)
        {
            Ok(Tick::SocketReady)
        } else {
            Ok(Tick::Normal)
        }
    }
}

impl Drop for PollFetcher {
    fn drop(&mut self) {
        if let Some(fd) = self.conn.take() {
            let _ = self.poller.delete(fd);
        }
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
    }
}
