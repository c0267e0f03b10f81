//! Wirehead: the connection-handling core of a headless-browser
//! remote-control server.
//!
//! Each accepted client is first served a minimal HTTP responder, then
//! (on request) upgraded in place to a WebSocket-framed remote-debugging
//! protocol. One OS thread per connection; everything on that thread is
//! synchronous and exclusively owned by it.
//!
//! # Module Structure
//!
//! - [`ws`]: WebSocket framing, masking, upgrade handshake
//! - [`server`]: listener, per-connection state machine, session threads
//! - [`http`]: the embedded outbound HTTP client seam and its poller
//! - [`cdp`]: the protocol dispatcher seam
//! - [`budget`]: per-session memory accounting
//! - [`config`]: server configuration
//!
//! # Guarantees
//!
//! - Untrusted bytes are parsed with explicit bounds checks; framing
//!   violations answer with a specific close code and end only that
//!   session.
//! - Inactivity, peer EOF, resource exhaustion and external shutdown all
//!   tear a session down without touching the process or its siblings.
//! - Per-session memory is budgeted; allocation failure is an error, not
//!   a stall.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod budget;
pub mod cdp;
pub mod config;
pub mod http;
pub mod server;
pub mod ws;

pub use config::ServerConfig;
pub use server::{Server, Session, SessionError};
