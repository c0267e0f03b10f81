//! The per-connection state machine.
//!
//! A [`Client`] starts in plain-HTTP mode and either answers one of the
//! fixed routes or upgrades in place to the WebSocket-framed protocol,
//! constructing its dispatcher as it switches. The transition happens
//! exactly once and never reverses.
//!
//! The pre-upgrade request and post-upgrade frames share the same
//! [`FrameReader`] buffer; the session loop reads socket bytes into it
//! and calls [`Client::process`] to drain whatever is complete.
//!
//! Outbound frames are built in a scratch arena that reserves the frame
//! header area up front; after every send the arena is reset but keeps up
//! to a fixed capacity, amortizing allocations across messages.

use crate::budget::MemBudget;
use crate::cdp::{Dispatcher, DispatcherFactory, FrameSink};
use crate::http::ConnHooks;
use crate::server::SessionError;
use crate::ws::frame::{self, CloseCode, Opcode, HEADER_RESERVE};
use crate::ws::handshake::{self, HttpAction, UpgradeError, MAX_REQUEST_SIZE};
use crate::ws::reader::{FrameReader, MessageKind};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::rc::Rc;

/// Bytes asked of the socket per read.
const READ_CHUNK: usize = 4096;

/// Capacity the send arena keeps across sends.
const ARENA_RETAIN: usize = 64 * 1024;

/// Connection mode. `Cdp` owns the protocol dispatcher built at upgrade.
enum Mode {
    Http,
    Cdp(Box<dyn Dispatcher>),
}

/// What the session loop should do after a `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// The connection just switched to the protocol phase.
    Upgraded,
    /// The connection is done; tear it down.
    Closed,
}

/// Result of one non-blocking socket read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes landed in the reader.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// Peer closed the connection.
    Eof,
}

/// Socket plus its current blocking-mode flag.
///
/// The socket is normally non-blocking so reads are never starved by a
/// slow write. `send` flips it to blocking only when a write would block,
/// for the remainder of that single send.
struct Wire {
    stream: TcpStream,
    nonblocking: bool,
}

impl Wire {
    fn set_nonblocking(&mut self, on: bool) -> io::Result<()> {
        if self.nonblocking != on {
            self.stream.set_nonblocking(on)?;
            self.nonblocking = on;
        }
        Ok(())
    }

    /// Write all of `bytes`, escalating to blocking mode at most once.
    fn send(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        let mut escalated = false;
        let result = loop {
            match self.stream.write(bytes) {
                Ok(n) if n == bytes.len() => break Ok(()),
                Ok(0) => break Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // A blocking socket cannot report WouldBlock, so a
                    // second escalation within one send is a logic error.
                    debug_assert!(!escalated, "re-entrant blocking escalation");
                    self.set_nonblocking(false)?;
                    escalated = true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        if escalated {
            self.set_nonblocking(true)?;
        }
        result
    }
}

/// Scratch allocator for outbound frames.
struct SendArena {
    buf: Vec<u8>,
}

impl SendArena {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Clear and reserve the frame-header area; payload goes after it.
    fn start(&mut self) -> &mut Vec<u8> {
        self.buf.clear();
        self.buf.resize(HEADER_RESERVE, 0);
        &mut self.buf
    }

    /// Reset after a send, retaining up to [`ARENA_RETAIN`] capacity.
    fn reset(&mut self) {
        self.buf.clear();
        if self.buf.capacity() > ARENA_RETAIN {
            self.buf.shrink_to(ARENA_RETAIN);
        }
    }
}

/// Sink handed to the dispatcher for building replies.
struct WireSink<'a> {
    wire: &'a mut Wire,
    arena: &'a mut SendArena,
}

impl FrameSink for WireSink<'_> {
    fn start_text(&mut self) -> &mut Vec<u8> {
        self.arena.start()
    }

    fn finish_text(&mut self) -> io::Result<()> {
        let framed = frame::finish_frame(Opcode::Text, &mut self.arena.buf);
        self.wire.send(framed)?;
        self.arena.reset();
        Ok(())
    }
}

/// One connection's state machine.
pub struct Client {
    wire: Wire,
    mode: Mode,
    reader: FrameReader,
    arena: SendArena,
    json_version: Vec<u8>,
}

impl Client {
    /// Wrap an accepted socket. The socket is switched to non-blocking
    /// mode; `json_version` is the precomputed `/json/version` response.
    ///
    /// # Errors
    ///
    /// Fails on socket configuration errors or if the reader's initial
    /// buffer cannot be charged to the budget.
    pub fn new(
        stream: TcpStream,
        budget: Rc<MemBudget>,
        max_message_size: usize,
        json_version: Vec<u8>,
    ) -> Result<Self, SessionError> {
        stream.set_nonblocking(true)?;
        let reader = FrameReader::server(budget, max_message_size)?;
        Ok(Self {
            wire: Wire {
                stream,
                nonblocking: true,
            },
            mode: Mode::Http,
            reader,
            arena: SendArena::new(),
            json_version,
        })
    }

    /// Whether the connection has upgraded to the protocol phase.
    #[must_use]
    pub fn is_cdp(&self) -> bool {
        matches!(self.mode, Mode::Cdp(_))
    }

    /// The underlying socket (for readiness registration and interrupt).
    #[must_use]
    pub fn stream(&self) -> &TcpStream {
        &self.wire.stream
    }

    /// One non-blocking read into the reader's spare tail.
    ///
    /// # Errors
    ///
    /// Propagates socket errors and budget exhaustion while making room.
    pub fn read_socket(&mut self) -> Result<ReadOutcome, SessionError> {
        self.reader.ensure_spare(READ_CHUNK)?;
        match self.wire.stream.read(self.reader.spare_mut()) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => {
                self.reader.extend_filled(n);
                Ok(ReadOutcome::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the dispatcher how long it can sleep. Pre-upgrade there is no
    /// dispatcher, which the session loop treats as "no page work".
    pub fn page_wait(&mut self, timeout_ms: u64) -> crate::cdp::PageWait {
        match &mut self.mode {
            Mode::Http => crate::cdp::PageWait::NoPage,
            Mode::Cdp(dispatcher) => dispatcher.page_wait(timeout_ms),
        }
    }

    /// Drain whatever is complete in the reader.
    ///
    /// # Errors
    ///
    /// Upgrade and framing errors have already been answered on the wire
    /// (fixed 4xx body, best-effort close frame) when this returns them.
    pub fn process(&mut self, factory: &dyn DispatcherFactory) -> Result<Flow, SessionError> {
        match self.mode {
            Mode::Http => self.process_http(factory),
            Mode::Cdp(_) => self.process_cdp(),
        }
    }

    fn process_http(&mut self, factory: &dyn DispatcherFactory) -> Result<Flow, SessionError> {
        let parsed = {
            let head = self.reader.readable();
            match find_double_crlf(head) {
                None if head.len() >= MAX_REQUEST_SIZE => {
                    Some((Err(UpgradeError::RequestTooLarge), head.len()))
                }
                None => None,
                Some(end) => {
                    let head_len = end + 4;
                    if head_len > MAX_REQUEST_SIZE {
                        Some((Err(UpgradeError::RequestTooLarge), head_len))
                    } else {
                        Some((handshake::parse_request(&head[..head_len]), head_len))
                    }
                }
            }
        };
        let Some((action, head_len)) = parsed else {
            return Ok(Flow::Continue);
        };

        match action {
            Ok(HttpAction::Upgrade(response)) => {
                self.reader.consume(head_len);
                self.reader.compact();
                self.wire.send(&response)?;
                self.mode = Mode::Cdp(factory.create());
                tracing::info!("connection upgraded to websocket");
                Ok(Flow::Upgraded)
            }
            Ok(HttpAction::ServeJsonVersion) => {
                self.reader.consume(head_len);
                self.wire.send(&self.json_version)?;
                // Drivers probe this endpoint on a throwaway connection;
                // half-closing our read side ends it promptly instead of
                // letting it idle out. Full close where half-close is
                // unsupported.
                #[cfg(unix)]
                self.wire.stream.shutdown(Shutdown::Read)?;
                #[cfg(not(unix))]
                self.wire.stream.shutdown(Shutdown::Both)?;
                tracing::debug!("served /json/version, read side closed");
                Ok(Flow::Continue)
            }
            Err(err) => {
                let _ = self.wire.send(&err.response());
                Err(err.into())
            }
        }
    }

    /// Answer an unexpected pre-upgrade failure with a generic 500 and
    /// log a truncated snippet of the buffered request.
    pub fn http_internal_error(&mut self) {
        let head = self.reader.readable();
        let snippet = String::from_utf8_lossy(&head[..head.len().min(128)]).into_owned();
        tracing::error!(request = %snippet, "internal error while serving http request");
        let _ = self.wire.send(&handshake::internal_error_response());
    }

    fn process_cdp(&mut self) -> Result<Flow, SessionError> {
        let Self {
            wire,
            mode,
            reader,
            arena,
            ..
        } = self;
        let Mode::Cdp(dispatcher) = mode else {
            unreachable!("process_cdp called before upgrade");
        };

        loop {
            match reader.next() {
                Ok(Some(msg)) => match msg.kind {
                    MessageKind::Text | MessageKind::Binary => {
                        let mut sink = WireSink {
                            wire: &mut *wire,
                            arena: &mut *arena,
                        };
                        if !dispatcher.handle_message(msg.payload, &mut sink)? {
                            let _ = wire.send(&frame::close_frame(CloseCode::Normal));
                            return Ok(Flow::Closed);
                        }
                    }
                    MessageKind::Ping => {
                        let pong = frame::encode_frame(Opcode::Pong, true, None, msg.payload);
                        wire.send(&pong)?;
                    }
                    MessageKind::Pong => {}
                    MessageKind::Close => {
                        let _ = wire.send(&frame::close_frame(CloseCode::Normal));
                        return Ok(Flow::Closed);
                    }
                },
                Ok(None) => {
                    reader.compact();
                    return Ok(Flow::Continue);
                }
                Err(err) => {
                    if let Some(code) = err.close_code() {
                        let _ = wire.send(&frame::close_frame(code));
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

impl ConnHooks for Client {
    fn enter_blocking_read(&mut self) -> io::Result<()> {
        self.wire.set_nonblocking(false)
    }

    fn blocking_read_once(&mut self) -> io::Result<usize> {
        self.reader
            .ensure_spare(READ_CHUNK)
            .map_err(io::Error::other)?;
        let n = self.wire.stream.read(self.reader.spare_mut())?;
        self.reader.extend_filled(n);
        Ok(n)
    }

    fn exit_blocking_read(&mut self) -> io::Result<()> {
        self.wire.set_nonblocking(true)
    }
}

fn find_double_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}
