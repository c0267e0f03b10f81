//! The remote-debugging protocol seam.
//!
//! The session engine decodes WebSocket messages and hands the payload
//! bytes to a [`Dispatcher`]; what the JSON means — commands, sessions,
//! page lifecycles — is entirely the dispatcher's business. The engine
//! only needs two things from it: whether to keep the connection alive
//! after a message, and how long it can sleep before the dispatcher has
//! page work again.
//!
//! Replies flow back through a [`FrameSink`]: the dispatcher serializes
//! into a scratch buffer whose frame-header area is already reserved, so
//! the payload is framed and written without a second copy.

use std::io;

/// Outcome of [`Dispatcher::page_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageWait {
    /// The raw control socket became readable.
    SocketReady,
    /// No page work is pending; the caller should poll the outbound HTTP
    /// client instead.
    NoPage,
    /// The dispatcher is idle for now; the caller accounts the elapsed
    /// time against the inactivity timeout.
    Done,
}

/// Where a dispatcher writes its replies.
///
/// `start_text` returns the scratch buffer with the frame-header area
/// already reserved; append payload bytes after it and call
/// `finish_text`, which back-fills the real header and writes the frame.
pub trait FrameSink {
    /// Begin building a text reply.
    fn start_text(&mut self) -> &mut Vec<u8>;

    /// Frame and flush the payload built since [`Self::start_text`].
    ///
    /// # Errors
    ///
    /// Propagates socket write errors.
    fn finish_text(&mut self) -> io::Result<()>;

    /// Serialize a JSON value as one text reply.
    ///
    /// # Errors
    ///
    /// Propagates serialization and socket write errors.
    fn send_json(&mut self, value: &serde_json::Value) -> io::Result<()> {
        let buf = self.start_text();
        serde_json::to_writer(&mut *buf, value).map_err(io::Error::other)?;
        self.finish_text()
    }
}

/// Interprets decoded protocol messages and drives the page.
pub trait Dispatcher {
    /// Handle one decoded message. Returns `false` to end the session.
    ///
    /// # Errors
    ///
    /// Propagates reply write errors; any error ends the session.
    fn handle_message(&mut self, msg: &[u8], sink: &mut dyn FrameSink) -> io::Result<bool>;

    /// How long until the dispatcher has nothing else to do, bounded by
    /// `timeout_ms`.
    fn page_wait(&mut self, timeout_ms: u64) -> PageWait;
}

/// Creates one dispatcher per upgraded connection.
pub trait DispatcherFactory: Send + Sync {
    /// Build the dispatcher instance owned by a newly upgraded client.
    fn create(&self) -> Box<dyn Dispatcher>;
}

/// Dispatcher that acknowledges nothing and never has page work.
///
/// Used by the standalone binary until a browser backend is wired in, and
/// by tests that only exercise the connection machinery.
#[derive(Debug, Default)]
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn handle_message(&mut self, msg: &[u8], _sink: &mut dyn FrameSink) -> io::Result<bool> {
        tracing::debug!(len = msg.len(), "discarding protocol message");
        Ok(true)
    }

    fn page_wait(&mut self, _timeout_ms: u64) -> PageWait {
        PageWait::NoPage
    }
}

/// Factory for [`NullDispatcher`].
#[derive(Debug, Default)]
pub struct NullDispatcherFactory;

impl DispatcherFactory for NullDispatcherFactory {
    fn create(&self) -> Box<dyn Dispatcher> {
        Box::new(NullDispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink {
        buf: Vec<u8>,
        flushed: Vec<Vec<u8>>,
    }

    impl FrameSink for VecSink {
        fn start_text(&mut self) -> &mut Vec<u8> {
            self.buf.clear();
            self.buf.resize(crate::ws::frame::HEADER_RESERVE, 0);
            &mut self.buf
        }

        fn finish_text(&mut self) -> io::Result<()> {
            self.flushed
                .push(self.buf[crate::ws::frame::HEADER_RESERVE..].to_vec());
            Ok(())
        }
    }

    #[test]
    fn send_json_serializes_after_reserved_header() {
        let mut sink = VecSink {
            buf: Vec::new(),
            flushed: Vec::new(),
        };
        sink.send_json(&serde_json::json!({"id": 1})).unwrap();
        assert_eq!(sink.flushed.len(), 1);
        let parsed: serde_json::Value = serde_json::from_slice(&sink.flushed[0]).unwrap();
        assert_eq!(parsed["id"], 1);
    }

    #[test]
    fn null_dispatcher_keeps_reading() {
        let mut dispatcher = NullDispatcher;
        let mut sink = VecSink {
            buf: Vec::new(),
            flushed: Vec::new(),
        };
        assert!(dispatcher.handle_message(b"{}", &mut sink).unwrap());
        assert!(sink.flushed.is_empty());
        assert_eq!(dispatcher.page_wait(100), PageWait::NoPage);
    }
}
