//! WebSocket protocol implementation (RFC 6455).
//!
//! - `frame`: wire format, opcodes, close codes, header encoding
//! - `mask`: XOR payload masking with a wide-chunk fast path
//! - `reader`: stateful incremental message decoder
//! - `handshake`: HTTP upgrade negotiation and the plain-HTTP routes
//!
//! No extensions are supported; the reserved header bits must be zero.
//! The server side always expects masked inbound frames and sends
//! unmasked ones; the inverse roles exist for the in-crate test client.

pub mod frame;
pub mod handshake;
pub mod mask;
pub mod reader;

pub use frame::{close_frame, encode_frame, finish_frame, CloseCode, FrameError, Opcode};
pub use handshake::{compute_accept_token, UpgradeError};
pub use mask::apply_mask;
pub use reader::{FrameReader, MessageKind, WsMessage};
