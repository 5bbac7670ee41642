//! Control vocabulary for the docwsd relay.
//!
//! Editing traffic between clients, the master process and the workers is a
//! line-oriented text protocol whose verbs belong to the render engine. The
//! relay treats almost all of it as opaque payload. This crate holds the small
//! part it must understand:
//!
//! ```text
//! Client <--[WS, client port]--> Master relay <--[WS, loopback worker port]--> Worker
//!            canceltiles                         child <workerId>
//!                                                nextmessage: size=<N>
//! ```
//!
//! Everything here is pure string handling so both sides of the control
//! channel can share it without pulling in the server stack.

pub mod control;
pub mod lines;

pub use control::{ControlLine, ProtocolError, is_uncorrelated_tile_request};
pub use lines::{abbreviate, first_line, token_integer, tokenize};

/// Request path a worker uses to reach the master's control listener.
pub const CHILD_URI: &str = "/docws/child/";

/// Default port for external client connections.
pub const DEFAULT_CLIENT_PORT: u16 = 9980;

/// Default loopback port for worker control connections.
pub const DEFAULT_WORKER_PORT: u16 = 9981;

/// Default loopback port for the file-transfer helper.
pub const DEFAULT_TRANSFER_PORT: u16 = 9979;

/// Payloads larger than this are announced with a `nextmessage:` line first.
pub const LARGE_MESSAGE_THRESHOLD: usize = 100_000;

/// WebSocket protocol version spoken by the relay (RFC 6455).
pub const WEBSOCKET_VERSION: &str = "13";
