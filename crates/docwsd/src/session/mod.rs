//! Sessions: the per-connection message handlers behind the relay.
//!
//! Every WebSocket accepted by the relay is bound to one session. The session
//! kind is derived from the request path and the listener the connection
//! arrived on, which lets a single relay implementation serve both the
//! client-facing and the worker-facing listener.

mod master;

pub use master::{MasterSession, MasterSessions};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use docwsd_protocol::{CHILD_URI, ControlLine, LARGE_MESSAGE_THRESHOLD};
use tokio::sync::mpsc;

/// Which side of the relay a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// An external client editing a document.
    ToClient,
    /// A worker process on the internal control channel.
    ToWorker,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToClient => f.write_str("client"),
            Self::ToWorker => f.write_str("worker"),
        }
    }
}

/// Classify a connection.
///
/// Only the reserved worker path on the worker listener yields
/// [`SessionKind::ToWorker`]; any other combination is a client. Evaluated for
/// every request.
pub fn resolve_kind(path: &str, local_port: u16, worker_port: u16) -> SessionKind {
    if path == CHILD_URI && local_port == worker_port {
        SessionKind::ToWorker
    } else {
        SessionKind::ToClient
    }
}

/// Consumer of inbound messages for one session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Handle one message. Returning `false` ends the session.
    async fn handle_input(&self, payload: &[u8]) -> bool;

    /// Called once after the connection's read loop has ended.
    async fn disconnected(&self) {}
}

/// Builds the session for a freshly upgraded connection.
pub trait SessionFactory: Send + Sync {
    fn create(&self, kind: SessionKind, outbox: Outbox) -> Arc<dyn SessionHandler>;
}

/// Sending half of a connection.
///
/// Frames pushed here are written to the socket by the connection's writer
/// task, so any session may hold a clone and talk to its peer.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbox {
    /// Create an outbox and the receiver its writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a text frame. Returns `false` once the connection is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(Message::Text(text.into().into())).is_ok()
    }

    /// Queue a payload received from the other side of the relay.
    ///
    /// Payloads above [`LARGE_MESSAGE_THRESHOLD`] are announced with a
    /// `nextmessage:` line so the receiver can size its read.
    pub fn send_payload(&self, payload: &[u8]) -> bool {
        if payload.len() > LARGE_MESSAGE_THRESHOLD {
            let header = ControlLine::NextMessage {
                size: payload.len(),
            };
            if !self.send_text(header.to_string()) {
                return false;
            }
            return self
                .tx
                .send(Message::Binary(Bytes::copy_from_slice(payload)))
                .is_ok();
        }

        match std::str::from_utf8(payload) {
            Ok(text) => self.send_text(text),
            Err(_) => self
                .tx
                .send(Message::Binary(Bytes::copy_from_slice(payload)))
                .is_ok(),
        }
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close(&self) -> bool {
        self.tx.send(Message::Close(None)).is_ok()
    }

    /// Whether the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
