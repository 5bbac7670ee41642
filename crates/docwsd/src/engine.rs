//! Render engine seam.
//!
//! Workers host a [`RenderEngine`] that turns client commands into replies.
//! The bundled [`LoopbackEngine`] answers every command without rendering
//! anything, which is enough to run and test the relay end to end.

use anyhow::Result;
use docwsd_protocol::{first_line, tokenize};

/// A reply produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineReply {
    Text(String),
    Binary(Vec<u8>),
}

impl EngineReply {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Document engine hosted by a worker.
pub trait RenderEngine: Send {
    /// Execute one message.
    ///
    /// `message` is the whole payload: a command line, optionally followed by
    /// a newline and a body (pasted content, say), which may be binary.
    fn handle(&mut self, message: &[u8]) -> Result<Vec<EngineReply>>;

    /// Pending tile work should be abandoned.
    fn cancel_tiles(&mut self) {}
}

/// Echoing engine.
///
/// `tile` requests are answered with a binary frame whose first line echoes
/// the request. `status` reports the engine. Anything else is acknowledged
/// with `<verb>: ok`, plus `bytes=<n>` when a body followed the command line.
#[derive(Debug, Default)]
pub struct LoopbackEngine {
    handled: u64,
    cancelled: u64,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled(&self) -> u64 {
        self.handled
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled
    }
}

impl RenderEngine for LoopbackEngine {
    fn handle(&mut self, message: &[u8]) -> Result<Vec<EngineReply>> {
        let line = first_line(message);
        let body = message.get(line.len() + 1..).unwrap_or_default();
        let command = String::from_utf8_lossy(line);
        let tokens = tokenize(&command);
        let Some((verb, args)) = tokens.split_first() else {
            return Ok(Vec::new());
        };
        self.handled += 1;

        let reply = match *verb {
            "tile" => {
                let mut frame = format!("tile: {}\n", args.join(" ")).into_bytes();
                frame.extend_from_slice(&[0x89, b'P', b'N', b'G']);
                EngineReply::Binary(frame)
            }
            "status" => EngineReply::Text(format!(
                "status: type=loopback handled={} cancelled={}",
                self.handled, self.cancelled
            )),
            verb if body.is_empty() => EngineReply::Text(format!("{verb}: ok")),
            verb => EngineReply::Text(format!("{verb}: ok bytes={}", body.len())),
        };
        Ok(vec![reply])
    }

    fn cancel_tiles(&mut self) {
        self.cancelled += 1;
    }
}
