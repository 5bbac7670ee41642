//! Control lines interpreted by the relay itself.

use std::fmt;

use thiserror::Error;

use crate::lines::{token_integer, tokenize};

/// Errors raised while decoding control lines.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The first message of a worker connection was not `child <workerId>`.
    #[error("invalid worker greeting: {0:?}")]
    InvalidGreeting(String),
}

/// A line with meaning to the relay rather than to the render engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    /// `canceltiles`: drop pending tile requests.
    CancelTiles,
    /// `nextmessage: size=<N>`: the next frame carries the real payload.
    NextMessage { size: usize },
    /// `child <workerId>`: a freshly started worker announcing itself.
    Greeting { worker_id: u64 },
}

impl ControlLine {
    /// Recognise a control line. Any other line is engine payload.
    pub fn parse(line: &str) -> Option<Self> {
        match tokenize(line).as_slice() {
            ["canceltiles"] => Some(Self::CancelTiles),
            ["nextmessage:", size] => {
                let size = token_integer(size, "size")?;
                if size > 0 {
                    usize::try_from(size)
                        .ok()
                        .map(|size| Self::NextMessage { size })
                } else {
                    None
                }
            }
            ["child", id] => id
                .parse::<u64>()
                .ok()
                .filter(|id| *id != 0)
                .map(|worker_id| Self::Greeting { worker_id }),
            _ => None,
        }
    }

    /// Decode the greeting a worker must send first.
    pub fn parse_greeting(line: &str) -> Result<u64, ProtocolError> {
        match Self::parse(line) {
            Some(Self::Greeting { worker_id }) => Ok(worker_id),
            _ => Err(ProtocolError::InvalidGreeting(line.to_string())),
        }
    }
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CancelTiles => f.write_str("canceltiles"),
            Self::NextMessage { size } => write!(f, "nextmessage: size={size}"),
            Self::Greeting { worker_id } => write!(f, "child {worker_id}"),
        }
    }
}

/// Whether a queued message is a tile request the client cannot correlate.
///
/// Requests carrying an `id=` were tagged by the client, which expects an
/// answer, so `canceltiles` leaves them alone.
pub fn is_uncorrelated_tile_request(message: &str) -> bool {
    message.starts_with("tile ") && !message.contains("id=")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canceltiles() {
        assert_eq!(
            ControlLine::parse("canceltiles"),
            Some(ControlLine::CancelTiles)
        );
        assert_eq!(
            ControlLine::parse("  canceltiles "),
            Some(ControlLine::CancelTiles)
        );
        assert_eq!(ControlLine::parse("canceltiles now"), None);
        assert_eq!(ControlLine::parse("canceltile"), None);
    }

    #[test]
    fn test_parse_nextmessage() {
        assert_eq!(
            ControlLine::parse("nextmessage: size=10"),
            Some(ControlLine::NextMessage { size: 10 })
        );
        assert_eq!(ControlLine::parse("nextmessage: size=0"), None);
        assert_eq!(ControlLine::parse("nextmessage: size=-5"), None);
        assert_eq!(ControlLine::parse("nextmessage: length=10"), None);
        assert_eq!(ControlLine::parse("nextmessage:"), None);
        assert_eq!(ControlLine::parse("nextmessage size=10"), None);
    }

    #[test]
    fn test_parse_greeting() {
        assert_eq!(ControlLine::parse_greeting("child 42"), Ok(42));
        assert_eq!(
            ControlLine::parse_greeting("child 0"),
            Err(ProtocolError::InvalidGreeting("child 0".to_string()))
        );
        assert!(ControlLine::parse_greeting("child abc").is_err());
        assert!(ControlLine::parse_greeting("load url=x").is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for line in [
            ControlLine::CancelTiles,
            ControlLine::NextMessage { size: 123_456 },
            ControlLine::Greeting {
                worker_id: u64::MAX,
            },
        ] {
            assert_eq!(ControlLine::parse(&line.to_string()), Some(line));
        }
    }

    #[test]
    fn test_uncorrelated_tile_request() {
        assert!(is_uncorrelated_tile_request("tile part=1"));
        assert!(!is_uncorrelated_tile_request("tile id=5 part=2"));
        assert!(!is_uncorrelated_tile_request("save"));
        assert!(!is_uncorrelated_tile_request("tilecombine part=1"));
        assert!(!is_uncorrelated_tile_request("tile"));
    }
}
