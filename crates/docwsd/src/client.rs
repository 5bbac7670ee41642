//! Interactive test client.
//!
//! Sends every stdin line as a text frame and prints what comes back.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use docwsd_protocol::{ControlLine, abbreviate};
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Default address of a local server.
pub fn default_url() -> String {
    format!("ws://127.0.0.1:{}/ws", docwsd_protocol::DEFAULT_CLIENT_PORT)
}

/// Run until stdin reaches EOF or the server hangs up.
pub async fn run(url: &str) -> Result<()> {
    let (socket, _) = connect_async(url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    let (mut sink, mut frames) = socket.split();

    let printer = tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Message::Text(text)) => println!("{}", describe(text.as_str().as_bytes())),
                Ok(Message::Binary(data)) => println!("{}", describe(&data)),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("read failed: {}", e);
                    break;
                }
            }
        }
    });

    let interactive = std::io::stdin().is_terminal();
    if interactive {
        eprintln!("Enter requests, one per line. End with EOF.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if printer.is_finished() {
            break;
        }
        if let Err(e) = sink.send(Message::Text(line.into())).await {
            debug!("send failed: {}", e);
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = printer.await;
    Ok(())
}

/// One-line rendering of a received frame.
pub fn describe(frame: &[u8]) -> String {
    let first = String::from_utf8_lossy(docwsd_protocol::first_line(frame));
    match ControlLine::parse(&first) {
        Some(ControlLine::NextMessage { size }) => format!("Got announcement of {size} bytes"),
        _ => format!("Got {} bytes: {}", frame.len(), abbreviate(frame)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_frames() {
        assert_eq!(describe(b"status: ok"), "Got 10 bytes: status: ok");
        assert_eq!(
            describe(b"tile: part=0\n\x89PNG"),
            "Got 17 bytes: tile: part=0..."
        );
        assert_eq!(
            describe(b"nextmessage: size=200000"),
            "Got announcement of 200000 bytes"
        );
    }

    #[test]
    fn test_default_url() {
        assert_eq!(default_url(), "ws://127.0.0.1:9980/ws");
    }
}
