//! File-transfer helper hosted by the container process.
//!
//! Accepts line-oriented requests `<source> <destination>` over TCP and
//! places the source file at the destination, hard-linking when possible.
//! Each request gets one reply line: `OK` or the error text. Transfers are
//! serialized.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use docwsd_protocol::tokenize;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::pool::jail::{Placement, link_or_copy_file};

/// Serve transfer requests until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let serial = Arc::new(Mutex::new(()));
    info!("File transfer helper listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        debug!("Transfer connection from {}", peer);
        let serial = Arc::clone(&serial);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, serial).await {
                warn!("Transfer connection from {} failed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, serial: Arc<Mutex<()>>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = {
            let _turn = serial.lock().await;
            let request = line.clone();
            tokio::task::spawn_blocking(move || transfer(&request)).await?
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

/// Execute one `<source> <destination>` request and return the reply line.
pub fn transfer(request: &str) -> String {
    let tokens = tokenize(request);
    let [source, destination] = tokens.as_slice() else {
        return format!("Source and destination are needed: {request}");
    };
    let source = Path::new(source);
    let destination = Path::new(destination);

    if let Some(parent) = destination.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!("Failed to create {}: {}", parent.display(), e);
        return e.to_string();
    }

    match link_or_copy_file(source, destination) {
        Ok(Placement::Linked) => {
            debug!("Linked {} to {}", source.display(), destination.display());
            "OK".to_string()
        }
        Ok(Placement::Copied) => {
            debug!("Copied {} to {}", source.display(), destination.display());
            "OK".to_string()
        }
        Err(e) => {
            warn!(
                "Transfer of {} to {} failed: {}",
                source.display(),
                destination.display(),
                e
            );
            e.to_string()
        }
    }
}
