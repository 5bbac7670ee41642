//! Worker process: jail setup and the control-channel loop.
//!
//! Startup is split in two. [`prepare`] runs on the main thread before the
//! async runtime exists, because capabilities are per thread and must be gone
//! before any other thread is created. [`run`] then dials the server's worker
//! listener, announces itself, and feeds incoming commands to the engine
//! through a queue so `canceltiles` can discard pending tile work.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use docwsd_protocol::{
    CHILD_URI, ControlLine, LARGE_MESSAGE_THRESHOLD, abbreviate, first_line,
    is_uncorrelated_tile_request, tokenize,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::engine::{EngineReply, RenderEngine};
use crate::pool::jail::{self, JailSpec};
use crate::pool::lock::NamedLock;
use crate::pool::privilege::{DebugIdentity, platform_controller};
use crate::pump::QueuePump;
use crate::queue::MessageQueue;
use crate::session::SessionHandler;

/// Environment variable naming a number of seconds to pause at startup.
pub const SLEEP_FOR_DEBUGGER_ENV: &str = "DOCWSD_SLEEP_FOR_DEBUGGER";

/// Everything a worker needs from its command line.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: u64,
    pub worker_port: u16,
    pub lock_file: Option<PathBuf>,
    /// `None` runs without a jail.
    pub jail: Option<JailSpec>,
    pub debug: DebugIdentity,
    /// How long to keep retrying the connection to the server.
    pub connect_timeout: Duration,
}

/// Build and enter the jail, then wait for the server to finish starting.
///
/// Must run before any other thread exists.
pub fn prepare(options: &WorkerOptions) -> Result<()> {
    // Opened first: the lock file is outside the jail.
    let lock = options
        .lock_file
        .as_ref()
        .map(NamedLock::open)
        .transpose()?;

    match &options.jail {
        Some(spec) => {
            let jail = spec.build(options.worker_id)?;
            let controller = platform_controller(options.debug);
            jail::enter(&jail.root, controller.as_ref())?;
        }
        None => info!("Worker {} running without a jail", options.worker_id),
    }

    sleep_for_debugger();

    if let Some(lock) = lock {
        lock.wait_released()?;
    }
    Ok(())
}

fn sleep_for_debugger() {
    let Some(seconds) = std::env::var(SLEEP_FOR_DEBUGGER_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|s| *s > 0)
    else {
        return;
    };
    info!(
        "Sleeping {} seconds, attach process {} in debugger now",
        seconds,
        std::process::id()
    );
    std::thread::sleep(Duration::from_secs(seconds));
}

/// Serve the control channel until the server closes it.
pub async fn run(options: &WorkerOptions, engine: Box<dyn RenderEngine>) -> Result<()> {
    let url = format!("ws://127.0.0.1:{}{}", options.worker_port, CHILD_URI);
    let socket = connect_with_retry(&url, options.connect_timeout).await?;
    info!("Worker {} connected to {}", options.worker_id, url);

    let (mut sink, mut frames) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!("Failed to write frame: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let greeting = ControlLine::Greeting {
        worker_id: options.worker_id,
    };
    tx.send(Message::Text(greeting.to_string().into()))
        .context("sending greeting")?;

    let session = Arc::new(WorkerSession::new(engine, tx.clone()));
    let queue = Arc::new(MessageQueue::new());
    let pump = QueuePump::start(Arc::clone(&queue), session.clone());

    let mut announced: Option<usize> = None;
    while let Some(frame) = frames.next().await {
        let mut payload = match frame {
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Control channel read failed: {}", e);
                break;
            }
        };
        if payload.is_empty() {
            break;
        }

        if let Some(size) = announced.take() {
            payload.truncate(size);
            queue.put(String::from_utf8_lossy(&payload).into_owned());
            continue;
        }

        let line = String::from_utf8_lossy(first_line(&payload)).into_owned();
        match ControlLine::parse(&line) {
            Some(ControlLine::CancelTiles) => {
                let removed = queue.remove_if(is_uncorrelated_tile_request);
                debug!("canceltiles dropped {} queued tile requests", removed);
                session.cancel_tiles();
            }
            Some(ControlLine::NextMessage { size }) => announced = Some(size),
            _ => queue.put(String::from_utf8_lossy(&payload).into_owned()),
        }
    }

    queue.close();
    pump.join().await;
    let _ = tx.send(Message::Close(None));
    drop(tx);
    drop(session);
    if tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .is_err()
    {
        debug!("Writer did not finish in time");
    }
    info!("Worker {} finished", options.worker_id);
    Ok(())
}

async fn connect_with_retry(
    url: &str,
    timeout: Duration,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let start = tokio::time::Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match connect_async(url).await {
            Ok((socket, _)) => return Ok(socket),
            Err(err) => {
                if start.elapsed() >= timeout {
                    return Err(anyhow::anyhow!(
                        "server not reachable at {} after {} attempts over {:?}: {}",
                        url,
                        attempts,
                        timeout,
                        err
                    ));
                }
                let backoff = Duration::from_millis(u64::from(attempts.min(20)) * 100);
                debug!(
                    "server not ready yet (attempt {}): {}; retrying in {:?}",
                    attempts, err, backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Bridges queued commands to the engine and sends back its replies.
pub struct WorkerSession {
    engine: Mutex<Box<dyn RenderEngine>>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl WorkerSession {
    pub fn new(engine: Box<dyn RenderEngine>, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            engine: Mutex::new(engine),
            outbound,
        }
    }

    /// Only notifies the engine; the queue was already filtered.
    pub fn cancel_tiles(&self) {
        self.engine().cancel_tiles();
    }

    fn engine(&self) -> MutexGuard<'_, Box<dyn RenderEngine>> {
        self.engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, reply: EngineReply) -> bool {
        if reply.len() > LARGE_MESSAGE_THRESHOLD {
            let header = ControlLine::NextMessage { size: reply.len() };
            if self
                .outbound
                .send(Message::Text(header.to_string().into()))
                .is_err()
            {
                return false;
            }
        }
        let message = match reply {
            EngineReply::Text(text) => Message::Text(text.into()),
            EngineReply::Binary(data) => Message::Binary(data.into()),
        };
        self.outbound.send(message).is_ok()
    }
}

#[async_trait]
impl SessionHandler for WorkerSession {
    async fn handle_input(&self, payload: &[u8]) -> bool {
        let replies = match self.engine().handle(payload) {
            Ok(replies) => replies,
            Err(e) => {
                warn!("Engine failed on {}: {}", abbreviate(payload), e);
                let command = String::from_utf8_lossy(first_line(payload));
                let verb = tokenize(&command).first().copied().unwrap_or_default();
                vec![EngineReply::Text(format!("error: cmd={verb} kind=engine"))]
            }
        };
        replies.into_iter().all(|reply| self.send(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;

    struct BigEngine;

    impl RenderEngine for BigEngine {
        fn handle(&mut self, message: &[u8]) -> Result<Vec<EngineReply>> {
            match message {
                b"fail" => anyhow::bail!("boom"),
                _ => Ok(vec![EngineReply::Binary(vec![0; LARGE_MESSAGE_THRESHOLD + 5])]),
            }
        }
    }

    #[tokio::test]
    async fn test_session_answers_through_engine() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = WorkerSession::new(Box::new(LoopbackEngine::new()), tx);

        assert!(session.handle_input(b"load url=file:///a.odt").await);
        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t.as_str() == "load: ok"));

        assert!(session.handle_input(b"tile part=0").await);
        assert!(matches!(rx.recv().await, Some(Message::Binary(b)) if b.starts_with(b"tile: part=0\n")));
    }

    /// Keeps every message it is given.
    #[derive(Clone, Default)]
    struct CapturingEngine(Arc<Mutex<Vec<Vec<u8>>>>);

    impl RenderEngine for CapturingEngine {
        fn handle(&mut self, message: &[u8]) -> Result<Vec<EngineReply>> {
            self.0.lock().unwrap().push(message.to_vec());
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_engine_gets_whole_multiline_payload() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = CapturingEngine::default();
        let session = WorkerSession::new(Box::new(engine.clone()), tx);

        let payload = b"paste mimetype=text/plain\nfirst\nsecond\xff";
        assert!(session.handle_input(payload).await);

        assert_eq!(*engine.0.lock().unwrap(), vec![payload.to_vec()]);
    }

    #[tokio::test]
    async fn test_large_reply_is_announced() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = WorkerSession::new(Box::new(BigEngine), tx);

        assert!(session.handle_input(b"tile part=0").await);

        let expected = format!("nextmessage: size={}", LARGE_MESSAGE_THRESHOLD + 5);
        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t.as_str() == expected));
        assert!(matches!(rx.recv().await, Some(Message::Binary(b)) if b.len() == LARGE_MESSAGE_THRESHOLD + 5));
    }

    #[tokio::test]
    async fn test_engine_error_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = WorkerSession::new(Box::new(BigEngine), tx);

        assert!(session.handle_input(b"fail").await);
        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t.as_str() == "error: cmd=fail kind=engine"));
    }

    #[tokio::test]
    async fn test_session_stops_when_connection_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let session = WorkerSession::new(Box::new(LoopbackEngine::new()), tx);
        assert!(!session.handle_input(b"status").await);
    }

    #[test]
    fn test_prepare_without_jail() {
        let tmp = tempfile::TempDir::new().unwrap();
        let options = WorkerOptions {
            worker_id: 3,
            worker_port: 1,
            lock_file: Some(tmp.path().join("docwsd.lock")),
            jail: None,
            debug: DebugIdentity::default(),
            connect_timeout: Duration::from_millis(10),
        };
        prepare(&options).unwrap();
    }

    #[tokio::test]
    async fn test_run_gives_up_without_server() {
        let options = WorkerOptions {
            worker_id: 3,
            worker_port: 1,
            lock_file: None,
            jail: None,
            debug: DebugIdentity::default(),
            connect_timeout: Duration::from_millis(10),
        };
        assert!(run(&options, Box::new(LoopbackEngine::new())).await.is_err());
    }
}
