//! The WebSocket relay endpoint.
//!
//! Every request on either listener lands here. The handshake is validated,
//! the session kind is resolved from the path and the listener's port, and
//! the upgraded connection is served by a [`RelayEndpoint`]. Client
//! connections get a queue and a pump so `canceltiles` can discard tile
//! requests that are still waiting.

pub mod handshake;

pub use handshake::HandshakeError;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, Method, Uri, Version};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use docwsd_protocol::{ControlLine, abbreviate, first_line, is_uncorrelated_tile_request};
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::pump::QueuePump;
use crate::queue::MessageQueue;
use crate::session::{Outbox, SessionFactory, SessionHandler, SessionKind, resolve_kind};

/// How long teardown waits for queued outbound frames to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-listener relay configuration.
#[derive(Clone)]
pub struct RelayState {
    local_port: u16,
    worker_port: u16,
    sessions: Arc<dyn SessionFactory>,
}

impl RelayState {
    pub fn new(local_port: u16, worker_port: u16, sessions: Arc<dyn SessionFactory>) -> Self {
        Self {
            local_port,
            worker_port,
            sessions,
        }
    }
}

/// Router for one listener. Every path is handled by the relay.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_request(
    State(state): State<RelayState>,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    info!(
        "Request on port {}: {} {} {:?}",
        state.local_port, method, uri, version
    );
    for (name, value) in &headers {
        info!("  {}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }

    if let Err(e) = handshake::verify(&headers) {
        warn!("Rejecting {}: {}", uri, e);
        return e.into_response();
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!("Rejecting {}: {}", uri, rejection);
            return rejection.into_response();
        }
    };

    let kind = session_kind(&uri, state.local_port, state.worker_port);
    debug!("{} session on {}", kind, uri);
    let sessions = Arc::clone(&state.sessions);
    upgrade
        .on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| serve_connection(socket, kind, sessions))
}

/// Classify a request by its full target, query included, so
/// `/docws/child/?x` is never taken for the worker path.
fn session_kind(uri: &Uri, local_port: u16, worker_port: u16) -> SessionKind {
    let target = uri.path_and_query().map_or(uri.path(), |p| p.as_str());
    resolve_kind(target, local_port, worker_port)
}

/// Serve one upgraded connection until either side ends it.
pub async fn serve_connection(socket: WebSocket, kind: SessionKind, sessions: Arc<dyn SessionFactory>) {
    let (sink, frames) = socket.split();
    let (outbox, outbound) = Outbox::channel();
    let mut writer = tokio::spawn(write_frames(sink, outbound));

    let session = sessions.create(kind, outbox.clone());
    let exit = RelayEndpoint::new(kind, Arc::clone(&session)).run(frames).await;
    debug!("{} connection finished: {:?}", kind, exit);

    session.disconnected().await;
    outbox.close();
    drop(outbox);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!("Writer did not drain in time, aborting");
        writer.abort();
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
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
}

/// Why a connection's read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The peer closed, or sent an empty frame.
    Closed,
    /// Reading from the socket failed.
    Failed,
    /// The session handler asked to stop.
    Rejected,
}

enum Frame {
    Data { payload: Bytes, binary: bool },
    End(RelayExit),
}

/// Read side of a relayed connection.
pub struct RelayEndpoint {
    kind: SessionKind,
    session: Arc<dyn SessionHandler>,
}

impl RelayEndpoint {
    pub fn new(kind: SessionKind, session: Arc<dyn SessionHandler>) -> Self {
        Self { kind, session }
    }

    /// Run the frame loop over `frames` and tear down afterwards.
    ///
    /// Client connections start a pump that lives exactly as long as the loop.
    pub async fn run<S>(&self, mut frames: S) -> RelayExit
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let queue = Arc::new(MessageQueue::new());
        let pump = (self.kind == SessionKind::ToClient)
            .then(|| QueuePump::start(Arc::clone(&queue), Arc::clone(&self.session)));

        let exit = self.read_frames(&mut frames, &queue).await;

        queue.close();
        if let Some(pump) = pump {
            pump.join().await;
        }
        exit
    }

    async fn read_frames<S>(&self, frames: &mut S, queue: &MessageQueue) -> RelayExit
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        loop {
            let (payload, binary) = match next_frame(frames).await {
                Frame::Data { payload, binary } => (payload, binary),
                Frame::End(exit) => return exit,
            };
            if let Some(exit) = self.dispatch(payload, binary, frames, queue).await {
                return exit;
            }
        }
    }

    /// Route one frame.
    ///
    /// Single-line text from a client goes through the queue, except
    /// `canceltiles`, which prunes it. Binary frames are never queued: the
    /// queue holds text, and the handler must see every byte unchanged.
    async fn dispatch<S>(
        &self,
        payload: Bytes,
        binary: bool,
        frames: &mut S,
        queue: &MessageQueue,
    ) -> Option<RelayExit>
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let line = first_line(&payload);
        let single_line = line.len() == payload.len();
        let line = String::from_utf8_lossy(line);
        let control = ControlLine::parse(&line);

        if self.kind == SessionKind::ToClient && single_line && !binary {
            if control == Some(ControlLine::CancelTiles) {
                let removed = queue.remove_if(is_uncorrelated_tile_request);
                debug!("canceltiles dropped {} queued tile requests", removed);
                self.session.handle_input(&payload).await;
            } else {
                queue.put(line.into_owned());
            }
            return None;
        }

        if let Some(ControlLine::NextMessage { size }) = control {
            let mut large = match next_frame(frames).await {
                Frame::Data { payload, .. } => payload,
                Frame::End(exit) => return Some(exit),
            };
            large.truncate(size);
            debug!("Large message of {} bytes: {}", large.len(), abbreviate(&large));
            return self.handle(&large).await;
        }

        self.handle(&payload).await
    }

    async fn handle(&self, payload: &[u8]) -> Option<RelayExit> {
        if self.session.handle_input(payload).await {
            None
        } else {
            Some(RelayExit::Rejected)
        }
    }
}

async fn next_frame<S>(frames: &mut S) -> Frame
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let (payload, binary) = match frames.next().await {
            None => return Frame::End(RelayExit::Closed),
            Some(Err(e)) => {
                debug!("WebSocket read failed: {}", e);
                return Frame::End(RelayExit::Failed);
            }
            Some(Ok(Message::Text(text))) => {
                (Bytes::copy_from_slice(text.as_str().as_bytes()), false)
            }
            Some(Ok(Message::Binary(data))) => (data, true),
            Some(Ok(Message::Close(_))) => return Frame::End(RelayExit::Closed),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
        };
        if payload.is_empty() {
            return Frame::End(RelayExit::Closed);
        }
        return Frame::Data { payload, binary };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::RecordingHandler;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tower::ServiceExt;

    type Frames = mpsc::UnboundedSender<Result<Message, axum::Error>>;

    fn frames() -> (Frames, UnboundedReceiverStream<Result<Message, axum::Error>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, UnboundedReceiverStream::new(rx))
    }

    fn send(tx: &Frames, text: &str) {
        tx.send(Ok(Message::Text(text.to_string().into()))).unwrap();
    }

    struct NoSessions;

    impl SessionFactory for NoSessions {
        fn create(&self, _kind: SessionKind, _outbox: Outbox) -> Arc<dyn SessionHandler> {
            Arc::new(RecordingHandler::default())
        }
    }

    fn app() -> Router {
        router(RelayState::new(9980, 9981, Arc::new(NoSessions)))
    }

    fn request(headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/docws/child/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_plain_request_is_rejected() {
        let response = app().oneshot(request(&[])).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsupported_version_advertises_13() {
        let response = app()
            .oneshot(request(&[
                ("upgrade", "websocket"),
                ("connection", "Upgrade"),
                ("sec-websocket-version", "8"),
                ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_VERSION], "13");
    }

    #[tokio::test]
    async fn test_missing_key_is_rejected() {
        let response = app()
            .oneshot(request(&[
                ("upgrade", "websocket"),
                ("connection", "Upgrade"),
                ("sec-websocket-version", "13"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_query_string_keeps_worker_path_a_client() {
        let kind = |uri: &str| session_kind(&uri.parse().unwrap(), 9981, 9981);
        assert_eq!(kind("/docws/child/"), SessionKind::ToWorker);
        assert_eq!(kind("/docws/child/?x"), SessionKind::ToClient);
        assert_eq!(
            session_kind(&"/docws/child/".parse().unwrap(), 9980, 9981),
            SessionKind::ToClient
        );
    }

    #[tokio::test]
    async fn test_canceltiles_drops_queued_uncorrelated_tiles() {
        let handler = Arc::new(RecordingHandler::blocking_on("block"));
        let endpoint = RelayEndpoint::new(SessionKind::ToClient, handler.clone());
        let (tx, rx) = frames();
        let run = tokio::spawn(async move { endpoint.run(rx).await });

        send(&tx, "block");
        handler.wait_for("block").await;
        send(&tx, "tile part=1");
        send(&tx, "tile id=5 part=2");
        send(&tx, "canceltiles");
        handler.wait_for("canceltiles").await;

        handler.release();
        handler.wait_for("tile id=5 part=2").await;
        drop(tx);

        assert_eq!(run.await.unwrap(), RelayExit::Closed);
        assert_eq!(
            handler.received(),
            vec!["block", "canceltiles", "tile id=5 part=2"]
        );
    }

    #[tokio::test]
    async fn test_canceltiles_on_empty_queue_reaches_handler_once() {
        let handler = Arc::new(RecordingHandler::default());
        let endpoint = RelayEndpoint::new(SessionKind::ToClient, handler.clone());
        let (tx, rx) = frames();

        send(&tx, "canceltiles");
        drop(tx);

        assert_eq!(endpoint.run(rx).await, RelayExit::Closed);
        assert_eq!(handler.received(), vec!["canceltiles"]);
    }

    #[tokio::test]
    async fn test_nextmessage_delivers_sized_payload() {
        let handler = Arc::new(RecordingHandler::default());
        let endpoint = RelayEndpoint::new(SessionKind::ToWorker, handler.clone());
        let (tx, rx) = frames();

        send(&tx, "nextmessage: size=10");
        tx.send(Ok(Message::Binary(Bytes::from_static(b"0123456789abc"))))
            .unwrap();
        drop(tx);

        assert_eq!(endpoint.run(rx).await, RelayExit::Closed);
        assert_eq!(handler.received(), vec!["0123456789"]);
    }

    #[tokio::test]
    async fn test_multiline_client_message_bypasses_queue() {
        let handler = Arc::new(RecordingHandler::default());
        let endpoint = RelayEndpoint::new(SessionKind::ToClient, handler.clone());
        let (tx, rx) = frames();

        send(&tx, "paste mimetype=text/plain\nhello");
        drop(tx);

        assert_eq!(endpoint.run(rx).await, RelayExit::Closed);
        assert_eq!(handler.received(), vec!["paste mimetype=text/plain\nhello"]);
    }

    #[tokio::test]
    async fn test_binary_client_frame_is_handled_verbatim() {
        let handler = Arc::new(RecordingHandler::blocking_on("block"));
        let endpoint = RelayEndpoint::new(SessionKind::ToClient, handler.clone());
        let (tx, rx) = frames();
        let run = tokio::spawn(async move { endpoint.run(rx).await });

        send(&tx, "block");
        handler.wait_for("block").await;

        // The queue is stuck behind "block", so this only arrives if it
        // skips the queue.
        let raw = [0x89, b'P', 0xff, 0x00];
        tx.send(Ok(Message::Binary(Bytes::copy_from_slice(&raw))))
            .unwrap();
        handler.wait_for_bytes(&raw).await;

        handler.release();
        drop(tx);

        assert_eq!(run.await.unwrap(), RelayExit::Closed);
        assert_eq!(
            handler.received_bytes(),
            vec![b"block".to_vec(), raw.to_vec()]
        );
    }

    #[tokio::test]
    async fn test_empty_frame_ends_loop() {
        let handler = Arc::new(RecordingHandler::default());
        let endpoint = RelayEndpoint::new(SessionKind::ToWorker, handler.clone());
        let (tx, rx) = frames();

        send(&tx, "status");
        send(&tx, "");
        send(&tx, "never");

        assert_eq!(endpoint.run(rx).await, RelayExit::Closed);
        assert_eq!(handler.received(), vec!["status"]);
    }

    #[tokio::test]
    async fn test_rejection_ends_loop() {
        let handler = Arc::new(RecordingHandler::rejecting("bye"));
        let endpoint = RelayEndpoint::new(SessionKind::ToWorker, handler.clone());
        let (tx, rx) = frames();

        send(&tx, "bye");
        send(&tx, "never");

        assert_eq!(endpoint.run(rx).await, RelayExit::Rejected);
        assert_eq!(handler.received(), vec!["bye"]);
    }
}
