//! WebSocket session handling and the per-subscriber pump
//!
//! Each authenticated connection gets a read loop for control messages
//! and, once a scrape request arrives, a detached pump task that drains
//! the job's image channel, filters against the client's history, and
//! writes frame pairs (binary image, then `pin:<id>`) to the socket. The
//! read loop stays free for ping/pong and close handling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::auth::SERVER_NAME_HEADER;
use super::AppState;
use crate::history::{ClientHistoryStore, HistoryKey};
use crate::types::ScrapedImage;

/// Interval between server pings.
const PING_INTERVAL: Duration = Duration::from_secs(5);
/// Additional grace after a ping before the peer is considered gone.
const PONG_WAIT: Duration = Duration::from_secs(10);
/// Image limit applied when the request omits one.
const DEFAULT_LIMIT: usize = 30;

/// A client's control frame.
#[derive(Debug, Deserialize)]
struct ScrapeRequest {
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    command: Option<String>,
}

/// Upgrade handler for `GET /scrape`. Auth ran in middleware; the client
/// name rides in on the same header.
pub async fn scrape_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(client_name) = headers
        .get(SERVER_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, client_name, state))
}

async fn handle_socket(socket: WebSocket, client_name: String, state: AppState) {
    info!(client = %client_name, "client connected");

    let (sink, mut stream) = socket.split();
    let sink = SharedSink::new(sink);
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    // Liveness: ping every PING_INTERVAL, give up when the peer stops
    // answering.
    let ping_task = {
        let sink = sink.clone();
        let last_pong = Arc::clone(&last_pong);
        let client = client_name.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                ticker.tick().await;
                if last_pong.lock().elapsed() > PING_INTERVAL + PONG_WAIT {
                    warn!(client = %client, "pong deadline elapsed, dropping session");
                    let _ = sink.send_message(Message::Close(None)).await;
                    break;
                }
                if sink.send_message(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        })
    };

    let mut pump: Option<JoinHandle<()>> = None;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_request(&text, &client_name, &state, &sink, &mut pump).await;
            }
            Ok(Message::Ping(payload)) => {
                let _ = sink.send_message(Message::Pong(payload)).await;
            }
            Ok(Message::Pong(_)) => {
                *last_pong.lock() = Instant::now();
            }
            Ok(Message::Close(_)) => {
                debug!(client = %client_name, "close frame received");
                break;
            }
            Ok(Message::Binary(_)) => {}
            Err(e) => {
                debug!(client = %client_name, error = %e, "socket error");
                break;
            }
        }
    }

    // The close handler is the single place that tears the job down.
    ping_task.abort();
    if let Some(pump) = pump.take() {
        pump.abort();
    }
    state.manager.stop(&client_name).await;
    info!(client = %client_name, "client disconnected");
}

async fn handle_request(
    text: &str,
    client_name: &str,
    state: &AppState,
    sink: &SharedSink,
    pump: &mut Option<JoinHandle<()>>,
) {
    let request: ScrapeRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            // Malformed frames are dropped; the connection stays open.
            warn!(client = %client_name, error = %e, "ignoring malformed request");
            return;
        }
    };

    if let Some(command) = request.command.as_deref() {
        match command {
            "clear" => match state.history.clear(client_name) {
                Ok(()) => info!(client = %client_name, "cleared client history"),
                Err(e) => warn!(client = %client_name, error = %e, "failed to clear history"),
            },
            other => warn!(client = %client_name, command = other, "unknown command"),
        }
        return;
    }

    if request.queries.is_empty() {
        warn!(client = %client_name, "scrape request without queries");
        return;
    }

    let limit = request.limit.unwrap_or(DEFAULT_LIMIT);
    info!(
        client = %client_name,
        queries = request.queries.len(),
        limit,
        "starting stream"
    );

    // A new request replaces the previous stream; the old pump must not
    // linger and emit a stale completion frame.
    if let Some(previous) = pump.take() {
        previous.abort();
    }

    let images = state.manager.start(client_name, request.queries, limit).await;
    let history = Arc::clone(&state.history);
    let client = client_name.to_string();
    let sink = sink.clone();
    *pump = Some(tokio::spawn(async move {
        run_pump(client, images, history, sink).await;
    }));
}

/// Where image frames go. The real implementation wraps the socket's
/// write half; tests record frames instead.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_binary(&mut self, bytes: Vec<u8>) -> anyhow::Result<()>;
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;
}

/// Socket write half shared between the pump, the ping ticker, and pong
/// replies.
struct SharedSink {
    inner: Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>,
}

impl Clone for SharedSink {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SharedSink {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(sink)),
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), axum::Error> {
        self.inner.lock().await.send(message).await
    }
}

#[async_trait]
impl FrameSink for SharedSink {
    async fn send_binary(&mut self, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.send_message(Message::Binary(bytes))
            .await
            .map_err(Into::into)
    }

    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.send_message(Message::Text(text))
            .await
            .map_err(Into::into)
    }
}

/// Drain a job's image channel into the sink, filtering already-seen
/// fingerprints per client.
///
/// For each delivered image the binary frame strictly precedes the
/// `pin:<id>` text frame, and both precede the history commit. A write
/// failure terminates the pump; the dead socket's close handler stops
/// the job itself. When the channel closes naturally, the client gets a
/// `scrape_complete` text frame.
pub async fn run_pump<S: FrameSink>(
    client_name: String,
    mut images: mpsc::Receiver<ScrapedImage>,
    history: Arc<dyn ClientHistoryStore>,
    mut sink: S,
) {
    let mut delivered = 0usize;

    while let Some(image) = images.recv().await {
        let hash_key = HistoryKey::Hash(image.hash);
        if history.has_seen(&client_name, &hash_key) {
            debug!(client = %client_name, pin = %image.id, "skipping already-seen image");
            continue;
        }

        if sink.send_binary(image.bytes).await.is_err() {
            warn!(client = %client_name, "image write failed, ending pump");
            return;
        }
        if sink.send_text(format!("pin:{}", image.id)).await.is_err() {
            warn!(client = %client_name, "pin write failed, ending pump");
            return;
        }

        history.mark_seen(&client_name, &hash_key);
        history.mark_seen(&client_name, &HistoryKey::Pin(image.id));
        delivered += 1;
    }

    debug!(client = %client_name, delivered, "stream complete");
    let _ = sink.send_text("scrape_complete".to_string()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;

    #[derive(Debug, PartialEq)]
    enum Frame {
        Binary(Vec<u8>),
        Text(String),
    }

    /// Recording sink; optionally fails every send after `fail_after`
    /// frames.
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Frame>>>,
        fail_after: Option<usize>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<Mutex<Vec<Frame>>>) {
            let frames = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    frames: Arc::clone(&frames),
                    fail_after: None,
                },
                frames,
            )
        }

        fn failing_after(n: usize) -> (Self, Arc<Mutex<Vec<Frame>>>) {
            let (mut sink, frames) = Self::new();
            sink.fail_after = Some(n);
            (sink, frames)
        }

        fn push(&mut self, frame: Frame) -> anyhow::Result<()> {
            let mut frames = self.frames.lock();
            if let Some(limit) = self.fail_after {
                if frames.len() >= limit {
                    anyhow::bail!("socket closed");
                }
            }
            frames.push(frame);
            Ok(())
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_binary(&mut self, bytes: Vec<u8>) -> anyhow::Result<()> {
            self.push(Frame::Binary(bytes))
        }

        async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
            self.push(Frame::Text(text))
        }
    }

    fn image(id: &str, hash: u64, bytes: &[u8]) -> ScrapedImage {
        ScrapedImage {
            id: id.to_string(),
            hash,
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn binary_frame_precedes_pin_frame() {
        let history: Arc<dyn ClientHistoryStore> = Arc::new(MemoryHistoryStore::new());
        let (sink, frames) = RecordingSink::new();
        let (tx, rx) = mpsc::channel(8);

        tx.send(image("42", 7, b"image-bytes")).await.unwrap();
        drop(tx);

        run_pump("bot".to_string(), rx, Arc::clone(&history), sink).await;

        let frames = frames.lock();
        assert_eq!(
            *frames,
            vec![
                Frame::Binary(b"image-bytes".to_vec()),
                Frame::Text("pin:42".to_string()),
                Frame::Text("scrape_complete".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_fingerprints_are_suppressed() {
        let history: Arc<dyn ClientHistoryStore> = Arc::new(MemoryHistoryStore::new());
        let (sink, frames) = RecordingSink::new();
        let (tx, rx) = mpsc::channel(8);

        tx.send(image("1", 5, b"a")).await.unwrap();
        tx.send(image("2", 5, b"a-again")).await.unwrap();
        tx.send(image("3", 6, b"b")).await.unwrap();
        drop(tx);

        run_pump("bot".to_string(), rx, Arc::clone(&history), sink).await;

        let frames = frames.lock();
        let pins: Vec<&Frame> = frames
            .iter()
            .filter(|f| matches!(f, Frame::Text(t) if t.starts_with("pin:")))
            .collect();
        assert_eq!(pins.len(), 2);
        assert_eq!(pins[0], &Frame::Text("pin:1".to_string()));
        assert_eq!(pins[1], &Frame::Text("pin:3".to_string()));
    }

    #[tokio::test]
    async fn marks_both_hash_and_pin_id() {
        let history = Arc::new(MemoryHistoryStore::new());
        let (sink, _frames) = RecordingSink::new();
        let (tx, rx) = mpsc::channel(8);

        tx.send(image("1234", 99, b"x")).await.unwrap();
        drop(tx);

        let dyn_history: Arc<dyn ClientHistoryStore> = history.clone();
        run_pump("bot".to_string(), rx, dyn_history, sink).await;

        assert!(history.has_seen("bot", &HistoryKey::Hash(99)));
        assert!(history.has_seen("bot", &HistoryKey::Pin("1234".to_string())));
    }

    #[tokio::test]
    async fn write_failure_terminates_without_marking() {
        let history = Arc::new(MemoryHistoryStore::new());
        // First binary frame succeeds, the pin frame fails.
        let (sink, frames) = RecordingSink::failing_after(1);
        let (tx, rx) = mpsc::channel(8);

        tx.send(image("1", 11, b"x")).await.unwrap();
        tx.send(image("2", 12, b"y")).await.unwrap();
        drop(tx);

        let dyn_history: Arc<dyn ClientHistoryStore> = history.clone();
        run_pump("bot".to_string(), rx, dyn_history, sink).await;

        // Pump stopped before the commit and never touched image 2.
        assert!(!history.has_seen("bot", &HistoryKey::Hash(11)));
        assert!(!history.has_seen("bot", &HistoryKey::Hash(12)));
        assert_eq!(frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn seen_history_survives_across_streams() {
        let history: Arc<dyn ClientHistoryStore> = Arc::new(MemoryHistoryStore::new());

        let (sink, _frames) = RecordingSink::new();
        let (tx, rx) = mpsc::channel(8);
        tx.send(image("1", 5, b"a")).await.unwrap();
        drop(tx);
        run_pump("bot".to_string(), rx, Arc::clone(&history), sink).await;

        // Second stream re-serves the same fingerprint; nothing goes out.
        let (sink, frames) = RecordingSink::new();
        let (tx, rx) = mpsc::channel(8);
        tx.send(image("9", 5, b"a")).await.unwrap();
        drop(tx);
        run_pump("bot".to_string(), rx, Arc::clone(&history), sink).await;

        let frames = frames.lock();
        assert_eq!(*frames, vec![Frame::Text("scrape_complete".to_string())]);
    }

    #[test]
    fn request_parsing_defaults() {
        let req: ScrapeRequest =
            serde_json::from_str(r#"{"queries":["cats"]}"#).unwrap();
        assert_eq!(req.queries, vec!["cats"]);
        assert_eq!(req.limit, None);
        assert_eq!(req.command, None);

        let req: ScrapeRequest = serde_json::from_str(r#"{"command":"clear"}"#).unwrap();
        assert!(req.queries.is_empty());
        assert_eq!(req.command.as_deref(), Some("clear"));
    }
}
