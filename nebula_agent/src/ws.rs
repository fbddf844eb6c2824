//! WebSocket upgrade and per-connection pumps.
//!
//! Each connection runs an inbound pump (reads, read deadline) and an outbound
//! pump (the only writer: coalesced frames, pings, write deadline). Whichever
//! ends first cancels the other and, for terminals, unregisters the session.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::error::TerminalError;
use crate::hub::Subscription;
use crate::state::AppState;
use crate::terminal::{Session, TerminalManager};
use crate::types::{Envelope, ResizeDirective};

const PTY_READ_CHUNK: usize = 4096;
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
// a closed session's reader returns within one poll slice
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Heartbeat and sizing parameters for one connection.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_message_bytes: usize,
    pub send_queue: usize,
}

impl From<&WebSocketConfig> for Timings {
    fn from(c: &WebSocketConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(c.ping_interval_secs.max(1)),
            pong_wait: Duration::from_secs(c.pong_wait_secs.max(1)),
            write_wait: Duration::from_secs(c.write_wait_secs.max(1)),
            max_message_bytes: c.max_message_bytes.max(1024),
            send_queue: c.send_queue.max(1),
        }
    }
}

type WsSink = SplitSink<WebSocket, Message>;

// ---------- Metrics stream ----------

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    client: Option<String>,
}

pub async fn metrics_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<MetricsQuery>,
) -> Response {
    let timings = Timings::from(&state.config().websocket);
    let name = q
        .client
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "anonymous".into());
    ws.max_message_size(timings.max_message_bytes)
        .on_upgrade(move |socket| serve_metrics(socket, state, name, timings))
}

async fn serve_metrics(socket: WebSocket, state: AppState, name: String, t: Timings) {
    let sub = state.hub.subscribe(name.clone());
    let (mut sink, stream) = socket.split();

    // a fresh client sees the newest snapshot without waiting for the next tick
    if !state.history.is_empty() {
        match serde_json::to_string(&Envelope::new("metrics", state.history.latest())) {
            Ok(js) => {
                if let Err(e) = send_frame(&mut sink, Message::Text(js), t.write_wait).await {
                    debug!(client = %name, "initial snapshot not delivered: {e}");
                    return;
                }
            }
            Err(e) => warn!("failed to serialize snapshot: {e}"),
        }
    }

    let cancel = CancellationToken::new();
    let outbound = tokio::spawn(metrics_outbound(sink, sub, t, cancel.clone()));
    inbound_pump(stream, t, cancel.clone(), |_| async { true }).await;
    cancel.cancel();
    let _ = outbound.await;
    info!(client = %name, "metrics client disconnected");
}

async fn metrics_outbound(mut sink: WsSink, mut sub: Subscription, t: Timings, cancel: CancellationToken) {
    let mut ping = heartbeat(t.ping_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = sub.recv() => {
                // queue closed: the hub dropped this client
                let Some(first) = msg else { break };
                let batch = coalesce(first.to_vec(), b"\n", t.max_message_bytes, || sub.try_recv().map(|b| b.to_vec()));
                let text = String::from_utf8(batch)
                    .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
                if let Err(e) = send_frame(&mut sink, Message::Text(text), t.write_wait).await {
                    debug!(client = %sub.name(), "write failed: {e}");
                    break;
                }
            }
            _ = ping.tick() => {
                if send_frame(&mut sink, Message::Ping(Vec::new()), t.write_wait).await.is_err() {
                    break;
                }
            }
        }
    }
    cancel.cancel();
    close_sink(sink, t.write_wait).await;
}

// ---------- Terminal stream ----------

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    session: Option<String>,
    shell: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
}

pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<TerminalQuery>,
) -> Response {
    let Some(id) = q.session.filter(|s| !s.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing session parameter" })),
        )
            .into_response();
    };
    let shell = q.shell.unwrap_or_default();
    let cols = q.cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS);
    let rows = q.rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS);

    // Created before the upgrade so failures are ordinary HTTP errors.
    let terminals = state.terminals.clone();
    let sid = id.clone();
    let created = tokio::task::spawn_blocking(move || terminals.create_session(&sid, &shell, cols, rows)).await;
    let session = match created {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            warn!(session = %id, "terminal session rejected: {e}");
            return e.into_response();
        }
        Err(e) => return TerminalError::SpawnFailed(e.to_string()).into_response(),
    };

    let timings = Timings::from(&state.config().websocket);
    let terminals = state.terminals.clone();
    let failed_id = id.clone();
    ws.max_message_size(timings.max_message_bytes)
        .on_failed_upgrade(move |e| {
            warn!(session = %failed_id, "websocket upgrade failed: {e}");
            terminals.close_session(&failed_id);
        })
        .on_upgrade(move |socket| serve_terminal(socket, state.terminals.clone(), session, timings))
}

async fn serve_terminal(socket: WebSocket, terminals: Arc<TerminalManager>, session: Arc<Session>, t: Timings) {
    let id = session.id().to_string();
    info!(session = %id, shell = %session.shell(), "terminal attached");
    let (sink, stream) = socket.split();
    let cancel = CancellationToken::new();

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(t.send_queue);
    let reader = tokio::task::spawn_blocking({
        let session = session.clone();
        move || pty_reader(session, out_tx)
    });
    let outbound = tokio::spawn({
        let terminals = terminals.clone();
        let id = id.clone();
        let cancel = cancel.clone();
        async move {
            terminal_outbound(sink, out_rx, t, cancel).await;
            release_session(terminals, id).await;
        }
    });

    inbound_pump(stream, t, cancel.clone(), |msg| {
        let session = session.clone();
        async move { forward_input(session, msg).await }
    })
    .await;

    cancel.cancel();
    release_session(terminals, id.clone()).await;
    let _ = outbound.await;
    if timeout(READER_DRAIN, reader).await.is_err() {
        warn!(session = %id, "pty reader did not finish after close");
    }
    info!(session = %id, "terminal detached");
}

/// Kill and unregister; safe to call from both pumps.
async fn release_session(terminals: Arc<TerminalManager>, id: String) {
    let sid = id.clone();
    match tokio::task::spawn_blocking(move || terminals.close_session(&sid)).await {
        Ok(true) => debug!(session = %id, "session released"),
        Ok(false) => {}
        Err(e) => warn!(session = %id, "closing session failed: {e}"),
    }
}

// Blocks on the PTY; ends when the shell exits or the session is closed.
fn pty_reader(session: Arc<Session>, out: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; PTY_READ_CHUNK];
    loop {
        match session.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if out.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(TerminalError::SessionClosed(_)) => break,
            Err(e) => {
                warn!(session = %session.id(), "pty read failed: {e}");
                break;
            }
        }
    }
    debug!(session = %session.id(), "pty reader finished");
}

async fn terminal_outbound(
    mut sink: WsSink,
    mut out: mpsc::Receiver<Vec<u8>>,
    t: Timings,
    cancel: CancellationToken,
) {
    let mut ping = heartbeat(t.ping_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = out.recv() => {
                let Some(first) = chunk else { break };
                let batch = coalesce(first, b"", t.max_message_bytes, || out.try_recv().ok());
                if let Err(e) = send_frame(&mut sink, Message::Binary(batch), t.write_wait).await {
                    debug!("terminal write failed: {e}");
                    break;
                }
            }
            _ = ping.tick() => {
                if send_frame(&mut sink, Message::Ping(Vec::new()), t.write_wait).await.is_err() {
                    break;
                }
            }
        }
    }
    cancel.cancel();
    close_sink(sink, t.write_wait).await;
}

/// Apply one client frame to the session. Returns false to end the connection.
async fn forward_input(session: Arc<Session>, msg: Message) -> bool {
    let data = match msg {
        Message::Text(text) => {
            if let Some(r) = ResizeDirective::parse(&text) {
                if let Err(e) = session.resize(r.cols, r.rows) {
                    debug!(session = %session.id(), "resize failed: {e}");
                    return !matches!(e, TerminalError::SessionClosed(_));
                }
                return true;
            }
            text.into_bytes()
        }
        Message::Binary(bytes) => bytes,
        _ => return true,
    };
    if data.is_empty() {
        return true;
    }
    let id = session.id().to_string();
    match tokio::task::spawn_blocking(move || session.write(&data)).await {
        Ok(Ok(n)) => {
            debug!(session = %id, bytes = n, "input forwarded");
            true
        }
        Ok(Err(e)) => {
            debug!(session = %id, "input rejected: {e}");
            false
        }
        Err(e) => {
            warn!(session = %id, "input task failed: {e}");
            false
        }
    }
}

// ---------- Shared pump helpers ----------

/// Read frames until close, error, read-deadline expiry, cancellation, or until
/// `on_frame` returns false. Every received frame (pongs included) refreshes the
/// deadline.
async fn inbound_pump<F, Fut>(mut stream: SplitStream<WebSocket>, t: Timings, cancel: CancellationToken, mut on_frame: F)
where
    F: FnMut(Message) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(t.pong_wait, stream.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                debug!("read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("read failed: {e}");
                break;
            }
            Ok(Some(Ok(m))) => m,
        };
        match msg {
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            other => {
                // input can stall on a full PTY; the other pump's exit still ends this one
                let keep = tokio::select! {
                    _ = cancel.cancelled() => false,
                    keep = on_frame(other) => keep,
                };
                if !keep {
                    break;
                }
            }
        }
    }
    cancel.cancel();
}

/// Append already-queued messages to `first` while the frame stays under `limit`.
/// A message that would overflow the limit is sent in the following frame
/// rather than held back, so `limit` may be exceeded by a single message.
pub fn coalesce(
    mut first: Vec<u8>,
    delimiter: &[u8],
    limit: usize,
    mut next: impl FnMut() -> Option<Vec<u8>>,
) -> Vec<u8> {
    while first.len() < limit {
        let Some(more) = next() else { break };
        first.extend_from_slice(delimiter);
        first.extend_from_slice(&more);
    }
    first
}

fn heartbeat(period: Duration) -> tokio::time::Interval {
    let mut ping = interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping
}

async fn send_frame(sink: &mut WsSink, msg: Message, wait: Duration) -> anyhow::Result<()> {
    match timeout(wait, sink.send(msg)).await {
        Ok(res) => Ok(res?),
        Err(_) => anyhow::bail!("write deadline exceeded"),
    }
}

async fn close_sink(mut sink: WsSink, wait: Duration) {
    let _ = timeout(wait, sink.send(Message::Close(None))).await;
    let _ = timeout(wait, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn queue(items: &[&str]) -> VecDeque<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn coalesces_queued_json_with_newlines() {
        let mut q = queue(&["{\"b\":2}", "{\"c\":3}"]);
        let out = coalesce(b"{\"a\":1}".to_vec(), b"\n", 1024, || q.pop_front());
        assert_eq!(out, b"{\"a\":1}\n{\"b\":2}\n{\"c\":3}");
        assert!(q.is_empty());
    }

    #[test]
    fn terminal_chunks_concatenate_without_delimiter() {
        let mut q = queue(&["lo ", "world"]);
        let out = coalesce(b"hel".to_vec(), b"", 1024, || q.pop_front());
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn coalescing_stops_at_the_size_limit() {
        let mut q = queue(&["bbbb", "cccc", "dddd"]);
        let out = coalesce(b"aaaa".to_vec(), b"", 8, || q.pop_front());
        assert_eq!(out, b"aaaabbbb");
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn timings_follow_websocket_config() {
        let t = Timings::from(&WebSocketConfig::default());
        assert_eq!(t.ping_interval, Duration::from_secs(30));
        assert_eq!(t.pong_wait, Duration::from_secs(60));
        assert_eq!(t.write_wait, Duration::from_secs(10));
        assert_eq!(t.send_queue, 256);
    }
}
