//! WebSocket front door.
//!
//! Every connection runs two tokio tasks: a reader that feeds binary PCM
//! into the session's ring, and a writer that drains the outbound queue
//! whenever the worker (or the reader, opportunistically) signals. The
//! worker never touches the socket; it only enqueues and notifies.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Query as AxumQuery, State as AxumState,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::unbounded_channel;
use tower_http::trace::TraceLayer;

use crate::config::server_config::ServerConfig;
use crate::engine::pool::ContextPool;
use crate::server::messages;
use crate::session::registry::SessionRegistry;
use crate::session::session::Session;

/// Frames above this are rejected by the websocket layer.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Connections with no inbound frame for this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long teardown waits for an in-flight inference before reclaiming
/// the slot anyway.
const TEARDOWN_WAIT: Duration = Duration::from_secs(2);

pub struct StreamServer {
    cfg: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    pool: Arc<ContextPool>,
    next_session: AtomicU64,
}

impl StreamServer {
    pub fn new(
        cfg: Arc<ServerConfig>,
        registry: Arc<SessionRegistry>,
        pool: Arc<ContextPool>,
    ) -> Self {
        Self {
            cfg,
            registry,
            pool,
            next_session: AtomicU64::new(0),
        }
    }

    /// Any path upgrades to the streaming protocol; `/health` answers
    /// probes without an upgrade.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(|| async { "OK" }))
            .route("/", get(Self::ws_handler))
            .route("/{*path}", get(Self::ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    async fn ws_handler(
        ws: WebSocketUpgrade,
        AxumQuery(query): AxumQuery<HashMap<String, String>>,
        AxumState(this): AxumState<Arc<Self>>,
    ) -> Response {
        if let Some(expected) = &this.cfg.auth_token {
            if query.get("token") != Some(expected) {
                tracing::warn!("upgrade rejected: missing or invalid token");
                return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
            }
        }
        ws.max_message_size(MAX_FRAME_BYTES)
            .on_upgrade(move |socket| this.handle_socket(socket))
            .into_response()
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let id = format!(
            "session-{}",
            self.next_session.fetch_add(1, Ordering::Relaxed) + 1
        );
        tracing::info!(session = %id, "client connected");

        let (mut sender, mut receiver) = socket.split();
        let session = Arc::new(Session::new(id.clone()));
        let (flush_tx, mut flush_rx) = unbounded_channel();
        session.attach(flush_tx);
        self.registry.insert(session.clone());

        session.enqueue(messages::ready_message(&self.cfg.model, self.pool.len()));
        session.notify_flush();

        // Writer: one drain per wakeup, frames in enqueue order.
        let writer_session = session.clone();
        let writer = tokio::spawn(async move {
            while flush_rx.recv().await.is_some() {
                writer_session.begin_flush();
                for msg in writer_session.drain_outbound() {
                    if sender.send(Message::Text(msg.into())).await.is_err() {
                        tracing::debug!(session = %writer_session.id, "write failed, peer gone");
                        return;
                    }
                }
            }
        });

        // Reader: binary PCM in; anything else is noise.
        let reader_session = session.clone();
        let reader = tokio::spawn(async move {
            loop {
                let msg = match tokio::time::timeout(IDLE_TIMEOUT, receiver.next()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        tracing::info!(session = %reader_session.id, "idle timeout");
                        break;
                    }
                };
                match msg {
                    Some(Ok(Message::Binary(buf))) => {
                        // Little-endian i16 mono PCM. An odd trailing byte
                        // is not a sample; drop it.
                        let even = buf.len() & !1;
                        let samples: Vec<i16> = buf[..even]
                            .chunks_exact(2)
                            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                            .collect();
                        reader_session.audio.push_i16(&samples);

                        // Opportunistic flush: several inference results may
                        // have queued up since the last frame.
                        if reader_session.has_outbound() {
                            reader_session.notify_flush();
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(session = %reader_session.id, %text, "ignoring text frame");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(session = %reader_session.id, "closed by client");
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong, handled by the protocol layer
                    Some(Err(e)) => {
                        tracing::warn!(session = %reader_session.id, error = %e, "receive error");
                        break;
                    }
                }
            }
        });

        let _ = reader.await;
        session.detach();
        let _ = writer.await;
        self.destroy_session(&id).await;
        tracing::info!(session = %id, "client disconnected");
    }

    /// Tear a session down: mark it inactive, wait out any in-flight
    /// inference, hand its context back to the pool, drop it from the
    /// registry.
    pub async fn destroy_session(&self, id: &str) {
        let Some(session) = self.registry.lookup(id) else {
            return;
        };
        session.set_inactive();

        let deadline = tokio::time::Instant::now() + TEARDOWN_WAIT;
        while session.inference_running.load(Ordering::Acquire) {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(session = %id, "inference still running at teardown deadline");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        {
            let mut ut = session.utterance.lock().expect("utterance lock poisoned");
            if let Some(slot) = ut.slot.take() {
                self.pool.release(slot);
            }
        }
        self.registry.remove(id);
        tracing::debug!(session = %id, "session destroyed");
    }
}
