//! Long-lived Server-Sent-Events sessions.
//!
//! Each live session owns a bounded outbound queue drained by one writer
//! task. The session map is the single source of truth for which sessions
//! exist; the writer removes its own entry when it stops, whatever the
//! reason.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::{HeaderValue, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response as HttpResponse};
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_PUSH_TIMEOUT_MS, DEFAULT_QUEUE_CAPACITY};
use crate::types::{McpError, Response};

/// Frames buffered between the writer task and the HTTP body.
const FRAME_BUFFER: usize = 1;

struct ClientSession {
    generation: u64,
    sender: mpsc::Sender<String>,
    initialized: bool,
}

struct Inner {
    sessions: Mutex<HashMap<String, ClientSession>>,
    capacity: usize,
    push_timeout: Duration,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Owns every live SSE session. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(
            DEFAULT_QUEUE_CAPACITY,
            Duration::from_millis(DEFAULT_PUSH_TIMEOUT_MS),
        )
    }
}

impl SessionManager {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize, push_timeout: Duration) -> Self {
        SessionManager {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                push_timeout,
                next_generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Open a session and start its writer task.
    ///
    /// Must be called from within a tokio runtime. The returned stream is
    /// the HTTP body; dropping it (the client went away) stops the writer.
    ///
    /// # Errors
    ///
    /// `DuplicateSession` if `id` is already live (the existing session is
    /// left untouched), `ShuttingDown` after [`shutdown`](Self::shutdown).
    pub async fn register(&self, id: &str) -> Result<SessionStream, McpError> {
        let mut sessions = self.inner.sessions.lock().await;

        if self.inner.shutdown.is_cancelled() {
            return Err(McpError::ShuttingDown);
        }
        if sessions.contains_key(id) {
            tracing::error!(session = %id, "client already exists");
            return Err(McpError::DuplicateSession(id.to_string()));
        }

        let (sender, queue) = mpsc::channel(self.inner.capacity);
        let (frames, body) = mpsc::channel(FRAME_BUFFER);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        sessions.insert(
            id.to_string(),
            ClientSession {
                generation,
                sender,
                initialized: false,
            },
        );

        let writer = Writer {
            manager: self.clone(),
            id: id.to_string(),
            generation,
            queue,
            frames,
            cancel: self.inner.shutdown.child_token(),
        };
        tokio::spawn(writer.run());

        tracing::info!(session = %id, "client registered");
        Ok(SessionStream {
            id: id.to_string(),
            body: ReceiverStream::new(body),
        })
    }

    /// Close a session's queue and forget it. Unknown ids are a no-op.
    ///
    /// Messages already queued are still written before the writer stops.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.inner.sessions.lock().await.remove(id);
        match removed {
            Some(_) => {
                tracing::info!(session = %id, "client unregistered");
                true
            }
            None => false,
        }
    }

    /// Writer-side cleanup; skips entries that belong to a newer session.
    async fn release(&self, id: &str, generation: u64) {
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.get(id).is_some_and(|s| s.generation == generation) {
            sessions.remove(id);
            tracing::info!(session = %id, "client unregistered");
        }
    }

    /// Queue a raw message for `id`.
    ///
    /// `\r\n` and lone `\r` are rewritten to `\n`, so a multi-line message
    /// arrives as one event with its lines intact. Waits up to the push
    /// timeout for space when the queue is full.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the session is not live, `QueueFull` if no
    /// space opened up in time.
    pub async fn push(&self, id: &str, message: impl Into<String>) -> Result<(), McpError> {
        let sender = {
            let sessions = self.inner.sessions.lock().await;
            sessions.get(id).map(|s| s.sender.clone())
        }
        .ok_or_else(|| McpError::SessionNotFound(id.to_string()))?;

        let message = normalize_newlines(message.into());
        match sender.send_timeout(message, self.inner.push_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(session = %id, capacity = self.inner.capacity, "session queue full, message rejected");
                Err(McpError::QueueFull(id.to_string()))
            }
            Err(SendTimeoutError::Closed(_)) => Err(McpError::SessionNotFound(id.to_string())),
        }
    }

    /// Serialize a response envelope and queue it for `id`.
    pub async fn send(&self, id: &str, response: &Response) -> Result<(), McpError> {
        let message = serde_json::to_string(response)?;
        self.push(id, message).await
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.sessions.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Record a completed `initialize` handshake. False if `id` is not live.
    pub async fn mark_initialized(&self, id: &str) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        match sessions.get_mut(id) {
            Some(session) => {
                session.initialized = true;
                true
            }
            None => false,
        }
    }

    /// `None` if `id` is not live.
    pub async fn is_initialized(&self, id: &str) -> Option<bool> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(id).map(|s| s.initialized)
    }

    /// Stop every writer and refuse new sessions.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

fn normalize_newlines(message: String) -> String {
    if message.contains('\r') {
        message.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        message
    }
}

struct Writer {
    manager: SessionManager,
    id: String,
    generation: u64,
    queue: mpsc::Receiver<String>,
    frames: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl Writer {
    async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break "shutdown",
                message = self.queue.recv() => {
                    let Some(message) = message else {
                        break "queue closed";
                    };
                    tokio::select! {
                        sent = self.frames.send(Event::default().data(message)) => {
                            if sent.is_err() {
                                break "write failed";
                            }
                        }
                        _ = self.cancel.cancelled() => break "shutdown",
                    }
                }
                _ = self.frames.closed() => break "client disconnected",
            }
        };

        tracing::debug!(session = %self.id, reason, "writer stopped");
        self.manager.release(&self.id, self.generation).await;
    }
}

/// The event stream handed to the HTTP layer for one session.
pub struct SessionStream {
    id: String,
    body: ReceiverStream<Event>,
}

impl SessionStream {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl IntoResponse for SessionStream {
    fn into_response(self) -> HttpResponse {
        let stream = self.body.map(Ok::<Event, Infallible>);
        let mut response = Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response();

        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        response
    }
}
