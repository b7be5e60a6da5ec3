//! The streaming search session.
//!
//! A [`SearchSession`] drives one query at a time: it persists the query as a chat, opens the
//! result stream for that chat and accumulates results as frames arrive.  Every change is
//! published as a [`SessionSnapshot`] on a watch channel, so a consumer can render results
//! progressively instead of waiting for the stream to finish.
//!
//! ```text
//! Idle --create chat--> Streaming --[DONE] / end--> Completed
//!   |                      |------cancel()--------> Cancelled
//!   |                      '------transport error-> Failed
//!   '--chat or open fails-------------------------> Failed
//! ```
//!
//! Terminal states are final for a run.  `start` on a busy session cancels the current run
//! first; a session only ever has one run in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::chat::ChatSession;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::observability::{
    STREAM_BYTES, STREAM_CANCELLED, STREAM_COMPLETED, STREAM_DECODE_ERRORS, STREAM_DURATION,
    STREAM_FAILED, STREAM_FRAMES, STREAM_OPENS,
};
use crate::search::frame::{Frame, FrameDecoder, RawFrame, parse_frame};
use crate::transport::{ApiRequest, ByteStream};
use crate::types::{SearchFilters, SearchResult, rank};

/// Path of the streaming search endpoint.
pub const SEARCH_PATH: &str = "search";

/// Shown when the user cancels a run.
pub const CANCELLED_MESSAGE: &str = "Request was cancelled";

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Cancelled | StreamState::Failed
        )
    }
}

/// Why a run ended in [`StreamState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The chat could not be created; no stream was opened.
    ChatCreation,
    /// The result stream could not be opened.
    ConnectFailed,
    /// The stream broke after it was opened; accumulated results are kept.
    ConnectionDropped,
}

/// Everything a consumer needs to render a session.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub state: StreamState,
    /// The chat this run is persisted as.  A draft until the chat has been created.
    pub chat: Option<ChatSession>,
    /// Results in arrival order.
    pub results: Vec<SearchResult>,
    /// One human-readable message for the terminal state, if it needs one.
    pub message: Option<String>,
    pub failure: Option<FailureKind>,
    pub error: Option<Error>,
    run: u64,
}

impl SessionSnapshot {
    /// Results sorted by descending score.
    pub fn ranked(&self) -> Vec<SearchResult> {
        rank(&self.results)
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat.as_ref().and_then(|c| c.chat_id.as_deref())
    }
}

struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
}

struct Shared {
    snapshot: watch::Sender<SessionSnapshot>,
    active: Mutex<Option<ActiveRun>>,
    next_run: AtomicU64,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` to the snapshot if `run` is still the current run.  `f` returns whether it
    /// changed anything, and must leave the snapshot untouched when it returns false.
    fn update(&self, run: u64, f: impl FnOnce(&mut SessionSnapshot) -> bool) -> bool {
        self.snapshot.send_if_modified(|s| s.run == run && f(s))
    }

    /// Move `run` into a terminal state unless it already reached one.
    fn settle(
        &self,
        run: u64,
        state: StreamState,
        message: Option<String>,
        failure: Option<FailureKind>,
        error: Option<Error>,
    ) -> bool {
        let settled = self.update(run, |s| {
            if s.state.is_terminal() {
                return false;
            }
            s.state = state;
            s.message = message;
            s.failure = failure;
            s.error = error;
            true
        });
        self.release(run);
        settled
    }

    fn release(&self, run: u64) {
        let mut active = self.active();
        if active.as_ref().is_some_and(|a| a.id == run) {
            *active = None;
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(run) = self.active().take() {
            run.cancel.cancel();
        }
    }
}

/// Drives searches for one consumer.  Clones share the same session.
#[derive(Clone)]
pub struct SearchSession {
    gateway: Gateway,
    shared: Arc<Shared>,
}

impl SearchSession {
    pub fn new(gateway: Gateway) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        Self {
            gateway,
            shared: Arc::new(Shared {
                snapshot,
                active: Mutex::new(None),
                next_run: AtomicU64::new(1),
            }),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// A receiver that observes every published change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn state(&self) -> StreamState {
        self.shared.snapshot.borrow().state
    }

    /// Accumulated results in arrival order.
    pub fn results(&self) -> Vec<SearchResult> {
        self.shared.snapshot.borrow().results.clone()
    }

    /// Accumulated results sorted by descending score, for display.
    pub fn ranked(&self) -> Vec<SearchResult> {
        rank(&self.shared.snapshot.borrow().results)
    }

    pub fn chat(&self) -> Option<ChatSession> {
        self.shared.snapshot.borrow().chat.clone()
    }

    pub fn message(&self) -> Option<String> {
        self.shared.snapshot.borrow().message.clone()
    }

    /// Whether a run is being set up or streaming.
    pub fn is_active(&self) -> bool {
        self.shared.active().is_some()
    }

    /// Wait until the session is not streaming and return the snapshot at that point.
    pub async fn wait(&self) -> SessionSnapshot {
        let mut rx = self.subscribe();
        match rx.wait_for(|s| s.state != StreamState::Streaming).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    fn begin_run(&self, snapshot: SessionSnapshot) -> (u64, CancellationToken) {
        let id = self.shared.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        *self.shared.active() = Some(ActiveRun {
            id,
            cancel: cancel.clone(),
        });
        self.shared.snapshot.send_replace(SessionSnapshot { run: id, ..snapshot });
        (id, cancel)
    }

    /// Run `query` against the directory.
    ///
    /// A blank query is ignored.  Any run already in flight is cancelled first.  Returns once
    /// the stream is open (or the run failed or was cancelled on the way there); results keep
    /// arriving in the background.  Returns the state the run is in.
    pub async fn start(&self, query: &str, filters: SearchFilters) -> StreamState {
        let query = query.trim();
        if query.is_empty() {
            return self.state();
        }
        self.cancel();

        let mut filters = filters;
        if filters.limit.is_none() {
            filters.limit = Some(self.gateway.config().result_limit);
        }
        let (run, cancel) = self.begin_run(SessionSnapshot {
            chat: Some(ChatSession::draft(query, filters.clone())),
            ..SessionSnapshot::default()
        });

        let created = tokio::select! {
            _ = cancel.cancelled() => return self.state(),
            created = self.gateway.create_chat(query, &filters) => created,
        };
        let chat = match created {
            Ok(chat) => chat,
            Err(err) => {
                tracing::warn!(error = %err, "failed to create chat");
                STREAM_FAILED.click();
                self.shared.settle(
                    run,
                    StreamState::Failed,
                    Some(format!("Failed to create chat: {err}")),
                    Some(FailureKind::ChatCreation),
                    Some(err),
                );
                return self.state();
            }
        };
        let chat_id = chat.chat_id.clone().unwrap_or_default();
        self.shared.update(run, |s| {
            s.chat = Some(chat);
            true
        });

        let request = ApiRequest::get(SEARCH_PATH)
            .query("q", query)
            .query("chatId", chat_id.as_str())
            .query_pairs(filters.query_pairs());
        let opened = tokio::select! {
            _ = cancel.cancelled() => return self.state(),
            opened = self.gateway.open_stream(request) => opened,
        };
        let response = match opened {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(chat_id = %chat_id, error = %err, "failed to open result stream");
                STREAM_FAILED.click();
                self.shared.settle(
                    run,
                    StreamState::Failed,
                    Some(format!("Failed to establish connection: {err}")),
                    Some(FailureKind::ConnectFailed),
                    Some(err),
                );
                return self.state();
            }
        };

        let streaming = self.shared.update(run, |s| {
            if s.state != StreamState::Idle {
                return false;
            }
            s.state = StreamState::Streaming;
            true
        });
        if !streaming {
            return self.state();
        }
        STREAM_OPENS.click();
        tracing::info!(chat_id = %chat_id, "result stream opened");

        let reader = StreamReader {
            shared: Arc::downgrade(&self.shared),
            run,
            chat_id,
            cancel,
        };
        tokio::spawn(reader.run(response.body));
        StreamState::Streaming
    }

    /// Stop the run in flight.
    ///
    /// Does nothing if no run is in flight, so calling it twice or after completion is
    /// harmless.
    pub fn cancel(&self) {
        let Some(run) = self.shared.active().take() else {
            return;
        };
        run.cancel.cancel();
        let cancelled = self.shared.update(run.id, |s| {
            if s.state.is_terminal() {
                return false;
            }
            s.state = StreamState::Cancelled;
            s.message = Some(CANCELLED_MESSAGE.to_string());
            true
        });
        if cancelled {
            STREAM_CANCELLED.click();
            tracing::info!(run = run.id, "search cancelled");
        }
    }

    /// Load a persisted chat and publish its stored results without opening a stream.
    ///
    /// The session is left `Idle` with the chat and its results; any run in flight is
    /// cancelled first.
    pub async fn replay(&self, chat_id: &str) -> Result<()> {
        self.cancel();
        let (run, cancel) = self.begin_run(SessionSnapshot::default());
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(CANCELLED_MESSAGE)),
            fetched = self.gateway.get_chat(chat_id) => fetched,
        };
        self.shared.release(run);
        let record = fetched?;
        let results = record.results();
        tracing::debug!(chat_id = %record.id, results = results.len(), "replaying chat");
        self.shared.update(run, |s| {
            s.chat = Some(record.session());
            s.results = results;
            true
        });
        Ok(())
    }

    /// Cancel anything in flight and return to an empty `Idle` snapshot.
    pub fn clear(&self) {
        self.cancel();
        let run = self.shared.next_run.fetch_add(1, Ordering::Relaxed);
        self.shared.snapshot.send_replace(SessionSnapshot {
            run,
            ..SessionSnapshot::default()
        });
    }
}

impl std::fmt::Debug for SearchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.shared.snapshot.borrow();
        f.debug_struct("SearchSession")
            .field("state", &snapshot.state)
            .field("chat_id", &snapshot.chat_id())
            .field("results", &snapshot.results.len())
            .finish()
    }
}

/// Background half of a run: reads chunks until the stream ends, fails, or is cancelled.
struct StreamReader {
    shared: Weak<Shared>,
    run: u64,
    chat_id: String,
    cancel: CancellationToken,
}

enum Step {
    Continue,
    Done,
}

impl StreamReader {
    async fn run(self, mut body: ByteStream) {
        let started = Instant::now();
        let mut decoder = FrameDecoder::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    STREAM_BYTES.count(bytes.len() as u64);
                    for frame in decoder.push(&bytes) {
                        if let Step::Done = self.handle(frame) {
                            self.complete(started);
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    self.fail(err, started);
                    return;
                }
                None => {
                    if let Some(frame) = decoder.finish() {
                        self.handle(frame);
                    }
                    self.complete(started);
                    return;
                }
            }
            if self.shared.strong_count() == 0 {
                return;
            }
        }
    }

    fn handle(&self, frame: Result<RawFrame>) -> Step {
        let parsed = frame.and_then(|raw| parse_frame(&raw));
        match parsed {
            Ok(Frame::Done) => Step::Done,
            Ok(Frame::Result(result)) => {
                STREAM_FRAMES.click();
                if let Some(shared) = self.shared.upgrade() {
                    shared.update(self.run, |s| {
                        if s.state != StreamState::Streaming {
                            return false;
                        }
                        s.results.push(result);
                        true
                    });
                }
                Step::Continue
            }
            Err(err) => {
                STREAM_DECODE_ERRORS.click();
                tracing::warn!(chat_id = %self.chat_id, error = %err, "dropping malformed frame");
                Step::Continue
            }
        }
    }

    fn complete(&self, started: Instant) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.settle(self.run, StreamState::Completed, None, None, None) {
            STREAM_COMPLETED.click();
            STREAM_DURATION.add(started.elapsed().as_secs_f64());
            tracing::info!(chat_id = %self.chat_id, "result stream completed");
        }
    }

    fn fail(&self, err: Error, started: Instant) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let kept = shared.snapshot.borrow().results.len();
        let message = format!("Connection dropped after {kept} result(s) were received: {err}");
        if shared.settle(
            self.run,
            StreamState::Failed,
            Some(message),
            Some(FailureKind::ConnectionDropped),
            Some(err.clone()),
        ) {
            STREAM_FAILED.click();
            STREAM_DURATION.add(started.elapsed().as_secs_f64());
            tracing::warn!(chat_id = %self.chat_id, kept, error = %err, "result stream dropped");
        }
    }
}
