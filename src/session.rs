//! Streaming chat session: one in-flight completion at a time, delivered as a
//! stream of [`StreamEvent`]s and cancelable at any point.
//!
//! The returned [`ChatStream`] is driven by its consumer. Nothing is read from
//! the network unless the stream is polled, and a delta counts as delivered
//! only once the consumer has received it. That keeps the text reported by
//! [`StreamEvent::Cancelled`] equal to exactly what the caller has seen.
//!
//! History ordering under barge-in: [`StreamingChatSession::send`] settles a
//! superseded turn (committing its partial text) before appending the new user
//! message, so the transcript always reads user, assistant, user, ...

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ChatError;
use crate::metrics::{SessionStats, StreamMetrics};
use crate::sse::{parse_chunk, SseDecoder, SseFrame};
use crate::wire::{self, ChatMessage, ChatRequest};

pub const DEFAULT_BASE_URL: &str = "http://localhost:16070";
pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

// ---------------------------------------------------------------------------
// Options and configuration
// ---------------------------------------------------------------------------

/// Per-request generation options. Forwarded to the backend as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    pub system_prompt: Option<String>,
    /// Retrieved free text injected ahead of the system prompt.
    pub context: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Extra top-level request fields (`top_p`, `grammar`, ...).
    pub extra: Map<String, Value>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            context: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            extra: Map::new(),
        }
    }
}

impl ChatOptions {
    /// The system message content, if any: the system prompt prefixed with the
    /// retrieved context block.
    pub fn system_message(&self) -> Option<String> {
        let sys = non_blank(self.system_prompt.as_deref());
        let ctx = non_blank(self.context.as_deref());
        match (ctx, sys) {
            (Some(ctx), Some(sys)) => Some(format!("CONTEXT:\n{ctx}\n\n{sys}")),
            (Some(ctx), None) => Some(format!("CONTEXT:\n{ctx}")),
            (None, Some(sys)) => Some(sys.to_string()),
            (None, None) => None,
        }
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Backend root, e.g. `http://localhost:16070`.
    pub base_url: String,
    /// How many prior history messages are sent with each request.
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl SessionConfig {
    pub fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Build the request body for a new user turn.
///
/// `history` is the conversation *before* `user_text`; only its last
/// `history_limit` messages are included.
pub fn build_request(
    history: &[ChatMessage],
    user_text: &str,
    options: &ChatOptions,
    history_limit: usize,
) -> ChatRequest {
    let window = &history[history.len().saturating_sub(history_limit)..];
    let mut messages = Vec::with_capacity(window.len() + 2);
    if let Some(system) = options.system_message() {
        messages.push(ChatMessage::system(system));
    }
    messages.extend_from_slice(window);
    messages.push(ChatMessage::user(user_text));

    ChatRequest {
        messages,
        temperature: options.temperature,
        max_tokens: options.max_tokens,
        stream: true,
        extra: options.extra.clone(),
    }
}

// ---------------------------------------------------------------------------
// Events and state
// ---------------------------------------------------------------------------

/// Lifecycle of a single stream. Terminal phases behave like `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamPhase {
    #[default]
    Idle,
    /// Request issued, waiting for response headers.
    Sending,
    /// Reading and parsing the body.
    Streaming,
    Completed,
    Cancelled,
    Errored,
}

impl StreamPhase {
    pub fn is_active(self) -> bool {
        matches!(self, StreamPhase::Sending | StreamPhase::Streaming)
    }
}

/// What the consumer of a [`ChatStream`] receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One new piece of assistant text. `text` is everything so far.
    Delta { text: String, delta: String },
    /// Natural end of stream.
    Final { text: String, metrics: StreamMetrics },
    /// Stopped by `cancel()`, a newer `send()`, or dropping the stream.
    Cancelled { text: String, metrics: StreamMetrics },
    /// Network or HTTP failure. `partial` was not committed to history.
    Error { error: ChatError, partial: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Delta { .. })
    }

    /// Assistant text carried by the event.
    pub fn text(&self) -> &str {
        match self {
            StreamEvent::Delta { text, .. }
            | StreamEvent::Final { text, .. }
            | StreamEvent::Cancelled { text, .. } => text,
            StreamEvent::Error { partial, .. } => partial,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
    Errored,
}

#[derive(Debug)]
struct InFlight {
    id: Uuid,
    token: CancellationToken,
}

/// Conversation state owned by one session.
#[derive(Debug, Default)]
pub struct SessionState {
    history: Vec<ChatMessage>,
    in_flight: Option<InFlight>,
    cancelled: bool,
    accumulated_text: String,
    phase: StreamPhase,
    metrics: Option<StreamMetrics>,
    stats: SessionStats,
}

impl SessionState {
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn is_current(&self, id: Uuid) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.id == id)
    }

    fn begin(&mut self, id: Uuid, token: CancellationToken, user_text: &str) {
        self.history.push(ChatMessage::user(user_text));
        self.in_flight = Some(InFlight { id, token });
        self.cancelled = false;
        self.accumulated_text.clear();
        self.phase = StreamPhase::Sending;
        self.metrics = Some(StreamMetrics::start());
    }

    /// Close out turn `id`. Returns false if it was already settled.
    fn settle(&mut self, id: Uuid, outcome: Outcome, finished: Instant) -> bool {
        if !self.is_current(id) {
            return false;
        }
        self.in_flight = None;
        let text = std::mem::take(&mut self.accumulated_text);
        if let Some(m) = self.metrics.as_mut() {
            m.mark_finished(finished);
        }
        match outcome {
            Outcome::Completed => {
                self.history.push(ChatMessage::assistant(text));
                if let Some(m) = &self.metrics {
                    self.stats.record(m);
                }
                self.phase = StreamPhase::Completed;
            }
            Outcome::Cancelled => {
                if !text.is_empty() {
                    self.history.push(ChatMessage::assistant(text));
                }
                self.cancelled = true;
                self.phase = StreamPhase::Cancelled;
            }
            Outcome::Errored => {
                self.phase = StreamPhase::Errored;
            }
        }
        true
    }

    /// Cancel and settle whatever is in flight. Returns true if something was.
    fn abort_in_flight(&mut self) -> bool {
        let Some((id, token)) = self.in_flight.as_ref().map(|f| (f.id, f.token.clone())) else {
            return false;
        };
        token.cancel();
        self.settle(id, Outcome::Cancelled, Instant::now())
    }
}

type SharedState = Arc<Mutex<SessionState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// StreamingChatSession
// ---------------------------------------------------------------------------

/// A chat conversation against one backend.
///
/// All methods take `&self`, so `cancel()` and `send()` may be called from
/// inside the loop that consumes a previous [`ChatStream`].
pub struct StreamingChatSession {
    client: Client,
    config: SessionConfig,
    state: SharedState,
}

impl StreamingChatSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: SessionConfig) -> Self {
        Self {
            client,
            config,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a new assistant turn for `user_text`.
    ///
    /// Returns `None` (and does nothing) when the text is empty after
    /// trimming. Any stream still in flight is cancelled first.
    pub fn send(&self, user_text: &str, options: &ChatOptions) -> Option<ChatStream> {
        let text = user_text.trim();
        if text.is_empty() {
            debug!("ignoring empty message");
            return None;
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let payload = {
            let mut state = lock(&self.state);
            if state.abort_in_flight() {
                info!(stream = %id, "previous stream cancelled by new message");
            }
            let payload = build_request(&state.history, text, options, self.config.history_limit);
            state.begin(id, token.clone(), text);
            payload
        };
        debug!(
            stream = %id,
            messages = payload.messages.len(),
            temperature = payload.temperature,
            max_tokens = payload.max_tokens,
            "sending chat request"
        );

        let driver = StreamDriver {
            id,
            client: self.client.clone(),
            url: self.config.completions_url(),
            payload: Some(payload),
            token,
            state: Arc::clone(&self.state),
            response: None,
            decoder: SseDecoder::new(),
            queue: VecDeque::new(),
            text: String::new(),
            metrics: StreamMetrics::start(),
            finish_reason: None,
            body_done: false,
            finished: false,
        };
        Some(ChatStream::new(id, driver))
    }

    /// Cancel the in-flight stream, if any.
    ///
    /// Partial text is committed to history immediately; the stream's consumer
    /// sees [`StreamEvent::Cancelled`] on its next poll. Calling this when idle,
    /// or more than once, does nothing.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        if state.abort_in_flight() {
            info!("stream cancelled");
        }
    }

    /// Empty the history. An in-flight stream is left alone.
    pub fn clear_history(&self) {
        lock(&self.state).history.clear();
    }

    /// Replace the history, e.g. with an imported transcript.
    pub fn restore_history(&self, messages: Vec<ChatMessage>) {
        lock(&self.state).history = messages;
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.state).history.clone()
    }

    pub fn phase(&self) -> StreamPhase {
        lock(&self.state).phase
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.state).phase.is_active()
    }

    /// Text delivered so far for the in-progress turn.
    pub fn partial_text(&self) -> String {
        lock(&self.state).accumulated_text.clone()
    }

    /// Metrics of the current, or most recent, stream.
    pub fn metrics(&self) -> Option<StreamMetrics> {
        lock(&self.state).metrics
    }

    pub fn stats(&self) -> SessionStats {
        lock(&self.state).stats
    }

    pub fn was_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }
}

// ---------------------------------------------------------------------------
// ChatStream
// ---------------------------------------------------------------------------

/// Events for one assistant turn. Ends after its first terminal event.
pub struct ChatStream {
    id: Uuid,
    inner: BoxStream<'static, StreamEvent>,
}

impl ChatStream {
    fn new(id: Uuid, driver: StreamDriver) -> Self {
        let inner = stream::unfold(driver, |mut driver| async move {
            let event = driver.next_event().await?;
            Some((event, driver))
        })
        .boxed();
        Self { id, inner }
    }

    /// Identifier used in log lines for this stream.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream").field("id", &self.id).finish_non_exhaustive()
    }
}

enum Stop {
    Cancelled,
    Failed(ChatError),
}

struct StreamDriver {
    id: Uuid,
    client: Client,
    url: String,
    payload: Option<ChatRequest>,
    token: CancellationToken,
    state: SharedState,
    response: Option<Response>,
    decoder: SseDecoder,
    /// Parsed but not yet delivered deltas.
    queue: VecDeque<String>,
    text: String,
    metrics: StreamMetrics,
    /// Last `finish_reason` reported by the backend, for the completion log.
    finish_reason: Option<String>,
    /// `[DONE]` seen or body exhausted.
    body_done: bool,
    finished: bool,
}

impl StreamDriver {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        if self.token.is_cancelled() {
            return Some(self.finish_cancelled());
        }
        if let Some(delta) = self.queue.pop_front() {
            return Some(self.deliver(delta));
        }
        if self.body_done {
            return Some(self.finish_completed());
        }

        if self.response.is_none() {
            match self.connect().await {
                Ok(response) => {
                    self.response = Some(response);
                    let mut state = lock(&self.state);
                    if state.is_current(self.id) {
                        state.phase = StreamPhase::Streaming;
                    }
                }
                Err(Stop::Cancelled) => return Some(self.finish_cancelled()),
                Err(Stop::Failed(error)) => return Some(self.finish_error(error)),
            }
        }

        loop {
            let Some(response) = self.response.as_mut() else {
                return Some(self.finish_completed());
            };
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                chunk = response.chunk() => Some(chunk),
            };

            match next {
                None => return Some(self.finish_cancelled()),
                Some(Err(e)) => {
                    return Some(self.finish_error(ChatError::Transport(e.to_string())));
                }
                Some(Ok(None)) => {
                    if let Some(SseFrame::Data(payload)) = self.decoder.finish() {
                        self.accept(&payload);
                    }
                    self.end_body();
                }
                Some(Ok(Some(bytes))) => {
                    self.metrics.mark_first_byte(Instant::now());
                    for frame in self.decoder.push(&bytes) {
                        match frame {
                            SseFrame::Done => {
                                self.end_body();
                                break;
                            }
                            SseFrame::Data(payload) => self.accept(&payload),
                        }
                    }
                }
            }

            if let Some(delta) = self.queue.pop_front() {
                return Some(self.deliver(delta));
            }
            if self.body_done {
                return Some(self.finish_completed());
            }
        }
    }

    async fn connect(&mut self) -> Result<Response, Stop> {
        let Some(payload) = self.payload.take() else {
            return Err(Stop::Failed(ChatError::Transport("request already sent".into())));
        };
        self.metrics = StreamMetrics::start();
        {
            let mut state = lock(&self.state);
            if state.is_current(self.id) {
                state.metrics = Some(self.metrics);
            }
        }

        let request = self.client.post(&self.url).json(&payload).send();
        let response = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Stop::Cancelled),
            r = request => r,
        };
        let response = response.map_err(|e| Stop::Failed(ChatError::Transport(e.to_string())))?;

        let status = response.status();
        if status.is_success() {
            debug!(stream = %self.id, %status, "response headers received");
            return Ok(response);
        }

        let reason = status.canonical_reason().unwrap_or("error").to_string();
        let body = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Stop::Cancelled),
            text = response.text() => text.unwrap_or_default(),
        };
        let message = wire::error_message(&body, &reason);
        if status == StatusCode::SERVICE_UNAVAILABLE {
            Err(Stop::Failed(ChatError::Busy { message }))
        } else {
            Err(Stop::Failed(ChatError::Http { status: status.as_u16(), message }))
        }
    }

    fn accept(&mut self, payload: &str) {
        let Some(chunk) = parse_chunk(payload) else {
            return;
        };
        if let Some(reason) = chunk.finish_reason() {
            self.finish_reason = Some(reason.to_string());
        }
        if let Some(content) = chunk.content() {
            self.queue.push_back(content.to_string());
        }
    }

    fn end_body(&mut self) {
        self.body_done = true;
        self.response = None;
    }

    /// Hand one delta to the consumer.
    ///
    /// The cancellation check and the history-side append happen under the
    /// state lock, so a concurrent `cancel()` either sees this delta committed
    /// or the consumer never receives it.
    fn deliver(&mut self, delta: String) -> StreamEvent {
        {
            let mut state = lock(&self.state);
            if !state.is_current(self.id) || self.token.is_cancelled() {
                drop(state);
                return self.finish_cancelled();
            }
            self.text.push_str(&delta);
            self.metrics.record_delta();
            state.accumulated_text.push_str(&delta);
            state.metrics = Some(self.metrics);
        }
        StreamEvent::Delta { text: self.text.clone(), delta }
    }

    /// Close out the turn. Returns false when a `cancel()` (or a newer
    /// `send()`) settled it first.
    fn settle(&mut self, outcome: Outcome) -> bool {
        self.finished = true;
        self.response = None;
        self.queue.clear();
        let now = Instant::now();
        self.metrics.mark_finished(now);
        let mut state = lock(&self.state);
        if state.is_current(self.id) {
            state.metrics = Some(self.metrics);
        }
        state.settle(self.id, outcome, now)
    }

    fn finish_completed(&mut self) -> StreamEvent {
        if !self.settle(Outcome::Completed) {
            return self.cancelled_event();
        }
        info!(
            stream = %self.id,
            deltas = self.metrics.deltas,
            tps = self.metrics.tokens_per_second(),
            finish_reason = self.finish_reason.as_deref().unwrap_or("unknown"),
            "stream completed"
        );
        StreamEvent::Final { text: self.text.clone(), metrics: self.metrics }
    }

    fn finish_cancelled(&mut self) -> StreamEvent {
        self.settle(Outcome::Cancelled);
        self.cancelled_event()
    }

    fn cancelled_event(&self) -> StreamEvent {
        debug!(stream = %self.id, deltas = self.metrics.deltas, "stream cancelled");
        StreamEvent::Cancelled { text: self.text.clone(), metrics: self.metrics }
    }

    fn finish_error(&mut self, error: ChatError) -> StreamEvent {
        if !self.settle(Outcome::Errored) {
            return self.cancelled_event();
        }
        warn!(stream = %self.id, %error, "stream failed");
        StreamEvent::Error { error, partial: self.text.clone() }
    }
}

impl Drop for StreamDriver {
    fn drop(&mut self) {
        if !self.finished {
            self.token.cancel();
            self.settle(Outcome::Cancelled);
            debug!(stream = %self.id, "stream dropped before completion");
        }
    }
}
