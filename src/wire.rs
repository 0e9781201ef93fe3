use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// -- Conversation -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn of the conversation, in the shape the completion endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

// -- Chat completion request / SSE chunk ------------------------------------

/// Body of `POST /v1/chat/completions`.
///
/// `extra` is flattened into the top-level object so callers can forward any
/// generation parameter the backend understands (`top_p`, `grammar`,
/// `reasoning_effort`, ...) without this crate knowing about it.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One `data:` payload of a streamed completion.
#[derive(Debug, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl CompletionChunk {
    /// `choices[0].delta.content`, when present and non-empty.
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// `choices[0].finish_reason`, sent on the last content chunk.
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }
}

// -- Error bodies -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Nested { error: ErrorDetail },
    Flat { message: String },
}

/// Best-effort human message from a non-2xx response body.
///
/// Understands `{"error":{"message":..}}` and `{"message":..}`; anything else
/// is returned trimmed, falling back to `fallback` when the body is empty.
pub fn error_message(body: &str, fallback: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody::Nested { error }) => error.message,
        Ok(ErrorBody::Flat { message }) => message,
        Err(_) if body.trim().is_empty() => fallback.to_string(),
        Err(_) => body.trim().to_string(),
    }
}

// -- Health / model profile endpoints ---------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub active: u64,
    pub total: u64,
    pub available: u64,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub model_ready: Option<bool>,
    #[serde(default)]
    pub current_profile: Option<String>,
    #[serde(default)]
    pub capacity: Option<Capacity>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize)]
pub struct SwitchRequest {
    pub profile: String,
}

/// Body of `POST /v1/models/switch`.
#[derive(Debug, Deserialize)]
pub struct SwitchResponse {
    pub status: String,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
