use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

// ============================================================================
// Wire Events
// ============================================================================

/// The atomic unit delivered to clients, serialized as
/// `{"type": "text" | "artifact" | "delegation" | "error", "value": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum WireEvent {
    #[serde(rename = "text")]
    TextDelta(TextDelta),
    #[serde(rename = "artifact")]
    Artifact(ArtifactEvent),
    #[serde(rename = "delegation")]
    Delegation(DelegationEvent),
    #[serde(rename = "error")]
    Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDelta {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEvent {
    pub artifact_type: String,
    pub payload: serde_json::Value,
    pub metadata: ProvenanceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationEvent {
    pub from_agent: String,
    pub to_agent: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub reason: String,
}

impl WireEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self::TextDelta(TextDelta {
            content: content.into(),
        })
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            reason: reason.into(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta(_) => "text",
            Self::Artifact(_) => "artifact",
            Self::Delegation(_) => "delegation",
            Self::Error(_) => "error",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::TextDelta(delta) => Some(&delta.content),
            _ => None,
        }
    }
}

/// Where an artifact came from. Stamped on every artifact, inline or tool-produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceInfo {
    pub source_tool: String,
    pub user_id: String,
    pub conversation_id: String,
    pub timestamp_utc: String,
}

impl ProvenanceInfo {
    pub fn now(
        source_tool: impl Into<String>,
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            source_tool: source_tool.into(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            timestamp_utc: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ============================================================================
// Session Status
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// What the durable log knows about a session besides its events, so that
/// any instance can serve a resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub agent_name: String,
    pub status: SessionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Final frame of every wire stream. `status` is omitted for a normal completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<SessionStatus>,
}

impl DoneFrame {
    pub fn new(status: SessionStatus) -> Self {
        Self {
            frame_type: "done".to_string(),
            status: match status {
                SessionStatus::Completed => None,
                other => Some(other),
            },
        }
    }
}

// ============================================================================
// Transcript
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Attachment {
    Artifact(ArtifactEvent),
    Delegation(DelegationEvent),
}

/// Immutable record handed to the message store once a session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalMessage {
    pub session_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub status: SessionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// HTTP Request / Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResumeQuery {
    pub from: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub resumable_store: bool,
    pub active_sessions: usize,
    pub active_generations: usize,
}

impl HealthStatus {
    pub fn healthy(resumable_store: bool, active_sessions: usize, active_generations: usize) -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            resumable_store,
            active_sessions,
            active_generations,
        }
    }
}
