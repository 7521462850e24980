use std::sync::Arc;

use crate::error::StreamError;
use crate::models::{Attachment, FinalMessage, SessionStatus, WireEvent};
use crate::storage::MessageStore;
use crate::stream::scanner::ScanContext;
use crate::stream::session::StreamSession;

/// Turns a finished session into one persisted assistant message.
#[derive(Clone)]
pub struct TranscriptFinalizer {
    store: Arc<dyn MessageStore>,
}

impl TranscriptFinalizer {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Runs at most once per session; later calls get `DoubleFinalization`.
    pub async fn finalize(&self, session: &StreamSession) -> Result<FinalMessage, StreamError> {
        if !session.claim_finalization() {
            return Err(StreamError::DoubleFinalization(session.id().to_string()));
        }

        let message = build_final_message(
            session.id(),
            session.context(),
            session.status(),
            &session.events_snapshot(),
        );

        self.store
            .save(&message.conversation_id, &message)
            .await
            .map_err(|e| StreamError::Persistence {
                session_id: session.id().to_string(),
                reason: e.to_string(),
            })?;

        log::info!(
            "📝 Session {} finalized ({}, {} chars, {} attachments)",
            session.id(),
            message.status,
            message.content.len(),
            message.attachments.len()
        );

        Ok(message)
    }
}

pub fn build_final_message(
    session_id: &str,
    context: &ScanContext,
    status: SessionStatus,
    events: &[WireEvent],
) -> FinalMessage {
    let mut content = String::new();
    let mut attachments = Vec::new();

    for event in events {
        match event {
            WireEvent::TextDelta(delta) => content.push_str(&delta.content),
            WireEvent::Artifact(artifact) => attachments.push(Attachment::Artifact(artifact.clone())),
            WireEvent::Delegation(delegation) => {
                attachments.push(Attachment::Delegation(delegation.clone()))
            }
            WireEvent::Error(_) => {}
        }
    }

    FinalMessage {
        session_id: session_id.to_string(),
        conversation_id: context.conversation_id.clone(),
        user_id: context.user_id.clone(),
        role: "assistant".to_string(),
        content,
        attachments,
        status,
        created_at: chrono::Utc::now(),
    }
}
