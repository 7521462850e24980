use std::sync::Arc;

use crate::error::StreamError;
use crate::models::{DoneFrame, SessionStatus, WireEvent};
use crate::stream::session::{ReaderItem, SessionManager, SessionReader, StreamSession};

// ============================================================================
// Event Multiplexer
// ============================================================================

/// The only writer of a session. Every pushed event reaches the durable log
/// before any reader can observe it.
///
/// Not `Clone`: holding this value is what makes a task the session's producer.
pub struct EventMultiplexer {
    session: Arc<StreamSession>,
    manager: SessionManager,
}

impl EventMultiplexer {
    pub(crate) fn new(session: Arc<StreamSession>, manager: SessionManager) -> Self {
        Self { session, manager }
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    /// Append one event and wake every attached reader. Returns its offset.
    pub async fn push(&mut self, event: WireEvent) -> Result<u64, StreamError> {
        if self.session.status().is_terminal() {
            return Err(StreamError::SessionClosed(self.session.id().to_string()));
        }

        if self.session.is_resumable() {
            let expected = self.session.len();
            let store = self.manager.store();
            match self
                .manager
                .bounded(store.append(self.session.id(), &event))
                .await
            {
                Ok(offset) if offset == expected => {}
                Ok(offset) => self.session.degrade(&format!(
                    "{} store assigned offset {}, expected {}",
                    store.name(),
                    offset,
                    expected
                )),
                Err(e) => self.session.degrade(&e.to_string()),
            }
        }

        let kind = event.kind();
        let offset = self.session.commit(event)?;
        log::debug!(
            "Session {} <- {} event at offset {}",
            self.session.id(),
            kind,
            offset
        );
        Ok(offset)
    }

    pub async fn push_all(
        &mut self,
        events: impl IntoIterator<Item = WireEvent>,
    ) -> Result<(), StreamError> {
        for event in events {
            self.push(event).await?;
        }
        Ok(())
    }

    /// Reader from offset 0 fed by the in-process mirror. Take it before the
    /// first push to be sure the caller sees the whole session.
    pub fn subscribe(&self) -> Result<SessionReader, StreamError> {
        self.session.mirror_reader().ok_or_else(|| {
            StreamError::not_resumable(self.session.id(), "session already has its reader")
        })
    }

    /// Mark the session terminal and run the finalizer. `Ok(false)` if the
    /// session already ended, e.g. it was expired under the producer.
    pub async fn close(self, status: SessionStatus) -> Result<bool, StreamError> {
        self.manager.finish(&self.session, status).await
    }
}

// ============================================================================
// Wire Frames
// ============================================================================

/// One event-stream frame: `id: <offset>` (absent on the final frame) and a
/// single-line JSON `data` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub id: Option<String>,
    pub data: String,
}

impl WireFrame {
    pub fn event(offset: u64, event: &WireEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Some(offset.to_string()),
            data: serde_json::to_string(event)?,
        })
    }

    pub fn done(status: SessionStatus) -> Self {
        let data = serde_json::to_string(&DoneFrame::new(status))
            .unwrap_or_else(|_| r#"{"type":"done"}"#.to_string());
        Self { id: None, data }
    }

    pub fn from_item(item: &ReaderItem) -> Result<Self, serde_json::Error> {
        match item {
            ReaderItem::Event { offset, event } => Self::event(*offset, event),
            ReaderItem::End(status) => Ok(Self::done(*status)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.id.is_none()
    }

    /// Raw `text/event-stream` encoding.
    pub fn encode(&self) -> String {
        match &self.id {
            Some(id) => format!("id: {}\ndata: {}\n\n", id, self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}
