use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::error::StreamError;
use crate::models::{ProvenanceInfo, SessionStatus, WireEvent};
use crate::stream::cancel::{CancellationToken, RequestManager};
use crate::stream::multiplexer::EventMultiplexer;
use crate::stream::normalizer::normalize;
use crate::stream::scanner::{MarkerScanner, ScanContext};
use crate::stream::session::{SessionManager, SessionReader};
use crate::stream::source::{SourceItem, TokenSource};

// ============================================================================
// STREAM SERVICE
// ============================================================================

/// Entry point tying a token source to a session: scanning, normalizing,
/// multiplexing and finalizing happen in one spawned producer per session.
#[derive(Clone)]
pub struct StreamService {
    sessions: SessionManager,
    requests: Arc<RequestManager>,
}

impl StreamService {
    pub fn new(sessions: SessionManager) -> Self {
        Self {
            sessions,
            requests: Arc::new(RequestManager::new()),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn requests(&self) -> &Arc<RequestManager> {
        &self.requests
    }

    /// Create a session and start pumping `source` into it. The returned id
    /// is valid for `resume_session` immediately.
    pub async fn start_session(&self, source: TokenSource, context: ScanContext) -> String {
        self.spawn_session(source, context).await.0
    }

    /// Like `start_session`, also handing back the producer task.
    pub async fn spawn_session(
        &self,
        source: TokenSource,
        context: ScanContext,
    ) -> (String, JoinHandle<SessionStatus>) {
        let mux = self.sessions.create(context.clone()).await;
        let session_id = mux.session_id().to_string();
        let handle = self.launch(mux, source, context).await;
        (session_id, handle)
    }

    /// Start a session together with its first reader, fed from the
    /// in-process mirror so a slow durable log cannot hold it back.
    pub async fn open_session(
        &self,
        source: TokenSource,
        context: ScanContext,
    ) -> Result<(String, SessionReader), StreamError> {
        let mux = self.sessions.create(context.clone()).await;
        let session_id = mux.session_id().to_string();
        let reader = mux.subscribe()?;
        self.launch(mux, source, context).await;
        Ok((session_id, reader))
    }

    async fn launch(
        &self,
        mux: EventMultiplexer,
        source: TokenSource,
        context: ScanContext,
    ) -> JoinHandle<SessionStatus> {
        let session_id = mux.session_id().to_string();
        // the session's own token, so expiry stops the producer too
        let token = mux.session().cancellation().clone();
        self.requests.register(session_id.clone(), token.clone()).await;
        let requests = self.requests.clone();

        tokio::spawn(async move {
            let status = produce(mux, source, MarkerScanner::new(context), token).await;
            requests.unregister(&session_id).await;
            status
        })
    }

    pub async fn resume_session(
        &self,
        session_id: &str,
        from: Option<u64>,
    ) -> Result<SessionReader, StreamError> {
        self.sessions.attach(session_id, from).await
    }

    /// Ask a running producer to stop. False when nothing is producing.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let cancelled = self.requests.cancel(session_id).await;
        if cancelled {
            log::info!("🛑 Cancellation requested for session {}", session_id);
        }
        cancelled
    }
}

async fn produce(
    mut mux: EventMultiplexer,
    source: TokenSource,
    scanner: MarkerScanner,
    token: CancellationToken,
) -> SessionStatus {
    let session_id = mux.session_id().to_string();
    let session = mux.session().clone();
    let status = pump(&mut mux, source, scanner, &token).await;

    match mux.close(status).await {
        Ok(true) => {}
        Ok(false) => log::debug!("Session {} was already closed", session_id),
        Err(e) => log::error!("❌ Failed to close session {}: {}", session_id, e),
    }
    session.status()
}

async fn pump(
    mux: &mut EventMultiplexer,
    mut source: TokenSource,
    mut scanner: MarkerScanner,
    token: &CancellationToken,
) -> SessionStatus {
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = mux.push_all(scanner.flush()).await;
                return SessionStatus::Cancelled;
            }
            item = source.next() => item,
        };

        let pushed = match item {
            Some(Ok(SourceItem::Text(text))) => mux.push_all(scanner.feed(&text)).await,
            Some(Ok(SourceItem::ToolResult(tool))) => {
                // text held back as a possible tag prefix stays in the scanner
                // and is emitted after this artifact
                let ctx = scanner.context();
                let provenance =
                    ProvenanceInfo::now(&tool.tool_name, &ctx.user_id, &ctx.conversation_id);
                let artifact = normalize(&tool.tool_name, tool.result, provenance);
                mux.push(WireEvent::Artifact(artifact)).await.map(|_| ())
            }
            Some(Ok(SourceItem::End)) => {
                return match mux.push_all(scanner.flush()).await {
                    Ok(()) => SessionStatus::Completed,
                    Err(_) => SessionStatus::Failed,
                };
            }
            Some(Err(e)) => {
                return fail(mux, &mut scanner, StreamError::UpstreamSource(e.to_string())).await;
            }
            None => {
                let error = StreamError::UpstreamSource(
                    "source closed without an end-of-turn signal".to_string(),
                );
                return fail(mux, &mut scanner, error).await;
            }
        };

        if let Err(e) = pushed {
            log::warn!("⚠️  Session {} stopped accepting events: {}", mux.session_id(), e);
            return SessionStatus::Failed;
        }
    }
}

async fn fail(
    mux: &mut EventMultiplexer,
    scanner: &mut MarkerScanner,
    error: StreamError,
) -> SessionStatus {
    log::warn!("⚠️  Session {} failed: {}", mux.session_id(), error);
    let _ = mux.push_all(scanner.flush()).await;
    let _ = mux.push(WireEvent::error(error.to_string())).await;
    SessionStatus::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{Attachment, SessionRecord};
    use crate::storage::{EventLog, MemoryEventLog, MemoryMessageStore};
    use async_trait::async_trait;
    use std::time::Duration;
    use crate::stream::finalizer::TranscriptFinalizer;
    use crate::stream::session::{ReaderItem, SessionConfig};
    use crate::stream::source::{SourceError, channel_source, scripted_source};
    use serde_json::json;

    fn context() -> ScanContext {
        ScanContext {
            agent_name: "assistant".to_string(),
            user_id: "u1".to_string(),
            conversation_id: "c1".to_string(),
        }
    }

    fn service() -> (StreamService, Arc<MemoryMessageStore>) {
        let messages = Arc::new(MemoryMessageStore::new());
        let manager = SessionManager::new(
            Arc::new(MemoryEventLog::new()),
            TranscriptFinalizer::new(messages.clone()),
            SessionConfig::default(),
        );
        (StreamService::new(manager), messages)
    }

    async fn collect(reader: &mut SessionReader) -> (Vec<WireEvent>, SessionStatus) {
        let mut events = Vec::new();
        while let Some(item) = reader.next_event().await {
            match item {
                ReaderItem::Event { event, .. } => events.push(event),
                ReaderItem::End(status) => return (events, status),
            }
        }
        panic!("reader ended without End");
    }

    #[tokio::test]
    async fn test_markers_split_across_items_reach_reader_and_transcript() {
        let (service, messages) = service();
        let source = scripted_source(vec![
            SourceItem::Text("Here <artifact type=\"ch".to_string()),
            SourceItem::Text("art\">{\"x\":1}</artifact> done".to_string()),
            SourceItem::ToolResult(crate::stream::source::ToolResult {
                tool_name: "calc".to_string(),
                result: json!(42),
            }),
            SourceItem::End,
        ]);

        let (id, handle) = service.spawn_session(source, context()).await;
        assert_eq!(handle.await.unwrap(), SessionStatus::Completed);

        let mut reader = service.resume_session(&id, None).await.unwrap();
        let (events, status) = collect(&mut reader).await;
        assert_eq!(status, SessionStatus::Completed);

        let text: String = events.iter().filter_map(|e| e.as_text()).collect();
        assert_eq!(text, "Here  done");
        let artifacts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WireEvent::Artifact(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].artifact_type, "chart");
        assert_eq!(artifacts[0].payload, json!({"x": 1}));
        assert_eq!(artifacts[1].artifact_type, "calc");
        assert_eq!(artifacts[1].metadata.source_tool, "calc");

        let saved = messages.messages().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].1.content, "Here  done");
        assert!(matches!(saved[0].1.attachments[0], Attachment::Artifact(_)));
    }

    #[tokio::test]
    async fn test_source_error_fails_session_with_error_event() {
        let (service, messages) = service();
        let (sender, source) = channel_source(8);
        let (id, handle) = service.spawn_session(source, context()).await;

        sender.text("partial").await;
        sender.fail(SourceError::Transport("reset".to_string())).await;
        assert_eq!(handle.await.unwrap(), SessionStatus::Failed);

        let mut reader = service.resume_session(&id, None).await.unwrap();
        let (events, status) = collect(&mut reader).await;
        assert_eq!(status, SessionStatus::Failed);
        assert_eq!(events[0], WireEvent::text("partial"));
        assert!(matches!(events.last(), Some(WireEvent::Error(_))));

        let saved = messages.messages().await;
        assert_eq!(saved[0].1.content, "partial");
        assert_eq!(saved[0].1.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_source_closing_without_end_is_a_failure() {
        let (service, _) = service();
        let (sender, source) = channel_source(8);
        let (_, handle) = service.spawn_session(source, context()).await;

        sender.text("cut <delegate to=\"x\">").await;
        drop(sender);
        assert_eq!(handle.await.unwrap(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_stops_a_blocked_producer() {
        let (service, messages) = service();
        let (sender, source) = channel_source(8);
        let (id, handle) = service.spawn_session(source, context()).await;

        sender.text("so far").await;
        let mut reader = service.resume_session(&id, None).await.unwrap();
        assert_eq!(
            reader.next_event().await,
            Some(ReaderItem::Event { offset: 0, event: WireEvent::text("so far") })
        );

        assert!(service.cancel(&id).await);
        assert_eq!(handle.await.unwrap(), SessionStatus::Cancelled);
        assert_eq!(
            reader.next_event().await,
            Some(ReaderItem::End(SessionStatus::Cancelled))
        );

        assert!(!service.cancel(&id).await);
        assert_eq!(messages.count_for_session(&id).await, 1);
        drop(sender);
    }

    #[tokio::test]
    async fn test_tool_result_overtakes_held_back_tag_prefix() {
        let (service, _) = service();
        let source = scripted_source(vec![
            SourceItem::Text("see <".to_string()),
            SourceItem::ToolResult(crate::stream::source::ToolResult {
                tool_name: "search".to_string(),
                result: json!({"hits": 2}),
            }),
            SourceItem::Text("b>".to_string()),
            SourceItem::End,
        ]);

        let (id, handle) = service.spawn_session(source, context()).await;
        assert_eq!(handle.await.unwrap(), SessionStatus::Completed);

        let mut reader = service.resume_session(&id, None).await.unwrap();
        let (events, _) = collect(&mut reader).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["text", "artifact", "text"]);
        assert_eq!(events[0], WireEvent::text("see "));
        assert_eq!(events[2], WireEvent::text("<b>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaping_idle_session_stops_its_producer() {
        let (service, messages) = service();
        let (sender, source) = channel_source(8);
        let (id, handle) = service.spawn_session(source, context()).await;
        assert_eq!(service.requests().active_count().await, 1);

        tokio::time::advance(SessionConfig::default().grace_period + Duration::from_secs(1)).await;
        assert_eq!(service.sessions().reap_expired().await, vec![id.clone()]);

        assert_eq!(handle.await.unwrap(), SessionStatus::Failed);
        assert_eq!(service.requests().active_count().await, 0);
        assert!(!service.cancel(&id).await);
        assert_eq!(messages.count_for_session(&id).await, 1);
        drop(sender);
    }

    /// Log whose reads never return.
    struct WriteOnlyLog(MemoryEventLog);

    #[async_trait]
    impl EventLog for WriteOnlyLog {
        fn name(&self) -> &'static str {
            "write-only"
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }
        async fn append(&self, session_id: &str, event: &WireEvent) -> Result<u64, StoreError> {
            self.0.append(session_id, event).await
        }
        async fn read_from(&self, _: &str, _: u64) -> Result<Vec<WireEvent>, StoreError> {
            std::future::pending().await
        }
        async fn put_record(&self, record: &SessionRecord) -> Result<(), StoreError> {
            self.0.put_record(record).await
        }
        async fn get_record(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
            self.0.get_record(session_id).await
        }
        async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
            self.0.delete(session_id).await
        }
    }

    #[tokio::test]
    async fn test_open_session_streams_without_reading_the_log() {
        let messages = Arc::new(MemoryMessageStore::new());
        let manager = SessionManager::new(
            Arc::new(WriteOnlyLog(MemoryEventLog::new())),
            TranscriptFinalizer::new(messages.clone()),
            SessionConfig {
                attach_timeout: Duration::from_millis(100),
                ..SessionConfig::default()
            },
        );
        let service = StreamService::new(manager);
        let source = scripted_source(vec![
            SourceItem::Text("all ".to_string()),
            SourceItem::Text("here".to_string()),
            SourceItem::End,
        ]);

        let (id, mut reader) = service.open_session(source, context()).await.unwrap();
        let (events, status) = collect(&mut reader).await;
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(events, vec![WireEvent::text("all "), WireEvent::text("here")]);

        // the log-backed path is what stalls
        let resumed = service.resume_session(&id, None).await;
        assert!(matches!(resumed, Err(StreamError::StoreUnavailable(_))));
    }
}
