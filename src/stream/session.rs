use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{StoreError, StreamError};
use crate::models::{SessionRecord, SessionStatus, WireEvent};
use crate::storage::EventLog;
use crate::stream::cancel::CancellationToken;
use crate::stream::finalizer::TranscriptFinalizer;
use crate::stream::multiplexer::EventMultiplexer;
use crate::stream::scanner::ScanContext;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a finished (or idle, unattended) session stays replayable.
    pub grace_period: Duration,
    /// Upper bound on any durable-store call made while creating or attaching.
    pub attach_timeout: Duration,
    pub reaper_interval: Duration,
    /// How often a reader following another instance's session polls the log.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            attach_timeout: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

// ============================================================================
// Stream Session
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    committed: u64,
    status: SessionStatus,
}

struct SessionInner {
    status: SessionStatus,
    /// In-process mirror of the durable log, in offset order.
    events: Vec<WireEvent>,
    last_activity: Instant,
    completed_at: Option<Instant>,
    /// Non-resumable sessions hand their stream to exactly one reader.
    claimed: bool,
}

/// One logical generation: an append-only event sequence plus its status.
pub struct StreamSession {
    id: String,
    context: ScanContext,
    created_at: chrono::DateTime<chrono::Utc>,
    resumable: AtomicBool,
    finalized: AtomicBool,
    readers: AtomicUsize,
    cancellation: CancellationToken,
    inner: Mutex<SessionInner>,
    progress: watch::Sender<Progress>,
}

impl StreamSession {
    fn new(id: String, context: ScanContext) -> Self {
        let (progress, _) = watch::channel(Progress {
            committed: 0,
            status: SessionStatus::Active,
        });
        Self {
            id,
            context,
            created_at: chrono::Utc::now(),
            resumable: AtomicBool::new(true),
            finalized: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            cancellation: CancellationToken::new(),
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Active,
                events: Vec::new(),
                last_activity: Instant::now(),
                completed_at: None,
                claimed: false,
            }),
            progress,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &ScanContext {
        &self.context
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable.load(Ordering::Acquire)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Tripped when the session is expired while its producer still runs.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn len(&self) -> u64 {
        self.lock().events.len() as u64
    }

    pub fn events_snapshot(&self) -> Vec<WireEvent> {
        self.lock().events.clone()
    }

    /// The durable view of this session, as other instances will read it.
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.id.clone(),
            user_id: self.context.user_id.clone(),
            conversation_id: self.context.conversation_id.clone(),
            agent_name: self.context.agent_name.clone(),
            status: self.status(),
            created_at: self.created_at,
        }
    }

    fn events_from(&self, offset: u64) -> Vec<WireEvent> {
        let inner = self.lock();
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(inner.events.len());
        inner.events[start..].to_vec()
    }

    pub(crate) fn degrade(&self, reason: &str) {
        if self.resumable.swap(false, Ordering::AcqRel) {
            // whoever is attached now keeps the stream; nobody new gets it
            self.lock().claimed = true;
            log::warn!(
                "⚠️  Session {} is no longer resumable: {}",
                self.id,
                reason
            );
        }
    }

    /// Appends to the mirror and wakes readers. Returns the event's offset.
    pub(crate) fn commit(&self, event: WireEvent) -> Result<u64, StreamError> {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            return Err(StreamError::SessionClosed(self.id.clone()));
        }
        inner.events.push(event);
        inner.last_activity = Instant::now();
        let committed = inner.events.len() as u64;
        let status = inner.status;
        self.progress.send_replace(Progress { committed, status });
        Ok(committed - 1)
    }

    /// Moves an active session to `status`. Only the first caller wins.
    pub(crate) fn try_finish(&self, status: SessionStatus) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            return false;
        }
        inner.status = status;
        inner.completed_at = Some(Instant::now());
        let committed = inner.events.len() as u64;
        self.progress.send_replace(Progress { committed, status });
        true
    }

    /// Non-resumable sessions: the first reader at offset 0 gets the buffered
    /// events, everyone after that is refused.
    fn claim_sole_reader(&self, from: u64) -> Option<Vec<WireEvent>> {
        let mut inner = self.lock();
        if from != 0 || inner.claimed {
            return None;
        }
        inner.claimed = true;
        Some(inner.events.clone())
    }

    /// Reader at offset 0 served from the in-process mirror, without touching
    /// the durable log. `None` once a non-resumable session is claimed.
    pub(crate) fn mirror_reader(self: &Arc<Self>) -> Option<SessionReader> {
        let progress = self.progress.subscribe();
        let replay = if self.is_resumable() {
            self.events_from(0)
        } else {
            self.claim_sole_reader(0)?
        };
        Some(SessionReader::local(self.clone(), 0, replay, progress))
    }

    pub(crate) fn claim_finalization(&self) -> bool {
        !self.finalized.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    fn is_expired(&self, now: Instant, grace: Duration) -> bool {
        if self.reader_count() > 0 {
            return false;
        }
        let inner = self.lock();
        match inner.completed_at {
            Some(completed_at) => {
                self.is_finalized() && now.saturating_duration_since(completed_at) >= grace
            }
            None => now.saturating_duration_since(inner.last_activity) >= grace,
        }
    }
}

// ============================================================================
// Session Reader
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderItem {
    Event { offset: u64, event: WireEvent },
    End(SessionStatus),
}

enum Cursor {
    /// Session produced on this instance: woken by every commit.
    Local {
        session: Arc<StreamSession>,
        progress: watch::Receiver<Progress>,
    },
    /// Session produced elsewhere: followed by polling the durable log.
    Durable {
        store: Arc<dyn EventLog>,
        poll_interval: Duration,
        idle_limit: Duration,
        last_seen: Instant,
    },
}

/// An independent cursor over one session: replayed events first, then live
/// ones, with no visible seam between the two.
pub struct SessionReader {
    session_id: String,
    cursor: Cursor,
    next_offset: u64,
    pending: VecDeque<WireEvent>,
    finished: bool,
}

impl SessionReader {
    fn local(
        session: Arc<StreamSession>,
        from: u64,
        replay: Vec<WireEvent>,
        progress: watch::Receiver<Progress>,
    ) -> Self {
        session.readers.fetch_add(1, Ordering::AcqRel);
        Self {
            session_id: session.id().to_string(),
            cursor: Cursor::Local { session, progress },
            next_offset: from,
            pending: replay.into(),
            finished: false,
        }
    }

    fn durable(
        session_id: &str,
        from: u64,
        replay: Vec<WireEvent>,
        store: Arc<dyn EventLog>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            cursor: Cursor::Durable {
                store,
                poll_interval: config.poll_interval,
                idle_limit: config.grace_period,
                last_seen: Instant::now(),
            },
            next_offset: from,
            pending: replay.into(),
            finished: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Offset of the next event this reader will yield.
    pub fn position(&self) -> u64 {
        self.next_offset
    }

    /// Waits for the next event; yields `End` once after the last one, then `None`.
    pub async fn next_event(&mut self) -> Option<ReaderItem> {
        if self.finished {
            return None;
        }

        loop {
            if let Some(event) = self.pending.pop_front() {
                let offset = self.next_offset;
                self.next_offset += 1;
                return Some(ReaderItem::Event { offset, event });
            }

            let end = match &mut self.cursor {
                Cursor::Local { session, progress } => {
                    let current = *progress.borrow_and_update();
                    if self.next_offset < current.committed {
                        self.pending = session.events_from(self.next_offset).into();
                        continue;
                    }
                    if current.status.is_terminal() {
                        current.status
                    } else if progress.changed().await.is_ok() {
                        continue;
                    } else {
                        SessionStatus::Failed
                    }
                }
                Cursor::Durable {
                    store,
                    poll_interval,
                    idle_limit,
                    last_seen,
                } => {
                    // status first: a terminal record is written after the last event
                    let status = match store.get_record(&self.session_id).await {
                        Ok(record) => record.map(|r| r.status),
                        Err(e) => {
                            log::warn!("Lost durable log of session {}: {}", self.session_id, e);
                            Some(SessionStatus::Failed)
                        }
                    };
                    match store.read_from(&self.session_id, self.next_offset).await {
                        Ok(events) if !events.is_empty() => {
                            *last_seen = Instant::now();
                            self.pending = events.into();
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("Lost durable log of session {}: {}", self.session_id, e);
                            self.finished = true;
                            return Some(ReaderItem::End(SessionStatus::Failed));
                        }
                    }
                    match status {
                        Some(status) if status.is_terminal() => status,
                        Some(_) if last_seen.elapsed() < *idle_limit => {
                            tokio::time::sleep(*poll_interval).await;
                            continue;
                        }
                        // record deleted, or its writer went silent
                        _ => SessionStatus::Failed,
                    }
                }
            };

            self.finished = true;
            return Some(ReaderItem::End(end));
        }
    }
}

impl Drop for SessionReader {
    fn drop(&mut self) {
        if let Cursor::Local { session, .. } = &self.cursor {
            session.readers.fetch_sub(1, Ordering::AcqRel);
            session.touch();
        }
        log::debug!(
            "Reader detached from session {} at offset {}",
            self.session_id,
            self.next_offset
        );
    }
}

// ============================================================================
// Session Manager
// ============================================================================

struct ManagerInner {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    store: Arc<dyn EventLog>,
    finalizer: TranscriptFinalizer,
    config: SessionConfig,
}

/// Owns every live session on this instance and serves resumes of sessions
/// produced elsewhere from the shared durable log.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn EventLog>,
        finalizer: TranscriptFinalizer,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                store,
                finalizer,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn EventLog> {
        &self.inner.store
    }

    pub async fn active_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<StreamSession>> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    /// Run one durable-store call under `attach_timeout`.
    pub(crate) async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.inner.config.attach_timeout;
        tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            Err(StoreError::Unavailable(format!(
                "{} store did not answer within {:?}",
                self.inner.store.name(),
                limit
            )))
        })
    }

    /// Allocates a session and returns its single writer. Falls back to
    /// non-resumable mode when the durable log does not answer.
    pub async fn create(&self, context: ScanContext) -> EventMultiplexer {
        let id = Uuid::now_v7().to_string();
        let store = &self.inner.store;
        let session = Arc::new(StreamSession::new(id.clone(), context));

        let registered = match self.bounded(store.ping()).await {
            Ok(()) => self.bounded(store.put_record(&session.record())).await,
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            session.resumable.store(false, Ordering::Release);
            log::warn!("⚠️  Session {} starts non-resumable: {}", id, e);
        }

        self.inner
            .sessions
            .write()
            .await
            .insert(id.clone(), session.clone());

        log::info!(
            "📡 Session {} created (store: {}, resumable: {})",
            id,
            store.name(),
            session.is_resumable()
        );

        EventMultiplexer::new(session, self.clone())
    }

    /// Attach a reader starting at `from` (default 0).
    pub async fn attach(
        &self,
        session_id: &str,
        from: Option<u64>,
    ) -> Result<SessionReader, StreamError> {
        let from = from.unwrap_or(0);
        let Some(session) = self.get(session_id).await else {
            return self.attach_durable(session_id, from).await;
        };

        // Subscribe before reading anything so no commit can slip between
        // the replay snapshot and live delivery.
        let progress = session.progress.subscribe();

        let replay = if session.is_resumable() {
            let committed = session.len();
            if from > committed {
                return Err(StreamError::not_resumable(
                    session_id,
                    format!("offset {} is beyond the {} events written", from, committed),
                ));
            }
            self.bounded(self.inner.store.read_from(session_id, from))
                .await?
        } else {
            session.claim_sole_reader(from).ok_or_else(|| {
                StreamError::not_resumable(session_id, "session runs without a durable log")
            })?
        };

        log::info!(
            "🔌 Reader attached to session {} at offset {} ({} replayed)",
            session_id,
            from,
            replay.len()
        );

        Ok(SessionReader::local(session, from, replay, progress))
    }

    /// Resume a session this instance does not hold, straight from the log.
    async fn attach_durable(&self, session_id: &str, from: u64) -> Result<SessionReader, StreamError> {
        let store = &self.inner.store;
        let record = self
            .bounded(store.get_record(session_id))
            .await?
            .ok_or_else(|| {
                StreamError::not_resumable(session_id, "session is unknown or has expired")
            })?;

        let mut events = self.bounded(store.read_from(session_id, 0)).await?;
        let written = events.len() as u64;
        if from > written {
            return Err(StreamError::not_resumable(
                session_id,
                format!("offset {} is beyond the {} events written", from, written),
            ));
        }
        let start = usize::try_from(from).unwrap_or(events.len());
        let replay = events.split_off(start);

        log::info!(
            "🔌 Reader attached to session {} from the {} log at offset {} ({} replayed, {})",
            session_id,
            store.name(),
            from,
            replay.len(),
            record.status
        );

        Ok(SessionReader::durable(
            session_id,
            from,
            replay,
            store.clone(),
            &self.inner.config,
        ))
    }

    /// User that started the session, wherever it is produced.
    pub async fn owner_of(&self, session_id: &str) -> Option<String> {
        if let Some(session) = self.get(session_id).await {
            return Some(session.context().user_id.clone());
        }
        match self.bounded(self.inner.store.get_record(session_id)).await {
            Ok(record) => record.map(|r| r.user_id),
            Err(_) => None,
        }
    }

    /// Moves the session to a terminal status and runs the finalizer.
    /// Returns `Ok(false)` when the session had already ended.
    pub async fn mark_completed(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<bool, StreamError> {
        let session = self.get(session_id).await.ok_or_else(|| {
            StreamError::not_resumable(session_id, "session is unknown or has expired")
        })?;
        self.finish(&session, status).await
    }

    pub(crate) async fn finish(
        &self,
        session: &Arc<StreamSession>,
        status: SessionStatus,
    ) -> Result<bool, StreamError> {
        if !session.try_finish(status) {
            log::debug!(
                "Session {} already terminal, ignoring {}",
                session.id(),
                status
            );
            return Ok(false);
        }

        log::info!("🏁 Session {} ended: {}", session.id(), status);

        if session.is_resumable() {
            if let Err(e) = self.bounded(self.inner.store.put_record(&session.record())).await {
                log::warn!(
                    "⚠️  Could not record end of session {}: {}",
                    session.id(),
                    e
                );
            }
        }

        match self.inner.finalizer.finalize(session).await {
            Ok(_) => Ok(true),
            Err(StreamError::DoubleFinalization(_)) => Ok(false),
            Err(e) => {
                log::error!("Finalization failed for session {}: {}", session.id(), e);
                Err(e)
            }
        }
    }

    /// Drops the session and its durable log. Active sessions are failed and
    /// their producer is told to stop.
    pub async fn expire(&self, session_id: &str) -> bool {
        if let Some(session) = self.get(session_id).await {
            if !session.status().is_terminal() {
                session.cancellation().cancel();
                let _ = self.finish(&session, SessionStatus::Failed).await;
            }
        }

        let removed = self.inner.sessions.write().await.remove(session_id);
        if removed.is_none() {
            return false;
        }

        if let Err(e) = self.inner.store.delete(session_id).await {
            log::warn!("Failed to delete log for session {}: {}", session_id, e);
        }
        log::info!("🧹 Session {} expired", session_id);
        true
    }

    /// Expire every session past its grace period. Returns the expired ids.
    pub async fn reap_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let grace = self.inner.config.grace_period;

        let candidates: Vec<String> = self
            .inner
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.is_expired(now, grace))
            .map(|session| session.id().to_string())
            .collect();

        let mut expired = Vec::new();
        for id in candidates {
            if self.expire(&id).await {
                expired.push(id);
            }
        }
        expired
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.inner.config.reaper_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = manager.reap_expired().await;
                if !expired.is_empty() {
                    log::info!("Reaper expired {} session(s)", expired.len());
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryEventLog, MemoryMessageStore, UnavailableEventLog};
    use std::sync::atomic::AtomicU64;
    use async_trait::async_trait;
    use tokio_test::{assert_pending, assert_ready};

    fn context() -> ScanContext {
        ScanContext {
            agent_name: "assistant".to_string(),
            user_id: "u1".to_string(),
            conversation_id: "c1".to_string(),
        }
    }

    fn manager_with(store: Arc<dyn EventLog>) -> (SessionManager, Arc<MemoryMessageStore>) {
        let messages = Arc::new(MemoryMessageStore::new());
        let manager = SessionManager::new(
            store,
            TranscriptFinalizer::new(messages.clone()),
            SessionConfig {
                grace_period: Duration::from_secs(60),
                attach_timeout: Duration::from_millis(200),
                reaper_interval: Duration::from_secs(1),
                poll_interval: Duration::from_millis(10),
            },
        );
        (manager, messages)
    }

    async fn drain(reader: &mut SessionReader) -> (Vec<(u64, WireEvent)>, SessionStatus) {
        let mut events = Vec::new();
        loop {
            match reader.next_event().await {
                Some(ReaderItem::Event { offset, event }) => events.push((offset, event)),
                Some(ReaderItem::End(status)) => return (events, status),
                None => panic!("reader ended without End"),
            }
        }
    }

    /// Log that accepts writes but never returns from reads.
    #[derive(Default)]
    struct StalledLog {
        appended: AtomicU64,
    }

    #[async_trait]
    impl EventLog for StalledLog {
        fn name(&self) -> &'static str {
            "stalled"
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn append(&self, _: &str, _: &WireEvent) -> Result<u64, StoreError> {
            Ok(self.appended.fetch_add(1, Ordering::AcqRel))
        }
        async fn put_record(&self, _: &SessionRecord) -> Result<(), StoreError> {
            Ok(())
        }
        async fn get_record(&self, _: &str) -> Result<Option<SessionRecord>, StoreError> {
            Ok(None)
        }
        async fn read_from(&self, _: &str, _: u64) -> Result<Vec<WireEvent>, StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_attach_replays_then_goes_live() {
        let (manager, _) = manager_with(Arc::new(MemoryEventLog::new()));
        let mut writer = manager.create(context()).await;
        let id = writer.session_id().to_string();

        for i in 0..3 {
            writer.push(WireEvent::text(format!("e{}", i))).await.unwrap();
        }

        let mut reader = manager.attach(&id, Some(1)).await.unwrap();
        assert_eq!(
            reader.next_event().await,
            Some(ReaderItem::Event { offset: 1, event: WireEvent::text("e1") })
        );
        assert_eq!(
            reader.next_event().await,
            Some(ReaderItem::Event { offset: 2, event: WireEvent::text("e2") })
        );

        {
            let mut next = tokio_test::task::spawn(reader.next_event());
            assert_pending!(next.poll());
            writer.push(WireEvent::text("e3")).await.unwrap();
            assert!(next.is_woken());
            let item = assert_ready!(next.poll());
            assert_eq!(
                item,
                Some(ReaderItem::Event { offset: 3, event: WireEvent::text("e3") })
            );
        }

        writer.close(SessionStatus::Completed).await.unwrap();
        assert_eq!(
            reader.next_event().await,
            Some(ReaderItem::End(SessionStatus::Completed))
        );
        assert_eq!(reader.next_event().await, None);
    }

    #[tokio::test]
    async fn test_independent_readers_at_different_offsets() {
        let (manager, _) = manager_with(Arc::new(MemoryEventLog::new()));
        let mut writer = manager.create(context()).await;
        let id = writer.session_id().to_string();

        for i in 0..5 {
            writer.push(WireEvent::text(format!("e{}", i))).await.unwrap();
        }

        let mut early = manager.attach(&id, None).await.unwrap();
        let mut late = manager.attach(&id, Some(4)).await.unwrap();
        assert_eq!(manager.get(&id).await.unwrap().reader_count(), 2);

        for i in 5..8 {
            writer.push(WireEvent::text(format!("e{}", i))).await.unwrap();
        }
        writer.close(SessionStatus::Completed).await.unwrap();

        let full = manager.get(&id).await.unwrap().events_snapshot();
        let (early_events, _) = drain(&mut early).await;
        let (late_events, status) = drain(&mut late).await;

        let expected: Vec<(u64, WireEvent)> = full
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, e)| (i as u64, e))
            .collect();
        assert_eq!(early_events, expected);
        assert_eq!(late_events, expected[4..].to_vec());
        assert_eq!(status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_reader_after_completion_sees_tail_and_end() {
        let (manager, _) = manager_with(Arc::new(MemoryEventLog::new()));
        let mut writer = manager.create(context()).await;
        let id = writer.session_id().to_string();
        writer.push(WireEvent::text("a")).await.unwrap();
        writer.push(WireEvent::text("b")).await.unwrap();
        writer.close(SessionStatus::Completed).await.unwrap();

        let mut reader = manager.attach(&id, Some(1)).await.unwrap();
        let (events, status) = drain(&mut reader).await;
        assert_eq!(events, vec![(1, WireEvent::text("b"))]);
        assert_eq!(status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_offset_past_end_is_rejected() {
        let (manager, _) = manager_with(Arc::new(MemoryEventLog::new()));
        let mut writer = manager.create(context()).await;
        writer.push(WireEvent::text("a")).await.unwrap();

        let result = manager.attach(writer.session_id(), Some(5)).await;
        assert!(matches!(result, Err(StreamError::NotResumable { .. })));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_resumable() {
        let (manager, _) = manager_with(Arc::new(MemoryEventLog::new()));
        let result = manager.attach("nope", None).await;
        assert!(matches!(result, Err(StreamError::NotResumable { .. })));
    }

    #[tokio::test]
    async fn test_degraded_mode_serves_single_live_reader() {
        let (manager, messages) = manager_with(Arc::new(UnavailableEventLog::new("down")));
        let mut writer = manager.create(context()).await;
        let id = writer.session_id().to_string();
        assert!(!manager.get(&id).await.unwrap().is_resumable());

        writer.push(WireEvent::text("before attach ")).await.unwrap();
        let mut reader = manager.attach(&id, None).await.unwrap();
        writer.push(WireEvent::text("live")).await.unwrap();

        // second reader, or any resume, is refused
        assert!(matches!(
            manager.attach(&id, None).await,
            Err(StreamError::NotResumable { .. })
        ));
        assert!(matches!(
            manager.attach(&id, Some(1)).await,
            Err(StreamError::NotResumable { .. })
        ));

        writer.close(SessionStatus::Completed).await.unwrap();
        let (events, status) = drain(&mut reader).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].1, WireEvent::text("live"));
        assert_eq!(status, SessionStatus::Completed);

        drop(reader);
        assert!(matches!(
            manager.attach(&id, Some(2)).await,
            Err(StreamError::NotResumable { .. })
        ));
        assert_eq!(messages.count_for_session(&id).await, 1);
    }

    #[tokio::test]
    async fn test_stalled_store_fails_attach_fast() {
        let (manager, _) = manager_with(Arc::new(StalledLog::default()));
        let writer = manager.create(context()).await;
        let result = manager.attach(writer.session_id(), None).await;
        assert!(matches!(result, Err(StreamError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_mark_completed_twice_persists_once() {
        let (manager, messages) = manager_with(Arc::new(MemoryEventLog::new()));
        let mut writer = manager.create(context()).await;
        let id = writer.session_id().to_string();
        writer.push(WireEvent::text("done")).await.unwrap();

        assert!(manager.mark_completed(&id, SessionStatus::Completed).await.unwrap());
        assert!(!manager.mark_completed(&id, SessionStatus::Completed).await.unwrap());
        assert!(!manager.mark_completed(&id, SessionStatus::Failed).await.unwrap());

        assert_eq!(messages.count_for_session(&id).await, 1);
        assert_eq!(manager.get(&id).await.unwrap().status(), SessionStatus::Completed);

        let result = writer.push(WireEvent::text("late")).await;
        assert!(matches!(result, Err(StreamError::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_dropping_reader_releases_only_itself() {
        let (manager, _) = manager_with(Arc::new(MemoryEventLog::new()));
        let mut writer = manager.create(context()).await;
        let id = writer.session_id().to_string();

        let first = manager.attach(&id, None).await.unwrap();
        let mut second = manager.attach(&id, None).await.unwrap();
        drop(first);
        assert_eq!(manager.get(&id).await.unwrap().reader_count(), 1);

        writer.push(WireEvent::text("still here")).await.unwrap();
        assert_eq!(
            second.next_event().await,
            Some(ReaderItem::Event { offset: 0, event: WireEvent::text("still here") })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_respects_grace_period_and_readers() {
        let store = Arc::new(MemoryEventLog::new());
        let (manager, messages) = manager_with(store.clone());

        let mut done = manager.create(context()).await;
        let done_id = done.session_id().to_string();
        done.push(WireEvent::text("x")).await.unwrap();
        done.close(SessionStatus::Completed).await.unwrap();

        let idle = manager.create(context()).await;
        let idle_id = idle.session_id().to_string();

        let watched = manager.create(context()).await;
        let watched_id = watched.session_id().to_string();
        let _reader = manager.attach(&watched_id, None).await.unwrap();

        assert!(manager.reap_expired().await.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let mut expired = manager.reap_expired().await;
        expired.sort();
        let mut expected = vec![done_id.clone(), idle_id.clone()];
        expected.sort();
        assert_eq!(expired, expected);

        assert!(manager.get(&watched_id).await.is_some());
        assert!(!store.contains(&done_id).await);
        assert!(matches!(
            manager.attach(&done_id, None).await,
            Err(StreamError::NotResumable { .. })
        ));
        // the idle session was failed and finalized on its way out
        assert_eq!(messages.count_for_session(&idle_id).await, 1);
    }

    #[tokio::test]
    async fn test_mirror_reader_does_not_wait_on_the_log() {
        let (manager, _) = manager_with(Arc::new(StalledLog::default()));
        let mut writer = manager.create(context()).await;
        let session = writer.session().clone();
        assert!(session.is_resumable());

        let mut reader = session.mirror_reader().unwrap();
        writer.push(WireEvent::text("a")).await.unwrap();
        writer.push(WireEvent::text("b")).await.unwrap();
        writer.close(SessionStatus::Completed).await.unwrap();

        let (events, status) = drain(&mut reader).await;
        assert_eq!(
            events,
            vec![(0, WireEvent::text("a")), (1, WireEvent::text("b"))]
        );
        assert_eq!(status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_mirror_reader_of_degraded_session_is_single_use() {
        let (manager, _) = manager_with(Arc::new(UnavailableEventLog::new("down")));
        let writer = manager.create(context()).await;
        let session = writer.session().clone();

        let first = session.mirror_reader();
        assert!(first.is_some());
        assert!(session.mirror_reader().is_none());
    }

    #[tokio::test]
    async fn test_expire_cancels_active_producer() {
        let (manager, messages) = manager_with(Arc::new(MemoryEventLog::new()));
        let mut writer = manager.create(context()).await;
        let id = writer.session_id().to_string();
        let token = writer.session().cancellation().clone();
        writer.push(WireEvent::text("partial")).await.unwrap();

        assert!(manager.expire(&id).await);
        assert!(token.is_cancelled());
        assert_eq!(writer.session().status(), SessionStatus::Failed);
        assert_eq!(messages.count_for_session(&id).await, 1);

        // the producer's own close comes too late and changes nothing
        assert!(!writer.close(SessionStatus::Completed).await.unwrap());
        assert_eq!(messages.count_for_session(&id).await, 1);
    }

    #[tokio::test]
    async fn test_expire_leaves_finished_session_token_alone() {
        let (manager, _) = manager_with(Arc::new(MemoryEventLog::new()));
        let writer = manager.create(context()).await;
        let id = writer.session_id().to_string();
        let token = writer.session().cancellation().clone();
        writer.close(SessionStatus::Completed).await.unwrap();

        assert!(manager.expire(&id).await);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_session_record_follows_status() {
        let store = Arc::new(MemoryEventLog::new());
        let (manager, _) = manager_with(store.clone());
        let writer = manager.create(context()).await;
        let id = writer.session_id().to_string();

        let record = store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.created_at, writer.session().created_at());

        writer.close(SessionStatus::Cancelled).await.unwrap();
        let record = store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_other_instance_resumes_from_shared_log() {
        let store = Arc::new(MemoryEventLog::new());
        let (producer, _) = manager_with(store.clone());
        let (other, _) = manager_with(store.clone());

        let mut writer = producer.create(context()).await;
        let id = writer.session_id().to_string();
        writer.push(WireEvent::text("e0")).await.unwrap();
        writer.push(WireEvent::text("e1")).await.unwrap();

        assert!(other.get(&id).await.is_none());
        assert_eq!(other.owner_of(&id).await.as_deref(), Some("u1"));

        let mut remote = other.attach(&id, Some(1)).await.unwrap();
        assert_eq!(
            remote.next_event().await,
            Some(ReaderItem::Event { offset: 1, event: WireEvent::text("e1") })
        );

        writer.push(WireEvent::text("e2")).await.unwrap();
        writer.close(SessionStatus::Completed).await.unwrap();

        let (rest, status) = drain(&mut remote).await;
        assert_eq!(rest, vec![(2, WireEvent::text("e2"))]);
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(remote.next_event().await, None);

        // a finished session replays in full from the log
        let mut late = other.attach(&id, None).await.unwrap();
        let (all, status) = drain(&mut late).await;
        assert_eq!(all.len(), 3);
        assert_eq!(status, SessionStatus::Completed);

        assert!(matches!(
            other.attach(&id, Some(4)).await,
            Err(StreamError::NotResumable { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_reader_waits_for_live_events() {
        let store = Arc::new(MemoryEventLog::new());
        let (producer, _) = manager_with(store.clone());
        let (other, _) = manager_with(store.clone());

        let mut writer = producer.create(context()).await;
        let id = writer.session_id().to_string();
        let mut remote = other.attach(&id, None).await.unwrap();

        let feed = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.push(WireEvent::text("late")).await.unwrap();
            writer.close(SessionStatus::Completed).await.unwrap();
        });

        let (events, status) = drain(&mut remote).await;
        feed.await.unwrap();
        assert_eq!(events, vec![(0, WireEvent::text("late"))]);
        assert_eq!(status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_owner_of_unknown_session_is_none() {
        let (manager, _) = manager_with(Arc::new(MemoryEventLog::new()));
        assert!(manager.owner_of("missing").await.is_none());
    }
}
