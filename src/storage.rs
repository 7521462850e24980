use async_trait::async_trait;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::models::{FinalMessage, SessionRecord, WireEvent};

type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Durable Event Log
// ============================================================================

/// Append-only, replayable log of wire events keyed by `(session_id, offset)`.
///
/// Offsets start at 0 per session and grow by one per append. Entries are
/// never rewritten, so readers on other instances can replay concurrently
/// with the single writer. Next to the events sits one `SessionRecord`,
/// rewritten by the writer when the session ends.
#[async_trait]
pub trait EventLog: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reachability check run when a session is created.
    async fn ping(&self) -> StoreResult<()>;

    async fn append(&self, session_id: &str, event: &WireEvent) -> StoreResult<u64>;

    async fn read_from(&self, session_id: &str, offset: u64) -> StoreResult<Vec<WireEvent>>;

    async fn put_record(&self, record: &SessionRecord) -> StoreResult<()>;

    async fn get_record(&self, session_id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Removes the events and the record.
    async fn delete(&self, session_id: &str) -> StoreResult<()>;
}

/// Process-local log. Survives client reconnects, not process restarts.
#[derive(Default)]
pub struct MemoryEventLog {
    logs: RwLock<HashMap<String, Vec<WireEvent>>>,
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, session_id: &str) -> usize {
        self.logs
            .read()
            .await
            .get(session_id)
            .map(|log| log.len())
            .unwrap_or(0)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.logs.read().await.contains_key(session_id)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn append(&self, session_id: &str, event: &WireEvent) -> StoreResult<u64> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(session_id.to_string()).or_default();
        log.push(event.clone());
        Ok((log.len() - 1) as u64)
    }

    async fn read_from(&self, session_id: &str, offset: u64) -> StoreResult<Vec<WireEvent>> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(session_id) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(log.len());
        Ok(log[start..].to_vec())
    }

    async fn put_record(&self, record: &SessionRecord) -> StoreResult<()> {
        self.records
            .write()
            .await
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        self.logs.write().await.remove(session_id);
        self.records.write().await.remove(session_id);
        Ok(())
    }
}

/// Stand-in for an unconfigured or unreachable backend. Every session created
/// against it runs in non-resumable mode.
#[derive(Debug, Clone)]
pub struct UnavailableEventLog {
    reason: String,
}

impl UnavailableEventLog {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl EventLog for UnavailableEventLog {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn append(&self, _session_id: &str, _event: &WireEvent) -> StoreResult<u64> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn read_from(&self, _session_id: &str, _offset: u64) -> StoreResult<Vec<WireEvent>> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn put_record(&self, _record: &SessionRecord) -> StoreResult<()> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn get_record(&self, _session_id: &str) -> StoreResult<Option<SessionRecord>> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn delete(&self, _session_id: &str) -> StoreResult<()> {
        Ok(())
    }
}

// ============================================================================
// S3 Event Log with rust-s3
// ============================================================================

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

/// One object per event at `{prefix}/{session_id}/{offset:020}.json`, plus
/// `{prefix}/{session_id}/session.json` for the record.
pub struct S3EventLog {
    bucket: Bucket,
    prefix: String,
    next_offsets: Mutex<HashMap<String, u64>>,
}

impl S3EventLog {
    /// Create from explicit configuration
    pub fn new(config: &S3Config) -> StoreResult<Self> {
        let region = if let Some(ep) = &config.endpoint {
            Region::Custom {
                region: config.region.clone(),
                endpoint: ep.clone(),
            }
        } else {
            Region::from_str(&config.region)
                .map_err(|e| StoreError::Backend(format!("Invalid region: {}", e)))?
        };

        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| StoreError::Backend(format!("Credentials error: {}", e)))?;

        let mut bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| StoreError::Backend(format!("Bucket creation failed: {}", e)))?;

        // Use path-style for compatibility with MinIO/LocalStack
        bucket = bucket.with_path_style();

        Ok(Self {
            bucket: *bucket,
            prefix: "streams".to_string(),
            next_offsets: Mutex::new(HashMap::new()),
        })
    }

    fn session_prefix(&self, session_id: &str) -> String {
        format!("{}/{}/", self.prefix, session_id)
    }

    fn event_key(&self, session_id: &str, offset: u64) -> String {
        format!("{}{:020}.json", self.session_prefix(session_id), offset)
    }

    fn record_key(&self, session_id: &str) -> String {
        format!("{}session.json", self.session_prefix(session_id))
    }

    fn reserve_offset(&self, session_id: &str) -> u64 {
        let mut offsets = self
            .next_offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = offsets.entry(session_id.to_string()).or_insert(0);
        let offset = *next;
        *next += 1;
        offset
    }

    fn release_offset(&self, session_id: &str, offset: u64) {
        let mut offsets = self
            .next_offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        offsets.insert(session_id.to_string(), offset);
    }

    async fn list_offsets(&self, session_id: &str) -> StoreResult<Vec<(u64, String)>> {
        let results = self
            .bucket
            .list(self.session_prefix(session_id), None)
            .await
            .map_err(|e| StoreError::Unavailable(format!("S3 list failed: {}", e)))?;

        let mut entries: Vec<(u64, String)> = results
            .into_iter()
            .flat_map(|page| page.contents)
            .filter_map(|object| {
                let offset = object
                    .key
                    .rsplit('/')
                    .next()
                    .and_then(|name| name.strip_suffix(".json"))
                    .and_then(|stem| stem.parse::<u64>().ok())?;
                Some((offset, object.key))
            })
            .collect();
        entries.sort_by_key(|(offset, _)| *offset);
        Ok(entries)
    }
}

#[async_trait]
impl EventLog for S3EventLog {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.bucket
            .list(format!("{}/", self.prefix), Some("/".to_string()))
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(format!("S3 unreachable: {}", e)))
    }

    async fn append(&self, session_id: &str, event: &WireEvent) -> StoreResult<u64> {
        let offset = self.reserve_offset(session_id);
        let key = self.event_key(session_id, offset);

        let body = match serde_json::to_vec(event) {
            Ok(body) => body,
            Err(source) => {
                self.release_offset(session_id, offset);
                return Err(StoreError::Corrupt { key, source });
            }
        };

        let result = self
            .bucket
            .put_object_with_content_type(&key, &body, "application/json")
            .await;

        match result {
            Ok(response) if (200..300).contains(&response.status_code()) => Ok(offset),
            Ok(response) => {
                self.release_offset(session_id, offset);
                Err(StoreError::Backend(format!(
                    "S3 put {} returned status {}",
                    key,
                    response.status_code()
                )))
            }
            Err(e) => {
                self.release_offset(session_id, offset);
                Err(StoreError::Unavailable(format!("S3 put failed: {}", e)))
            }
        }
    }

    async fn read_from(&self, session_id: &str, offset: u64) -> StoreResult<Vec<WireEvent>> {
        let entries = self.list_offsets(session_id).await?;

        let mut events = Vec::new();
        let mut expected = offset;
        for (entry_offset, key) in entries.into_iter().filter(|(o, _)| *o >= offset) {
            if entry_offset != expected {
                return Err(StoreError::Backend(format!(
                    "gap in log for session {}: expected offset {}, found {}",
                    session_id, expected, entry_offset
                )));
            }

            let response = self
                .bucket
                .get_object(&key)
                .await
                .map_err(|e| StoreError::Unavailable(format!("S3 get failed: {}", e)))?;
            if response.status_code() != 200 {
                return Err(StoreError::Backend(format!(
                    "S3 get {} returned status {}",
                    key,
                    response.status_code()
                )));
            }

            let event: WireEvent = serde_json::from_slice(response.bytes())
                .map_err(|source| StoreError::Corrupt { key, source })?;
            events.push(event);
            expected += 1;
        }

        Ok(events)
    }

    async fn put_record(&self, record: &SessionRecord) -> StoreResult<()> {
        let key = self.record_key(&record.session_id);
        let body = serde_json::to_vec(record).map_err(|source| StoreError::Corrupt {
            key: key.clone(),
            source,
        })?;

        let response = self
            .bucket
            .put_object_with_content_type(&key, &body, "application/json")
            .await
            .map_err(|e| StoreError::Unavailable(format!("S3 put failed: {}", e)))?;
        if !(200..300).contains(&response.status_code()) {
            return Err(StoreError::Backend(format!(
                "S3 put {} returned status {}",
                key,
                response.status_code()
            )));
        }
        Ok(())
    }

    async fn get_record(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let key = self.record_key(session_id);
        let response = self
            .bucket
            .get_object(&key)
            .await
            .map_err(|e| StoreError::Unavailable(format!("S3 get failed: {}", e)))?;

        match response.status_code() {
            200 => serde_json::from_slice(response.bytes())
                .map(Some)
                .map_err(|source| StoreError::Corrupt { key, source }),
            404 => Ok(None),
            status => Err(StoreError::Backend(format!(
                "S3 get {} returned status {}",
                key, status
            ))),
        }
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        let entries = self.list_offsets(session_id).await?;
        let record_key = self.record_key(session_id);
        for key in entries.into_iter().map(|(_, key)| key).chain([record_key]) {
            if let Err(e) = self.bucket.delete_object(&key).await {
                log::warn!("S3 delete failed for {}: {}", key, e);
            }
        }

        let mut offsets = self
            .next_offsets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        offsets.remove(session_id);
        Ok(())
    }
}

// ============================================================================
// Message Persistence
// ============================================================================

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, conversation_id: &str, message: &FinalMessage) -> StoreResult<()>;
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<(String, FinalMessage)>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<(String, FinalMessage)> {
        self.messages.read().await.clone()
    }

    pub async fn count_for_session(&self, session_id: &str) -> usize {
        self.messages
            .read()
            .await
            .iter()
            .filter(|(_, message)| message.session_id == session_id)
            .count()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save(&self, conversation_id: &str, message: &FinalMessage) -> StoreResult<()> {
        self.messages
            .write()
            .await
            .push((conversation_id.to_string(), message.clone()));
        Ok(())
    }
}

pub struct PgMessageStore {
    pool: sqlx::PgPool,
}

impl PgMessageStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn save(&self, conversation_id: &str, message: &FinalMessage) -> StoreResult<()> {
        let attachments = serde_json::to_value(&message.attachments).map_err(|source| {
            StoreError::Corrupt {
                key: message.session_id.clone(),
                source,
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO stream_messages
                (session_id, conversation_id, user_id, role, content, attachments, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(&message.session_id)
        .bind(conversation_id)
        .bind(&message.user_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(attachments)
        .bind(message.status.to_string())
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("Database error: {}", e)))?;

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
