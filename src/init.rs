use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use strum_macros::{Display, EnumString};

use crate::storage::{
    EventLog, MemoryEventLog, MemoryMessageStore, MessageStore, PgMessageStore, S3Config,
    S3EventLog, UnavailableEventLog,
};
use crate::stream::{
    Generator, OllamaSource, SessionConfig, SessionManager, StreamService, TranscriptFinalizer,
};

// ============================================================================
// Configuration
// ============================================================================

/// Which durable event log backs resumable sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StoreKind {
    Memory,
    S3,
    /// Every session runs non-resumable.
    #[strum(serialize = "none")]
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub store: StoreKind,
    pub s3: Option<S3Config>,
    pub database_url: Option<String>,
    pub session: SessionConfig,
    pub ollama_url: String,
    pub chat_model: String,
    pub agent_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let store: StoreKind = var("STREAM_STORE", "memory").parse()?;

        let s3 = match store {
            StoreKind::S3 => {
                let required = |key: &str| {
                    lookup(key)
                        .ok_or_else(|| format!("{} is required when STREAM_STORE=s3", key))
                };
                Some(S3Config {
                    bucket: required("S3_BUCKET")?,
                    region: var("S3_REGION", "us-east-1"),
                    endpoint: lookup("S3_ENDPOINT"),
                    access_key: required("AWS_ACCESS_KEY_ID")?,
                    secret_key: required("AWS_SECRET_ACCESS_KEY")?,
                })
            }
            _ => None,
        };

        Ok(Self {
            host: var("HOST", "0.0.0.0"),
            port: var("PORT", "3000").parse()?,
            store,
            s3,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            session: SessionConfig {
                grace_period: Duration::from_secs(var("SESSION_GRACE_SECS", "300").parse()?),
                attach_timeout: Duration::from_millis(var("ATTACH_TIMEOUT_MS", "5000").parse()?),
                reaper_interval: Duration::from_secs(var("REAPER_INTERVAL_SECS", "30").parse()?),
                poll_interval: Duration::from_millis(var("STREAM_POLL_MS", "500").parse()?),
            },
            ollama_url: var("OLLAMA_URL", "http://localhost:11434"),
            chat_model: var("CHAT_MODEL", "llama3.2"),
            agent_name: var("AGENT_NAME", "assistant"),
        })
    }
}

// ============================================================================
// Application State
// ============================================================================

pub struct AppState {
    pub service: StreamService,
    pub generator: Arc<dyn Generator>,
    pub agent_name: String,
}

impl AppState {
    pub fn new(
        service: StreamService,
        generator: Arc<dyn Generator>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            service,
            generator,
            agent_name: agent_name.into(),
        }
    }
}

pub async fn app_init() -> Result<(Config, Arc<AppState>), Box<dyn Error>> {
    let config = Config::from_env()?;
    log::info!("✅ Configuration loaded");

    let event_log = setup_event_log(&config)?;
    match event_log.ping().await {
        Ok(()) => log::info!("✅ Event log '{}' reachable", event_log.name()),
        Err(e) => log::warn!("⚠️  Event log '{}': {}", event_log.name(), e),
    }

    let messages: Arc<dyn MessageStore> = match &config.database_url {
        Some(url) => {
            log::info!("📊 Connecting to PostgreSQL...");
            let db = setup_database(url).await?;
            log::info!("✅ PostgreSQL connected");

            log::info!("🔄 Running migrations...");
            sqlx::migrate!("./migrations").run(&db).await?;
            log::info!("✅ Migrations completed");

            Arc::new(PgMessageStore::new(db))
        }
        None => {
            log::warn!("⚠️  DATABASE_URL not set, transcripts are kept in memory");
            Arc::new(MemoryMessageStore::new())
        }
    };

    let manager = SessionManager::new(
        event_log,
        TranscriptFinalizer::new(messages),
        config.session.clone(),
    );
    let generator = Arc::new(OllamaSource::new(&config.ollama_url, &config.chat_model));

    let state = Arc::new(AppState::new(
        StreamService::new(manager),
        generator,
        &config.agent_name,
    ));
    Ok((config, state))
}

// ============================================================================
// Setup Functions
// ============================================================================

async fn setup_database(database_url: &str) -> Result<sqlx::PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(50)
        .connect(database_url)
        .await
}

fn setup_event_log(config: &Config) -> Result<Arc<dyn EventLog>, Box<dyn Error>> {
    let log: Arc<dyn EventLog> = match (config.store, &config.s3) {
        (StoreKind::S3, Some(s3)) => {
            log::info!("☁️  Initializing S3 event log in bucket {}...", s3.bucket);
            Arc::new(S3EventLog::new(s3)?)
        }
        (StoreKind::S3, None) => return Err("S3 event log selected without S3 settings".into()),
        (StoreKind::Memory, _) => Arc::new(MemoryEventLog::new()),
        (StoreKind::Disabled, _) => Arc::new(UnavailableEventLog::new(
            "durable event log disabled by STREAM_STORE=none",
        )),
    };
    Ok(log)
}
