use crate::engine::EngineSettings;
use chrono::FixedOffset;
use rollcall_core::matcher::{DEFAULT_AMBIGUITY_MARGIN, DEFAULT_THRESHOLD};
use rollcall_core::ThresholdMatcher;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("ROLLCALL_SIMILARITY_THRESHOLD must be within [-1, 1], got {0}")]
    Threshold(f32),
    #[error("ROLLCALL_AMBIGUITY_MARGIN must be a non-negative number, got {0}")]
    Margin(f32),
    #[error("ROLLCALL_EMBEDDING_DIM must be positive")]
    Dimension,
    #[error("ROLLCALL_TOP_K must be at least 2, got {0}")]
    TopK(usize),
    #[error("ROLLCALL_MODEL_VERSION must not be empty")]
    ModelVersion,
    #[error("ROLLCALL_UTC_OFFSET {0:?} is not of the form +HH:MM")]
    Offset(String),
    #[error("ROLLCALL_BUS must be \"session\" or \"system\", got {0:?}")]
    Bus(String),
}

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Optional course catalog; the built-in catalog is used when unset.
    pub courses_path: Option<PathBuf>,
    /// Cosine similarity threshold for a confident match.
    pub similarity_threshold: f32,
    /// Candidates closer than this to the best one make a match ambiguous.
    pub ambiguity_margin: f32,
    /// Output size of the embedding model.
    pub embedding_dim: usize,
    /// Version tag of the embedding model; other versions are rejected.
    pub model_version: String,
    /// Candidates requested from the index per face.
    pub top_k: usize,
    /// Raw `ROLLCALL_UTC_OFFSET`; parsed by [`Config::institution_offset`].
    pub utc_offset: String,
    pub embed_timeout_ms: u64,
    pub query_timeout_ms: u64,
    /// Pause before the single retry of a failed ledger write.
    pub storage_retry_backoff_ms: u64,
    pub bus: String,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            db_path,
            courses_path: std::env::var("ROLLCALL_COURSES_PATH").ok().map(PathBuf::from),
            similarity_threshold: env_f32("ROLLCALL_SIMILARITY_THRESHOLD", DEFAULT_THRESHOLD),
            ambiguity_margin: env_f32("ROLLCALL_AMBIGUITY_MARGIN", DEFAULT_AMBIGUITY_MARGIN),
            embedding_dim: env_usize("ROLLCALL_EMBEDDING_DIM", 512),
            model_version: std::env::var("ROLLCALL_MODEL_VERSION")
                .unwrap_or_else(|_| "w600k_r50".to_string()),
            top_k: env_usize("ROLLCALL_TOP_K", 5),
            utc_offset: std::env::var("ROLLCALL_UTC_OFFSET").unwrap_or_else(|_| "+00:00".to_string()),
            embed_timeout_ms: env_u64("ROLLCALL_EMBED_TIMEOUT_MS", 5000),
            query_timeout_ms: env_u64("ROLLCALL_QUERY_TIMEOUT_MS", 1000),
            storage_retry_backoff_ms: env_u64("ROLLCALL_STORAGE_RETRY_BACKOFF_MS", 100),
            bus: std::env::var("ROLLCALL_BUS").unwrap_or_else(|_| "session".to_string()),
        }
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.similarity_threshold;
        if !(-1.0..=1.0).contains(&t) {
            return Err(ConfigError::Threshold(t));
        }
        let m = self.ambiguity_margin;
        if !m.is_finite() || m < 0.0 {
            return Err(ConfigError::Margin(m));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Dimension);
        }
        if self.top_k < 2 {
            return Err(ConfigError::TopK(self.top_k));
        }
        if self.model_version.trim().is_empty() {
            return Err(ConfigError::ModelVersion);
        }
        self.institution_offset()?;
        self.bus()?;
        Ok(())
    }

    /// Institutional time zone as a fixed UTC offset.
    pub fn institution_offset(&self) -> Result<FixedOffset, ConfigError> {
        parse_offset(&self.utc_offset).ok_or_else(|| ConfigError::Offset(self.utc_offset.clone()))
    }

    pub fn bus(&self) -> Result<Bus, ConfigError> {
        match self.bus.as_str() {
            "session" => Ok(Bus::Session),
            "system" => Ok(Bus::System),
            other => Err(ConfigError::Bus(other.to_string())),
        }
    }

    pub fn engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        Ok(EngineSettings {
            matcher: ThresholdMatcher {
                threshold: self.similarity_threshold,
                ambiguity_margin: self.ambiguity_margin,
            },
            embedding_dim: self.embedding_dim,
            model_version: self.model_version.clone(),
            top_k: self.top_k,
            institution_offset: self.institution_offset()?,
            embed_timeout: Duration::from_millis(self.embed_timeout_ms),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            storage_retry_backoff: Duration::from_millis(self.storage_retry_backoff_ms),
        })
    }
}

/// Parse `+HH:MM` / `-HH:MM` (or `Z`).
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    if s == "Z" || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let sign = match s.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let (hours, minutes) = s[1..].split_once(':')?;
    if hours.len() != 2 || minutes.len() != 2 {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
