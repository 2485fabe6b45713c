//! Environment-driven configuration.
//!
//! Every knob has a coded default so the server boots with nothing but
//! `ATRIUM_GEMINI_API_KEY` set. Settings are loaded once in `main` and
//! passed explicitly to the components that need them; there is no global
//! configuration state.

use std::env;
use std::net::SocketAddr;

use crate::errors::AppError;

/// Fixed-window rate limiting knobs (anonymous visitors).
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Requests permitted per window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: i64,
    /// How often expired entries are swept, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_ms: 60_000,
            sweep_interval_secs: 300,
        }
    }
}

/// Per-(session, tool) usage caps for the retrieval tool.
#[derive(Debug, Clone)]
pub struct GovernorSettings {
    /// Uses permitted within one cooldown window.
    pub max_usage: u32,
    /// Cooldown measured from the last use, in milliseconds.
    pub cooldown_ms: i64,
    /// Pairs idle longer than this are purged, in milliseconds.
    pub idle_purge_ms: i64,
    /// How often idle pairs are swept, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            max_usage: 3,
            cooldown_ms: 30_000,
            idle_purge_ms: 3_600_000,
            sweep_interval_secs: 1_800,
        }
    }
}

/// Retrieval pipeline knobs.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    /// Keyword-search candidate pool size before re-ranking.
    pub keyword_limit: i64,
    /// Chunks kept after cosine re-ranking.
    pub top_k: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            keyword_limit: 10,
            top_k: 3,
        }
    }
}

/// Document chunking knobs for ingestion.
#[derive(Debug, Clone)]
pub struct ChunkingSettings {
    /// Window size in characters for naive chunking.
    pub window_size: usize,
    /// Overlap between adjacent windows in characters.
    pub window_overlap: usize,
    /// Size budget for heading-aware packing.
    pub pack_budget: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            window_size: 1000,
            window_overlap: 200,
            pack_budget: 1000,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub gemini_api_key: String,
    pub chat_model: String,
    pub embedding_model: String,
    /// Display name of the person the assistant answers questions about.
    pub owner_name: String,
    /// Prior messages included in the prompt window.
    pub history_window: i64,
    /// Tool/reasoning steps allowed before the model must answer.
    pub max_tool_steps: usize,
    pub rate_limit: RateLimitSettings,
    pub governor: GovernorSettings,
    pub retrieval: RetrievalSettings,
    pub chunking: ChunkingSettings,
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Fails if `ATRIUM_GEMINI_API_KEY` is missing or a numeric variable
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, AppError> {
        let bind_addr = env_or("ATRIUM_BIND_ADDR", "0.0.0.0:8080")
            .parse()
            .map_err(|_| AppError::validation("ATRIUM_BIND_ADDR is not a valid socket address"))?;

        let gemini_api_key = env::var("ATRIUM_GEMINI_API_KEY")
            .map_err(|_| AppError::validation("ATRIUM_GEMINI_API_KEY must be set"))?;

        Ok(Self {
            bind_addr,
            database_url: env_or("ATRIUM_DATABASE_URL", "sqlite://atrium.db"),
            gemini_api_key,
            chat_model: env_or("ATRIUM_CHAT_MODEL", "gemini-2.0-flash"),
            embedding_model: env_or("ATRIUM_EMBEDDING_MODEL", "text-embedding-004"),
            owner_name: env_or("ATRIUM_OWNER_NAME", "the portfolio owner"),
            history_window: parse_env("ATRIUM_HISTORY_WINDOW", 10)?,
            max_tool_steps: parse_env("ATRIUM_MAX_TOOL_STEPS", 3)?,
            rate_limit: RateLimitSettings {
                max_requests: parse_env("ATRIUM_RATE_LIMIT_MAX", 10)?,
                window_ms: parse_env("ATRIUM_RATE_LIMIT_WINDOW_MS", 60_000)?,
                sweep_interval_secs: parse_env("ATRIUM_RATE_LIMIT_SWEEP_SECS", 300)?,
            },
            governor: GovernorSettings::default(),
            retrieval: RetrievalSettings {
                keyword_limit: parse_env("ATRIUM_RETRIEVAL_CANDIDATES", 10)?,
                top_k: parse_env("ATRIUM_RETRIEVAL_TOP_K", 3)?,
            },
            chunking: ChunkingSettings::default(),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::validation(format!("{key} is not a valid number"))),
        Err(_) => Ok(default),
    }
}
