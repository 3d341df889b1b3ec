//! Runtime configuration.
//!
//! Every section reads its defaults from the environment, so a bare
//! `CoreConfig::default()` is already usable. Hosts may overlay a file on top.
//!
//! Env overrides:
//! - PRIMARY_CHAR_THRESHOLD, TOTAL_CHAR_LIMIT
//! - AUDIO_CACHE_DIR, MAX_CACHE_SIZE_MB, CACHE_SWEEP_INTERVAL_SECS
//! - PRIMARY_TTS_URL, FALLBACK_TTS_URL, TTS_REQUEST_TIMEOUT_MS
//! - DEFAULT_SPEAKER_ID, MAX_READ_LENGTH, READ_URL_AS, READ_IMAGE_AS

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Per-guild usage budget, in weighted characters per billing period.
///
/// A value of `0.0` disables the corresponding limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageLimits {
    /// Once crossed, utterances are routed to the fallback engine
    pub primary_threshold: f64,
    /// Once reached, utterances are dropped
    pub total_limit: f64,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            primary_threshold: env_or("PRIMARY_CHAR_THRESHOLD", 0.0),
            total_limit: env_or("TOTAL_CHAR_LIMIT", 0.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let dir = env_string("AUDIO_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("audio_cache"));
        let max_mb: u64 = env_or("MAX_CACHE_SIZE_MB", 1024);
        Self {
            dir,
            max_bytes: max_mb * 1024 * 1024,
            sweep_interval: Duration::from_secs(env_or("CACHE_SWEEP_INTERVAL_SECS", 3600)),
        }
    }
}

/// HTTP synthesis backends
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub primary_url: String,
    /// Fallback is optional; without it fallback-routed items fail and are dropped
    pub fallback_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            primary_url: env_string("PRIMARY_TTS_URL")
                .unwrap_or_else(|| "http://localhost:50021".to_string()),
            fallback_url: env_string("FALLBACK_TTS_URL"),
            request_timeout_ms: env_or("TTS_REQUEST_TIMEOUT_MS", 30_000),
        }
    }
}

/// Timing constants of the session state machine
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    /// Bound on reaching Ready after join
    pub connect_timeout: Duration,
    /// Window for a transient disconnect to resume by itself
    pub resume_window: Duration,
    /// Bound on reaching Ready inside the drain loop
    pub ready_wait: Duration,
    /// ActiveSpeech poll / retry delay
    pub poll_interval: Duration,
    /// Consecutive waits before the warning notice is posted
    pub warn_after_strikes: u32,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            resume_window: Duration::from_secs(5),
            ready_wait: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            warn_after_strikes: 20,
        }
    }
}

/// Message → speakable text rewriting
#[derive(Debug, Clone)]
pub struct TextConfig {
    pub max_read_length: usize,
    pub url_replacement: String,
    pub image_placeholder: String,
    pub truncation_suffix: String,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            max_read_length: env_or("MAX_READ_LENGTH", 100),
            url_replacement: env_string("READ_URL_AS").unwrap_or_else(|| "URL".to_string()),
            image_placeholder: env_string("READ_IMAGE_AS").unwrap_or_else(|| "image".to_string()),
            truncation_suffix: " (omitted)".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub limits: UsageLimits,
    pub cache: CacheConfig,
    pub backends: BackendConfig,
    pub timings: SessionTimings,
    pub text: TextConfig,
    pub default_speaker_id: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            limits: UsageLimits::default(),
            cache: CacheConfig::default(),
            backends: BackendConfig::default(),
            timings: SessionTimings::default(),
            text: TextConfig::default(),
            default_speaker_id: env_or("DEFAULT_SPEAKER_ID", 1),
        }
    }
}
