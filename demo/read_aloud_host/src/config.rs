use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vcread_core::config::{BackendConfig, CacheConfig, TextConfig, UsageLimits};
use vcread_core::CoreConfig;

/// Configuration for the console host
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub core: CoreConfig,
    /// RocksDB directory for settings and the usage ledger; in-memory when unset
    pub storage_path: Option<PathBuf>,
    pub stats_interval: Duration,
    /// How often the billing period is checked for rollover
    pub rollover_check: Duration,
    pub console: ConsoleConfig,
}

/// Identifiers the console pretends to be in
#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub guild_id: String,
    pub voice_channel: String,
    pub text_channel: String,
    pub user_id: String,
    /// Simulated playback time per audio kilobyte
    pub playback_ms_per_kb: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            guild_id: "console".into(),
            voice_channel: "console-voice".into(),
            text_channel: "console-text".into(),
            user_id: std::env::var("USER").unwrap_or_else(|_| "console-user".into()),
            playback_ms_per_kb: 5,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            storage_path: std::env::var("STORAGE_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            stats_interval: Duration::from_secs(
                std::env::var("STATS_REPORT_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(3600),
            ),
            rollover_check: Duration::from_secs(60),
            console: ConsoleConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from a TOML file (path via READ_ALOUD_CONFIG or ./read_aloud.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("READ_ALOUD_CONFIG").unwrap_or_else(|_| "read_aloud.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target = "read_aloud_host", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<HostToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target = "read_aloud_host", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target = "read_aloud_host", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct HostToml {
    pub storage_path: Option<PathBuf>,
    pub stats_interval_secs: Option<u64>,
    pub default_speaker_id: Option<u32>,
    pub limits: Option<LimitsToml>,
    pub cache: Option<CacheToml>,
    pub backends: Option<BackendsToml>,
    pub text: Option<TextToml>,
    pub console: Option<ConsoleToml>,
}

impl HostToml {
    fn overlay(self, mut base: HostConfig) -> HostConfig {
        if let Some(p) = self.storage_path {
            base.storage_path = Some(p);
        }
        if let Some(secs) = self.stats_interval_secs {
            base.stats_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(id) = self.default_speaker_id {
            base.core.default_speaker_id = id;
        }
        if let Some(l) = self.limits {
            l.apply(&mut base.core.limits);
        }
        if let Some(c) = self.cache {
            c.apply(&mut base.core.cache);
        }
        if let Some(b) = self.backends {
            b.apply(&mut base.core.backends);
        }
        if let Some(t) = self.text {
            t.apply(&mut base.core.text);
        }
        if let Some(c) = self.console {
            c.apply(&mut base.console);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LimitsToml {
    pub primary_threshold: Option<f64>,
    pub total_limit: Option<f64>,
}
impl LimitsToml {
    fn apply(self, l: &mut UsageLimits) {
        if let Some(v) = self.primary_threshold {
            l.primary_threshold = v.max(0.0);
        }
        if let Some(v) = self.total_limit {
            l.total_limit = v.max(0.0);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct CacheToml {
    pub dir: Option<PathBuf>,
    pub max_size_mb: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}
impl CacheToml {
    fn apply(self, c: &mut CacheConfig) {
        if let Some(v) = self.dir {
            c.dir = v;
        }
        if let Some(v) = self.max_size_mb {
            c.max_bytes = v * 1024 * 1024;
        }
        if let Some(v) = self.sweep_interval_secs {
            c.sweep_interval = Duration::from_secs(v.max(1));
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct BackendsToml {
    pub primary_url: Option<String>,
    pub fallback_url: Option<String>,
    pub request_timeout_ms: Option<u64>,
}
impl BackendsToml {
    fn apply(self, b: &mut BackendConfig) {
        if let Some(v) = self.primary_url {
            b.primary_url = v;
        }
        if let Some(v) = self.fallback_url {
            b.fallback_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = self.request_timeout_ms {
            b.request_timeout_ms = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct TextToml {
    pub max_read_length: Option<usize>,
    pub url_replacement: Option<String>,
    pub image_placeholder: Option<String>,
    pub truncation_suffix: Option<String>,
}
impl TextToml {
    fn apply(self, t: &mut TextConfig) {
        if let Some(v) = self.max_read_length {
            t.max_read_length = v;
        }
        if let Some(v) = self.url_replacement {
            t.url_replacement = v;
        }
        if let Some(v) = self.image_placeholder {
            t.image_placeholder = v;
        }
        if let Some(v) = self.truncation_suffix {
            t.truncation_suffix = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ConsoleToml {
    pub guild_id: Option<String>,
    pub voice_channel: Option<String>,
    pub text_channel: Option<String>,
    pub user_id: Option<String>,
    pub playback_ms_per_kb: Option<u64>,
}
impl ConsoleToml {
    fn apply(self, c: &mut ConsoleConfig) {
        if let Some(v) = self.guild_id {
            c.guild_id = v;
        }
        if let Some(v) = self.voice_channel {
            c.voice_channel = v;
        }
        if let Some(v) = self.text_channel {
            c.text_channel = v;
        }
        if let Some(v) = self.user_id {
            c.user_id = v;
        }
        if let Some(v) = self.playback_ms_per_kb {
            c.playback_ms_per_kb = v;
        }
    }
}
