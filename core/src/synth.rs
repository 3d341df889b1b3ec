//! Synthesizer: text + voice parameters → playable audio.
//!
//! Two HTTP backends:
//! - Primary: two-step `audio_query` → `synthesis` API; output is cached by
//!   fingerprint.
//! - Fallback: single POST of `{"text": ...}`; output is never cached.
//!
//! Any backend failure (non-2xx, network error, timeout, malformed or empty
//! payload) is returned as an error. Callers drop the utterance; nothing here
//! retries.

use crate::cache::{fingerprint, AudioArtifact, AudioCache};
use crate::config::BackendConfig;
use crate::settings::{Engine, VoiceSettings};
use crate::stats::Stats;
use crate::{Result, VcReadError};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Voice parameters a backend needs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    pub speaker_id: u32,
    pub speed: f32,
    pub pitch: f32,
}

impl From<&VoiceSettings> for VoiceParams {
    fn from(v: &VoiceSettings) -> Self {
        Self {
            speaker_id: v.speaker_id,
            speed: v.speed,
            pitch: v.pitch,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>>;
}

fn build_client(timeout_ms: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| VcReadError::ConfigError(format!("Failed to build HTTP client: {e}")))
}

async fn ensure_success(resp: Response, step: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(VcReadError::SynthesisError(format!(
        "{step} failed: status={status} body={body}"
    )))
}

async fn audio_body(resp: Response, step: &str) -> Result<Vec<u8>> {
    let bytes = resp.bytes().await?;
    if bytes.is_empty() {
        return Err(VcReadError::SynthesisError(format!("{step} returned no audio")));
    }
    Ok(bytes.to_vec())
}

/// Primary backend speaking the `audio_query` / `synthesis` protocol
#[derive(Clone)]
pub struct AudioQueryBackend {
    http: Client,
    base_url: String,
}

impl AudioQueryBackend {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout_ms)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SpeechBackend for AudioQueryBackend {
    fn name(&self) -> &'static str {
        "audio_query"
    }

    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>> {
        let speaker = voice.speaker_id.to_string();

        let query_url = format!("{}/audio_query", self.base_url);
        debug!(target = "synth", "POST {}", query_url);
        let resp = self
            .http
            .post(&query_url)
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .send()
            .await?;
        let mut query: serde_json::Value = ensure_success(resp, "audio_query")
            .await?
            .json()
            .await
            .map_err(|e| VcReadError::SynthesisError(format!("Malformed audio_query JSON: {e}")))?;

        let params = query.as_object_mut().ok_or_else(|| {
            VcReadError::SynthesisError("audio_query response is not an object".into())
        })?;
        params.insert("speedScale".into(), json!(voice.speed));
        params.insert("pitchScale".into(), json!(voice.pitch));

        let synth_url = format!("{}/synthesis", self.base_url);
        debug!(target = "synth", "POST {}", synth_url);
        let resp = self
            .http
            .post(&synth_url)
            .query(&[("speaker", speaker.as_str())])
            .json(&query)
            .send()
            .await?;
        audio_body(ensure_success(resp, "synthesis").await?, "synthesis").await
    }
}

/// Fallback backend taking plain text only
#[derive(Clone)]
pub struct PlainTextBackend {
    http: Client,
    url: String,
}

impl PlainTextBackend {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout_ms)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SpeechBackend for PlainTextBackend {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Vec<u8>> {
        debug!(target = "synth", "POST {}", self.url);
        let resp = self
            .http
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        audio_body(ensure_success(resp, "fallback").await?, "fallback").await
    }
}

pub struct Synthesizer {
    cache: Arc<AudioCache>,
    primary: Arc<dyn SpeechBackend>,
    fallback: Option<Arc<dyn SpeechBackend>>,
    stats: Arc<Stats>,
}

impl Synthesizer {
    pub fn new(
        cache: Arc<AudioCache>,
        primary: Arc<dyn SpeechBackend>,
        fallback: Option<Arc<dyn SpeechBackend>>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            cache,
            primary,
            fallback,
            stats,
        }
    }

    /// Build the HTTP backends described by `cfg`
    pub fn from_config(cfg: &BackendConfig, cache: Arc<AudioCache>, stats: Arc<Stats>) -> Result<Self> {
        let primary: Arc<dyn SpeechBackend> =
            Arc::new(AudioQueryBackend::new(cfg.primary_url.clone(), cfg.request_timeout_ms)?);
        let fallback = match &cfg.fallback_url {
            Some(url) => Some(Arc::new(PlainTextBackend::new(url.clone(), cfg.request_timeout_ms)?)
                as Arc<dyn SpeechBackend>),
            None => {
                warn!(target = "synth", "No fallback backend configured; fallback-routed items will be dropped");
                None
            }
        };
        Ok(Self::new(cache, primary, fallback, stats))
    }

    pub fn cache(&self) -> &Arc<AudioCache> {
        &self.cache
    }

    /// Resolve audio for one utterance
    pub async fn resolve(&self, text: &str, engine: Engine, voice: &VoiceParams) -> Result<AudioArtifact> {
        self.stats.record_request(engine);
        let resolved = match engine {
            Engine::Primary => self.resolve_primary(text, voice).await,
            Engine::Fallback => self.resolve_fallback(text, voice).await,
        };
        if let Err(e) = &resolved {
            self.stats.record_failure();
            warn!(target = "synth", engine = engine.as_str(), error = %e, "Synthesis failed");
        }
        resolved
    }

    async fn resolve_primary(&self, text: &str, voice: &VoiceParams) -> Result<AudioArtifact> {
        let key = fingerprint(text, voice.speaker_id, voice.speed, voice.pitch);
        let cache = Arc::clone(&self.cache);
        let lookup_key = key.clone();
        let hit = match tokio::task::spawn_blocking(move || cache.lookup(&lookup_key)).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(target = "synth", error = %e, "Cache lookup task failed; treating as miss");
                None
            }
        };
        if let Some(hit) = hit {
            self.stats.record_cache(true);
            debug!(target = "synth", key = %key, "Cache hit");
            return Ok(hit);
        }
        self.stats.record_cache(false);

        let audio = self.primary.synthesize(text, voice).await?;

        let cache = Arc::clone(&self.cache);
        let stored = tokio::task::spawn_blocking(move || {
            let stored = cache.insert(&key, &audio);
            (stored, audio)
        })
        .await;

        match stored {
            Ok((Ok(artifact), _)) => Ok(artifact),
            Ok((Err(e), audio)) => {
                warn!(target = "synth", error = %e, "Cache write failed; playing uncached audio");
                Ok(AudioArtifact::Inline(audio))
            }
            Err(e) => Err(VcReadError::CacheError(format!("cache insert task failed: {e}"))),
        }
    }

    async fn resolve_fallback(&self, text: &str, voice: &VoiceParams) -> Result<AudioArtifact> {
        let backend = self
            .fallback
            .as_ref()
            .ok_or_else(|| VcReadError::SynthesisError("fallback backend not configured".into()))?;
        let audio = backend.synthesize(text, voice).await?;
        Ok(AudioArtifact::Inline(audio))
    }
}
