#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use vcread_core::config::CacheConfig;
use vcread_core::ledger::InMemoryLedger;
use vcread_core::settings::InMemorySettings;
use vcread_core::{
    AudioArtifact, AudioCache, ChannelId, ConnectionState, Engine, EngineRouter, GuildId,
    JoinedConnection, MessageId, Notice, NoticeSink, Result, Session, SessionDeps,
    SessionRegistry, SessionTimings, SettingsStore, SpeechBackend, Stats, Synthesizer,
    TextConfig, TextPipeline, TransportEvent, UsageLedger, UsageLimits, UsageRecord, UserId,
    VcReadError, VoiceConnection, VoiceParams, VoiceSettings, VoiceTransport,
};

pub const GUILD: &str = "g1";
pub const VOICE: &str = "vc1";
pub const TEXT: &str = "t1";

pub fn id(s: &str) -> String {
    s.to_string()
}

// Fake voice connection: records what it plays and lets tests drive state and events
pub struct FakeConnection {
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<TransportEvent>,
    played: Arc<Mutex<Vec<String>>>,
    mutes: Mutex<Vec<bool>>,
    auto_finish: bool,
}

impl FakeConnection {
    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub async fn emit(&self, event: TransportEvent) {
        self.events.send(event).await.unwrap();
    }

    pub fn mutes(&self) -> Vec<bool> {
        self.mutes.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceConnection for FakeConnection {
    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn set_self_mute(&self, mute: bool) -> Result<()> {
        self.mutes.lock().unwrap().push(mute);
        Ok(())
    }

    async fn play(&self, audio: AudioArtifact) -> Result<()> {
        let destroyed = *self.state.borrow() == ConnectionState::Destroyed;
        if destroyed {
            return Err(VcReadError::TransportError("destroyed".into()));
        }
        let bytes = audio.read().await?;
        self.played
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&bytes).into_owned());
        if self.auto_finish {
            let _ = self.events.send(TransportEvent::PlaybackFinished).await;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.state.send_replace(ConnectionState::Destroyed);
        Ok(())
    }
}

pub struct FakeTransport {
    pub joins: Mutex<Vec<(GuildId, ChannelId, bool)>>,
    pub connections: Mutex<Vec<Arc<FakeConnection>>>,
    pub played: Arc<Mutex<Vec<String>>>,
    /// New connections start Ready when set, else stay Connecting
    pub ready_on_join: AtomicBool,
    pub auto_finish: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            played: Arc::new(Mutex::new(Vec::new())),
            ready_on_join: AtomicBool::new(true),
            auto_finish: AtomicBool::new(true),
        })
    }

    pub fn join_count(&self) -> usize {
        self.joins.lock().unwrap().len()
    }

    pub fn last_connection(&self) -> Arc<FakeConnection> {
        Arc::clone(self.connections.lock().unwrap().last().unwrap())
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn join(
        &self,
        guild: &GuildId,
        channel: &ChannelId,
        self_mute: bool,
    ) -> Result<JoinedConnection> {
        self.joins
            .lock()
            .unwrap()
            .push((guild.clone(), channel.clone(), self_mute));

        let initial = if self.ready_on_join.load(Ordering::SeqCst) {
            ConnectionState::Ready
        } else {
            ConnectionState::Connecting
        };
        let (state, _) = watch::channel(initial);
        let (events_tx, events_rx) = mpsc::channel(64);
        let conn = Arc::new(FakeConnection {
            state,
            events: events_tx,
            played: Arc::clone(&self.played),
            mutes: Mutex::new(Vec::new()),
            auto_finish: self.auto_finish.load(Ordering::SeqCst),
        });
        self.connections.lock().unwrap().push(Arc::clone(&conn));
        Ok(JoinedConnection {
            connection: conn,
            events: events_rx,
        })
    }
}

// Backend that echoes `<tag>:<text>`, fails on texts containing FAIL
pub struct FakeBackend {
    tag: &'static str,
    pub delay: Mutex<Duration>,
    pub calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeBackend {
    pub fn new(tag: &'static str) -> Arc<Self> {
        Arc::new(Self {
            tag,
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechBackend for FakeBackend {
    fn name(&self) -> &'static str {
        self.tag
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(text.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if text.contains("FAIL") {
            return Err(VcReadError::SynthesisError("backend returned 500".into()));
        }
        Ok(format!("{}:{}", self.tag, text).into_bytes())
    }
}

#[derive(Default)]
pub struct RecordingNotices {
    pub sent: Mutex<Vec<(ChannelId, Notice, MessageId)>>,
    pub deleted: Mutex<Vec<MessageId>>,
}

impl RecordingNotices {
    pub fn sent(&self) -> Vec<(ChannelId, Notice)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(c, n, _)| (c.clone(), n.clone()))
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Notice) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|(_, n, _)| pred(n)).count()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl NoticeSink for RecordingNotices {
    async fn send(&self, channel: &ChannelId, notice: &Notice) -> Result<MessageId> {
        let mut sent = self.sent.lock().unwrap();
        let id = format!("m{}", sent.len() + 1);
        sent.push((channel.clone(), notice.clone(), id.clone()));
        Ok(id)
    }

    async fn delete(&self, _channel: &ChannelId, message: &MessageId) -> Result<()> {
        self.deleted.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Ledger whose backing store is down
pub struct UnreachableLedger;

#[async_trait]
impl UsageLedger for UnreachableLedger {
    async fn get(&self, _guild: &GuildId) -> Result<UsageRecord> {
        Err(VcReadError::LedgerError("connection refused".into()))
    }

    async fn add(&self, _guild: &GuildId, _delta: f64) -> Result<UsageRecord> {
        Err(VcReadError::LedgerError("connection refused".into()))
    }

    async fn roll_over(&self, _period: &str) -> Result<usize> {
        Err(VcReadError::LedgerError("connection refused".into()))
    }
}

/// In-memory ledger whose reads take a while, like a remote store
pub struct SlowLedger {
    pub inner: Arc<InMemoryLedger>,
    pub read_delay: Duration,
}

#[async_trait]
impl UsageLedger for SlowLedger {
    async fn get(&self, guild: &GuildId) -> Result<UsageRecord> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.get(guild).await
    }

    async fn add(&self, guild: &GuildId, delta: f64) -> Result<UsageRecord> {
        self.inner.add(guild, delta).await
    }

    async fn roll_over(&self, period: &str) -> Result<usize> {
        self.inner.roll_over(period).await
    }
}

pub struct Harness {
    pub transport: Arc<FakeTransport>,
    pub notices: Arc<RecordingNotices>,
    pub settings: Arc<InMemorySettings>,
    pub ledger: Arc<InMemoryLedger>,
    pub primary: Arc<FakeBackend>,
    pub fallback: Arc<FakeBackend>,
    pub stats: Arc<Stats>,
    pub deps: SessionDeps,
    _cache_dir: TempDir,
}

impl Harness {
    pub fn new(limits: UsageLimits) -> Self {
        Self::build(limits, None)
    }

    pub fn with_ledger(limits: UsageLimits, ledger: Arc<dyn UsageLedger>) -> Self {
        Self::build(limits, Some(ledger))
    }

    fn build(limits: UsageLimits, ledger_override: Option<Arc<dyn UsageLedger>>) -> Self {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            AudioCache::open(&CacheConfig {
                dir: cache_dir.path().to_path_buf(),
                max_bytes: 1 << 20,
                sweep_interval: Duration::from_secs(3600),
            })
            .unwrap(),
        );
        let stats = Arc::new(Stats::new());
        let primary = FakeBackend::new("primary");
        let fallback = FakeBackend::new("fallback");
        let synthesizer = Arc::new(Synthesizer::new(
            cache,
            Arc::clone(&primary) as Arc<dyn SpeechBackend>,
            Some(Arc::clone(&fallback) as Arc<dyn SpeechBackend>),
            Arc::clone(&stats),
        ));

        let transport = FakeTransport::new();
        let notices = Arc::new(RecordingNotices::default());
        let settings = InMemorySettings::new();
        let ledger = InMemoryLedger::new();
        let deps = SessionDeps {
            transport: Arc::clone(&transport) as Arc<dyn VoiceTransport>,
            settings: Arc::clone(&settings) as Arc<dyn SettingsStore>,
            ledger: ledger_override.unwrap_or_else(|| Arc::clone(&ledger) as Arc<dyn UsageLedger>),
            synthesizer,
            notices: Arc::clone(&notices) as Arc<dyn NoticeSink>,
            router: EngineRouter::new(limits),
            timings: SessionTimings::default(),
            default_speaker_id: 1,
        };

        Self {
            transport,
            notices,
            settings,
            ledger,
            primary,
            fallback,
            stats,
            deps,
            _cache_dir: cache_dir,
        }
    }

    pub fn session(&self) -> Arc<Session> {
        Session::new(id(GUILD), self.deps.clone(), None)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        SessionRegistry::new(
            self.deps.clone(),
            TextPipeline::new(TextConfig {
                max_read_length: 100,
                url_replacement: "URL".into(),
                image_placeholder: "image".into(),
                truncation_suffix: " (omitted)".into(),
            })
            .unwrap(),
        )
    }

    pub async fn prefer(&self, user: &str, engine: Engine) {
        let mut voice = VoiceSettings::with_speaker(1);
        voice.engine = engine;
        self.settings
            .set_voice_settings(&id(GUILD), &id(user), voice)
            .await
            .unwrap();
    }

    pub async fn enable_active_speech(&self) {
        let mut guild = self.settings.guild_settings(&id(GUILD)).await.unwrap();
        guild.active_speech = true;
        self.settings.set_guild_settings(&id(GUILD), guild).await.unwrap();
    }

    pub async fn usage(&self) -> f64 {
        self.ledger.get(&id(GUILD)).await.unwrap().cost
    }
}

pub fn limits(primary_threshold: f64, total_limit: f64) -> UsageLimits {
    UsageLimits {
        primary_threshold,
        total_limit,
    }
}

/// Poll `check` until it holds, sleeping between attempts
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn user(s: &str) -> UserId {
    id(s)
}
