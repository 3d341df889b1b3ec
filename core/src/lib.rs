// vcread Core Library
// Per-guild read-aloud sessions, engine routing and the synthesis cache

pub mod cache;
pub mod config;
pub mod ledger;
pub mod notice;
pub mod registry;
pub mod router;
pub mod session;
pub mod settings;
pub mod stats;
#[cfg(feature = "persistent")]
pub mod storage;
pub mod synth;
pub mod text;
pub mod transport;

// Export core types
pub use cache::{fingerprint, AudioArtifact, AudioCache, CacheEntry};
pub use config::{BackendConfig, CacheConfig, CoreConfig, SessionTimings, TextConfig, UsageLimits};
pub use ledger::{InMemoryLedger, UsageLedger, UsageRecord};
pub use notice::{Notice, NoticeControl, NoticeSink};
pub use registry::{InboundMessage, SessionRegistry, VoiceStateChange};
pub use router::{EngineRouter, Route, RoutingDecision};
pub use session::{EnqueueOutcome, PlaybackItem, Session, SessionDeps, SessionState};
pub use settings::{Engine, GuildSettings, InMemorySettings, SettingsStore, VoiceSettings};
pub use stats::{Stats, StatsSnapshot};
pub use synth::{AudioQueryBackend, PlainTextBackend, SpeechBackend, Synthesizer, VoiceParams};
pub use text::TextPipeline;
pub use transport::{ConnectionState, JoinedConnection, TransportEvent, VoiceConnection, VoiceTransport};
#[cfg(feature = "persistent")]
pub use storage::Storage;

/// Guild (group) identifier as handed out by the chat platform
pub type GuildId = String;
/// Voice or text channel identifier
pub type ChannelId = String;
/// User identifier
pub type UserId = String;
/// Identifier of a notice posted to a text channel
pub type MessageId = String;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VcReadError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Synthesis error: {0}")]
    SynthesisError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Ledger error: {0}")]
    LedgerError(String),

    #[error("Settings error: {0}")]
    SettingsError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Notice error: {0}")]
    NoticeError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, VcReadError>;
