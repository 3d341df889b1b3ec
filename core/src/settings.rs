//! Per-user voice settings and per-guild toggles.
//!
//! Writes come from the command/dashboard layer; the session only reads.

use crate::{ChannelId, GuildId, Result, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Synthesis backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// Cached, budget-limited
    #[default]
    Primary,
    /// Uncached, always available
    Fallback,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Primary => "primary",
            Engine::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub engine: Engine,
    pub speaker_id: u32,
    pub speed: f32,
    pub pitch: f32,
    /// Auto-join whatever voice channel this user enters
    #[serde(default)]
    pub follow_join: bool,
}

impl VoiceSettings {
    pub fn with_speaker(speaker_id: u32) -> Self {
        Self {
            engine: Engine::Primary,
            speaker_id,
            speed: 1.0,
            pitch: 0.0,
            follow_join: false,
        }
    }
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self::with_speaker(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildSettings {
    /// Defer playback while someone is speaking
    pub active_speech: bool,
    /// Licensed guilds are exempt from usage limits
    pub licensed: bool,
    /// Join the first voice channel a member enters while idle
    pub auto_join: bool,
    pub read_join: bool,
    pub read_leave: bool,
    /// When non-empty, only these voice channels are auto-joined
    pub allow_channels: BTreeSet<ChannelId>,
    pub ignore_channels: BTreeSet<ChannelId>,
    /// Voice channel → text channel bound on auto-join
    pub channel_pairs: BTreeMap<ChannelId, ChannelId>,
    /// Word → reading, applied before synthesis
    pub dictionary: BTreeMap<String, String>,
}

impl GuildSettings {
    /// Allow list wins when present, otherwise the ignore list applies
    pub fn is_auto_join_target(&self, channel: &ChannelId) -> bool {
        if !self.allow_channels.is_empty() {
            return self.allow_channels.contains(channel);
        }
        !self.ignore_channels.contains(channel)
    }
}

/// Settings CRUD
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Stored voice settings, if the user ever changed anything
    async fn voice_settings(&self, guild: &GuildId, user: &UserId) -> Result<Option<VoiceSettings>>;

    async fn set_voice_settings(
        &self,
        guild: &GuildId,
        user: &UserId,
        settings: VoiceSettings,
    ) -> Result<()>;

    async fn guild_settings(&self, guild: &GuildId) -> Result<GuildSettings>;

    async fn set_guild_settings(&self, guild: &GuildId, settings: GuildSettings) -> Result<()>;
}

/// In-memory implementation of SettingsStore.
///
/// Uses DashMap for concurrent access. Suitable for development and testing.
#[derive(Default)]
pub struct InMemorySettings {
    voices: DashMap<(GuildId, UserId), VoiceSettings>,
    guilds: DashMap<GuildId, GuildSettings>,
}

impl InMemorySettings {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SettingsStore for InMemorySettings {
    async fn voice_settings(&self, guild: &GuildId, user: &UserId) -> Result<Option<VoiceSettings>> {
        Ok(self
            .voices
            .get(&(guild.clone(), user.clone()))
            .map(|v| v.value().clone()))
    }

    async fn set_voice_settings(
        &self,
        guild: &GuildId,
        user: &UserId,
        settings: VoiceSettings,
    ) -> Result<()> {
        self.voices.insert((guild.clone(), user.clone()), settings);
        Ok(())
    }

    async fn guild_settings(&self, guild: &GuildId) -> Result<GuildSettings> {
        Ok(self
            .guilds
            .get(guild)
            .map(|g| g.value().clone())
            .unwrap_or_default())
    }

    async fn set_guild_settings(&self, guild: &GuildId, settings: GuildSettings) -> Result<()> {
        self.guilds.insert(guild.clone(), settings);
        Ok(())
    }
}
