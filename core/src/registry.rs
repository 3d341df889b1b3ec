//! Session registry: one `Session` per guild, plus routing of inbound chat
//! messages and voice-state changes to the right session.
//!
//! Sessions report their teardown on an unbounded channel; a reaper task
//! forgets them once they are inactive.

use crate::notice::{Notice, NoticeControl};
use crate::session::{EnqueueOutcome, Session, SessionDeps, SessionState};
use crate::settings::GuildSettings;
use crate::text::TextPipeline;
use crate::{ChannelId, GuildId, UserId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A chat message seen by the bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub guild_id: GuildId,
    pub text_channel: ChannelId,
    pub author_id: UserId,
    pub author_is_bot: bool,
    /// Voice channel the author is currently in
    pub author_voice_channel: Option<ChannelId>,
    pub content: String,
    pub has_image: bool,
}

/// A member moved between voice channels (either side may be empty)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceStateChange {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub display_name: String,
    pub is_bot: bool,
    pub old_channel: Option<ChannelId>,
    pub new_channel: Option<ChannelId>,
    /// Non-bot members still in `old_channel` after the change
    pub humans_left_in_old: usize,
}

pub struct SessionRegistry {
    sessions: DashMap<GuildId, Arc<Session>>,
    deps: SessionDeps,
    text: TextPipeline,
    destroyed_tx: mpsc::UnboundedSender<GuildId>,
}

impl SessionRegistry {
    /// Must be called inside a tokio runtime; spawns the reaper task
    pub fn new(deps: SessionDeps, text: TextPipeline) -> Arc<Self> {
        let (destroyed_tx, destroyed_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            sessions: DashMap::new(),
            deps,
            text,
            destroyed_tx,
        });
        tokio::spawn(Self::reap(Arc::downgrade(&registry), destroyed_rx));
        registry
    }

    async fn reap(registry: Weak<Self>, mut destroyed: mpsc::UnboundedReceiver<GuildId>) {
        while let Some(guild) = destroyed.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.forget_if_inactive(&guild).await;
        }
        debug!(target = "registry", "Reaper stopped");
    }

    async fn forget_if_inactive(&self, guild: &GuildId) {
        let Some(session) = self.session(guild) else {
            return;
        };
        if session.state().await != SessionState::Inactive {
            return;
        }
        if self
            .sessions
            .remove_if(guild, |_, s| Arc::ptr_eq(s, &session))
            .is_some()
        {
            info!(target = "registry", guild = %guild, "Session forgotten");
        }
    }

    pub fn session(&self, guild: &GuildId) -> Option<Arc<Session>> {
        self.sessions.get(guild).map(|s| Arc::clone(s.value()))
    }

    pub fn get_or_create(&self, guild: &GuildId) -> Arc<Session> {
        let entry = self.sessions.entry(guild.clone()).or_insert_with(|| {
            debug!(target = "registry", guild = %guild, "Creating session");
            Session::new(
                guild.clone(),
                self.deps.clone(),
                Some(self.destroyed_tx.clone()),
            )
        });
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Join `voice` and read `text`
    pub async fn join(&self, guild: &GuildId, voice: ChannelId, text: Option<ChannelId>) -> bool {
        let session = self.get_or_create(guild);
        let joined = session.connect(voice, text).await;
        if !joined {
            self.forget_if_inactive(guild).await;
        }
        joined
    }

    /// Leave on request. Returns false when there was no session.
    pub async fn leave(&self, guild: &GuildId) -> bool {
        match self.session(guild) {
            Some(session) => {
                session.disconnect(false).await;
                true
            }
            None => false,
        }
    }

    /// Route a control attached to an ActiveSpeech warning
    pub async fn handle_control(&self, guild: &GuildId, control: NoticeControl) -> bool {
        let Some(session) = self.session(guild) else {
            return false;
        };
        match control {
            NoticeControl::ForcePlay => session.force_play().await,
            NoticeControl::Skip => session.skip_head().await,
        }
        true
    }

    async fn guild_settings(&self, guild: &GuildId) -> GuildSettings {
        match self.deps.settings.guild_settings(guild).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(target = "registry", guild = %guild, error = %e, "Guild settings unavailable; using defaults");
                GuildSettings::default()
            }
        }
    }

    async fn post(&self, channel: &ChannelId, notice: Notice) {
        if let Err(e) = self.deps.notices.send(channel, &notice).await {
            warn!(target = "registry", channel = %channel, error = %e, "Failed to post notice");
        }
    }

    /// Read a chat message aloud if it belongs to an active session.
    ///
    /// A session joined without a text target binds to the first text
    /// channel a member of its voice channel writes in.
    pub async fn handle_message(&self, msg: &InboundMessage) -> Option<EnqueueOutcome> {
        if msg.author_is_bot {
            return None;
        }
        let session = self.session(&msg.guild_id)?;
        if !session.is_active().await {
            return None;
        }

        match session.text_target().await {
            Some(target) if target == msg.text_channel => {}
            Some(_) => return None,
            None => {
                let voice = session.voice_channel().await;
                if voice.is_none() || msg.author_voice_channel != voice {
                    return None;
                }
                session.set_text_target(Some(msg.text_channel.clone())).await;
                info!(target = "registry", guild = %msg.guild_id, channel = %msg.text_channel, "Bound text channel");
                self.post(&msg.text_channel, Notice::TextChannelBound).await;
            }
        }

        let guild = self.guild_settings(&msg.guild_id).await;
        let text = self
            .text
            .prepare(&msg.content, msg.has_image, &guild.dictionary)?;
        Some(session.add_queue(text, msg.author_id.clone()).await)
    }

    /// React to a member moving between voice channels
    pub async fn handle_voice_state(&self, change: &VoiceStateChange) {
        let guild_id = &change.guild_id;
        if change.is_bot || change.old_channel == change.new_channel {
            if let Some(session) = self.session(guild_id) {
                session.refresh_mute().await;
            }
            return;
        }

        let guild = self.guild_settings(guild_id).await;

        if let Some(session) = self.session(guild_id) {
            let bound = session.voice_channel().await;
            if bound.is_some() && change.old_channel == bound {
                if change.humans_left_in_old == 0 {
                    info!(target = "registry", guild = %guild_id, "Voice channel empty; leaving");
                    session.disconnect(true).await;
                    return;
                }
                if guild.read_leave {
                    session
                        .add_queue(format!("{} left", change.display_name), change.user_id.clone())
                        .await;
                }
            }
            if bound.is_some() && change.new_channel == bound && guild.read_join {
                session
                    .add_queue(format!("{} joined", change.display_name), change.user_id.clone())
                    .await;
            }
        }

        if let Some(channel) = &change.new_channel {
            self.maybe_auto_join(change, channel, &guild).await;
        }

        if let Some(session) = self.session(guild_id) {
            session.refresh_mute().await;
        }
    }

    async fn maybe_auto_join(&self, change: &VoiceStateChange, channel: &ChannelId, guild: &GuildSettings) {
        if let Some(session) = self.session(&change.guild_id) {
            if session.state().await != SessionState::Inactive {
                return;
            }
        }

        let follows = match self
            .deps
            .settings
            .voice_settings(&change.guild_id, &change.user_id)
            .await
        {
            Ok(voice) => voice.is_some_and(|v| v.follow_join),
            Err(e) => {
                debug!(target = "registry", error = %e, "Voice settings unavailable; ignoring follow-join");
                false
            }
        };
        if !follows && !(guild.auto_join && guild.is_auto_join_target(channel)) {
            return;
        }

        let text = guild.channel_pairs.get(channel).cloned();
        info!(target = "registry", guild = %change.guild_id, channel = %channel, follows, "Auto-joining");
        if self.join(&change.guild_id, channel.clone(), text.clone()).await {
            if let Some(text) = text {
                self.post(
                    &text,
                    Notice::AutoJoined {
                        voice_channel: channel.clone(),
                    },
                )
                .await;
            }
        }
    }
}
