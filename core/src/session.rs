//! Per-guild read-aloud session.
//!
//! A `Session` owns at most one voice connection and a FIFO of utterances.
//! The drain loop is a self-rescheduling task: every entry point (enqueue,
//! playback finished, ActiveSpeech poll, controls) spawns one step, and the
//! `is_playing` slot guarantees that only one item is ever being
//! synthesized or played.
//!
//! Every connection gets an epoch. The connection's listener task, pending
//! polls and in-flight drain steps carry the epoch they started under and
//! give up once it changes, so a teardown never has to chase them down.
//!
//! Connection lifecycle:
//! - Inactive → Connecting (`connect`) → Ready
//! - Ready → Disconnected → Ready when the transport resumes within the
//!   resume window, else the handle is destroyed
//! - Destroyed → state reset, registry notified → Inactive

use crate::cache::AudioArtifact;
use crate::config::SessionTimings;
use crate::ledger::UsageLedger;
use crate::notice::{Notice, NoticeSink};
use crate::router::{EngineRouter, Route};
use crate::settings::{Engine, GuildSettings, SettingsStore, VoiceSettings};
use crate::synth::{Synthesizer, VoiceParams};
use crate::transport::{
    current_state, destroy_quietly, wait_ready, ConnectionState, JoinedConnection, TransportEvent,
    VoiceConnection, VoiceTransport,
};
use crate::{ChannelId, GuildId, MessageId, UserId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Collaborators shared by all sessions
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn VoiceTransport>,
    pub settings: Arc<dyn SettingsStore>,
    pub ledger: Arc<dyn UsageLedger>,
    pub synthesizer: Arc<Synthesizer>,
    pub notices: Arc<dyn NoticeSink>,
    pub router: EngineRouter,
    pub timings: SessionTimings,
    pub default_speaker_id: u32,
}

/// One queued utterance. The engine decision is fixed at enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    pub text: String,
    pub user_id: UserId,
    pub forced_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Hard cap reached; nothing was billed
    OverLimit,
    /// Ledger could not be read or written; nothing was queued
    LedgerUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Connecting,
    Ready,
    /// Transport dropped; waiting for it to resume
    Reconnecting,
}

#[derive(Default)]
struct SessionInner {
    connection: Option<Arc<dyn VoiceConnection>>,
    epoch: u64,
    voice_channel: Option<ChannelId>,
    text_target: Option<ChannelId>,
    queue: VecDeque<PlaybackItem>,
    is_playing: bool,
    is_connecting: bool,
    intentional_disconnect: bool,
    speaking_users: HashSet<UserId>,
    strike_count: u32,
    pending_warning: Option<MessageId>,
    warning_in_flight: bool,
    force_next: bool,
    poll_generation: u64,
    poll_pending: bool,
}

impl SessionInner {
    fn is_active(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| current_state(c.as_ref()) != ConnectionState::Destroyed)
    }

    fn cancel_poll(&mut self) {
        self.poll_generation += 1;
        self.poll_pending = false;
    }

    fn take_warning(&mut self) -> Option<(ChannelId, MessageId)> {
        self.strike_count = 0;
        let id = self.pending_warning.take()?;
        Some((self.text_target.clone()?, id))
    }

    fn should_wait(&self, active_speech: bool) -> bool {
        active_speech && !self.force_next && !self.speaking_users.is_empty()
    }
}

pub struct Session {
    guild_id: GuildId,
    deps: SessionDeps,
    inner: Mutex<SessionInner>,
    /// Serializes route, bill and enqueue so each decision sees the previous charge
    admission: Mutex<()>,
    destroyed_tx: Option<mpsc::UnboundedSender<GuildId>>,
}

impl Session {
    /// `destroyed_tx` receives the guild id whenever the connection is torn down
    pub fn new(
        guild_id: GuildId,
        deps: SessionDeps,
        destroyed_tx: Option<mpsc::UnboundedSender<GuildId>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            deps,
            inner: Mutex::new(SessionInner::default()),
            admission: Mutex::new(()),
            destroyed_tx,
        })
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    pub async fn state(&self) -> SessionState {
        let inner = self.inner.lock().await;
        if inner.is_connecting {
            return SessionState::Connecting;
        }
        match inner.connection.as_ref().map(|c| current_state(c.as_ref())) {
            None | Some(ConnectionState::Destroyed) => SessionState::Inactive,
            Some(ConnectionState::Ready) => SessionState::Ready,
            Some(ConnectionState::Disconnected) => SessionState::Reconnecting,
            Some(_) => SessionState::Connecting,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.is_active()
    }

    pub async fn is_connecting(&self) -> bool {
        self.inner.lock().await.is_connecting
    }

    pub async fn is_playing(&self) -> bool {
        self.inner.lock().await.is_playing
    }

    pub async fn voice_channel(&self) -> Option<ChannelId> {
        self.inner.lock().await.voice_channel.clone()
    }

    pub async fn text_target(&self) -> Option<ChannelId> {
        self.inner.lock().await.text_target.clone()
    }

    pub async fn set_text_target(&self, channel: Option<ChannelId>) {
        self.inner.lock().await.text_target = channel;
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn queued(&self) -> Vec<PlaybackItem> {
        self.inner.lock().await.queue.iter().cloned().collect()
    }

    pub async fn speaking_count(&self) -> usize {
        self.inner.lock().await.speaking_users.len()
    }

    pub async fn strike_count(&self) -> u32 {
        self.inner.lock().await.strike_count
    }

    pub async fn pending_warning(&self) -> Option<MessageId> {
        self.inner.lock().await.pending_warning.clone()
    }

    // ---------------------------------------------------------------
    // Settings
    // ---------------------------------------------------------------

    async fn guild_settings(&self) -> GuildSettings {
        match self.deps.settings.guild_settings(&self.guild_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(target = "session", guild = %self.guild_id, error = %e, "Guild settings unavailable; using defaults");
                GuildSettings::default()
            }
        }
    }

    async fn active_speech_enabled(&self) -> bool {
        self.guild_settings().await.active_speech
    }

    async fn voice_for(&self, user: &UserId) -> VoiceSettings {
        match self.deps.settings.voice_settings(&self.guild_id, user).await {
            Ok(Some(voice)) => voice,
            Ok(None) => VoiceSettings::with_speaker(self.deps.default_speaker_id),
            Err(e) => {
                warn!(target = "session", guild = %self.guild_id, user = %user, error = %e, "Voice settings unavailable; using defaults");
                VoiceSettings::with_speaker(self.deps.default_speaker_id)
            }
        }
    }

    // ---------------------------------------------------------------
    // Notices
    // ---------------------------------------------------------------

    fn post_detached(&self, target: Option<ChannelId>, notice: Notice) {
        let Some(target) = target else {
            return;
        };
        let notices = Arc::clone(&self.deps.notices);
        let guild = self.guild_id.clone();
        tokio::spawn(async move {
            if let Err(e) = notices.send(&target, &notice).await {
                warn!(target = "session", guild = %guild, error = %e, "Failed to post notice");
            }
        });
    }

    fn delete_detached(&self, warning: Option<(ChannelId, MessageId)>) {
        let Some((channel, id)) = warning else {
            return;
        };
        let notices = Arc::clone(&self.deps.notices);
        tokio::spawn(async move {
            if let Err(e) = notices.delete(&channel, &id).await {
                debug!(target = "session", error = %e, "Failed to remove warning notice");
            }
        });
    }

    // ---------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------

    /// Join `channel` and read `text_target`. Re-binding to the channel the
    /// session is already in only swaps the text target.
    pub async fn connect(self: &Arc<Self>, channel: ChannelId, text_target: Option<ChannelId>) -> bool {
        let (previous, warning) = {
            let mut inner = self.inner.lock().await;
            if inner.is_connecting {
                debug!(target = "session", guild = %self.guild_id, "Connect already in flight");
                return false;
            }
            if inner.is_active() && inner.voice_channel.as_ref() == Some(&channel) {
                inner.text_target = text_target;
                drop(inner);
                self.refresh_mute().await;
                return true;
            }
            inner.is_connecting = true;
            inner.epoch += 1;
            inner.is_playing = false;
            inner.cancel_poll();
            // Speakers belong to the old channel; its listener will never report them stopping
            inner.speaking_users.clear();
            inner.force_next = false;
            let warning = inner.take_warning();
            inner.voice_channel = Some(channel.clone());
            (inner.connection.take(), warning)
        };
        self.delete_detached(warning);

        if let Some(old) = previous {
            destroy_quietly(old.as_ref(), &self.guild_id);
        }

        let self_mute = !self.active_speech_enabled().await;
        let joined = match self
            .deps
            .transport
            .join(&self.guild_id, &channel, self_mute)
            .await
        {
            Ok(joined) => {
                match wait_ready(joined.connection.as_ref(), self.deps.timings.connect_timeout).await {
                    Ok(()) => Ok(joined),
                    Err(e) => {
                        destroy_quietly(joined.connection.as_ref(), &self.guild_id);
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };

        let mut inner = self.inner.lock().await;
        inner.is_connecting = false;
        match joined {
            Ok(JoinedConnection { connection, events }) => {
                inner.connection = Some(Arc::clone(&connection));
                inner.text_target = text_target;
                let epoch = inner.epoch;
                drop(inner);

                let this = Arc::clone(self);
                tokio::spawn(async move { this.watch_connection(epoch, connection, events).await });
                info!(target = "session", guild = %self.guild_id, channel = %channel, self_mute, "Connected");
                self.kick();
                true
            }
            Err(e) => {
                warn!(target = "session", guild = %self.guild_id, channel = %channel, error = %e, "Voice connect failed");
                self.reset_state(&mut inner, false);
                false
            }
        }
    }

    /// Leave the voice channel. Only automatic disconnects post a notice.
    pub async fn disconnect(&self, automatic: bool) {
        let mut inner = self.inner.lock().await;
        if inner.is_connecting {
            debug!(target = "session", guild = %self.guild_id, "Disconnect ignored while connecting");
            return;
        }
        inner.intentional_disconnect = !automatic;

        match inner.connection.clone() {
            Some(conn) if current_state(conn.as_ref()) != ConnectionState::Destroyed => {
                drop(inner);
                // The listener observes Destroyed and resets the session
                destroy_quietly(conn.as_ref(), &self.guild_id);
            }
            _ => {
                inner.intentional_disconnect = false;
                let target = self.reset_state(&mut inner, automatic);
                drop(inner);
                self.post_detached(target, Notice::AutoDisconnected);
                self.notify_destroyed();
            }
        }
    }

    /// Re-apply the self-mute policy: muted unless ActiveSpeech needs to hear speakers
    pub async fn refresh_mute(&self) {
        let conn = {
            let inner = self.inner.lock().await;
            if inner.is_connecting || !inner.is_active() {
                return;
            }
            inner.connection.clone()
        };
        let mute = !self.active_speech_enabled().await;
        if let Some(conn) = conn {
            if let Err(e) = conn.set_self_mute(mute).await {
                warn!(target = "session", guild = %self.guild_id, error = %e, "Self-mute update failed");
            }
        }
    }

    /// Clear everything tied to the current connection. Returns the text
    /// target when an auto-disconnect notice should be posted.
    fn reset_state(&self, inner: &mut SessionInner, automatic: bool) -> Option<ChannelId> {
        info!(target = "session", guild = %self.guild_id, automatic, "Resetting session state");
        let warning = inner.take_warning();
        self.delete_detached(warning);

        inner.epoch += 1;
        inner.connection = None;
        inner.queue.clear();
        inner.is_playing = false;
        inner.speaking_users.clear();
        inner.force_next = false;
        inner.cancel_poll();

        let target = inner.text_target.take();
        inner.voice_channel = None;
        if automatic {
            target
        } else {
            None
        }
    }

    fn notify_destroyed(&self) {
        if let Some(tx) = &self.destroyed_tx {
            let _ = tx.send(self.guild_id.clone());
        }
    }

    async fn on_destroyed(&self, epoch: u64) {
        let target = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            let automatic = !inner.intentional_disconnect;
            inner.intentional_disconnect = false;
            self.reset_state(&mut inner, automatic)
        };
        info!(target = "session", guild = %self.guild_id, "Voice connection destroyed");
        self.post_detached(target, Notice::AutoDisconnected);
        self.notify_destroyed();
    }

    /// Wait for a dropped connection to come back on its own
    async fn try_resume(&self, state: &mut watch::Receiver<ConnectionState>) -> bool {
        let resumed = tokio::time::timeout(
            self.deps.timings.resume_window,
            state.wait_for(|s| s.is_resuming() || *s == ConnectionState::Destroyed),
        )
        .await;
        matches!(resumed, Ok(Ok(s)) if s.is_resuming())
    }

    /// Listener scoped to one connection
    async fn watch_connection(
        self: Arc<Self>,
        epoch: u64,
        conn: Arc<dyn VoiceConnection>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let mut state = conn.state();
        let mut events_open = true;
        loop {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if !self.on_transport_event(epoch, event).await {
                            return;
                        }
                    }
                    None => events_open = false,
                },
                changed = state.changed() => {
                    let current = match changed {
                        Ok(()) => *state.borrow_and_update(),
                        Err(_) => ConnectionState::Destroyed,
                    };
                    match current {
                        ConnectionState::Disconnected => {
                            if self.try_resume(&mut state).await {
                                info!(target = "session", guild = %self.guild_id, "Voice connection resumed");
                                continue;
                            }
                            info!(target = "session", guild = %self.guild_id, "Voice connection did not resume; tearing down");
                            destroy_quietly(conn.as_ref(), &self.guild_id);
                            self.on_destroyed(epoch).await;
                            return;
                        }
                        ConnectionState::Destroyed => {
                            self.on_destroyed(epoch).await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Returns false once the event belongs to a stale connection
    async fn on_transport_event(self: &Arc<Self>, epoch: u64, event: TransportEvent) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return false;
        }
        match event {
            TransportEvent::SpeakingStarted(user) => {
                inner.speaking_users.insert(user);
            }
            TransportEvent::SpeakingStopped(user) => {
                inner.speaking_users.remove(&user);
            }
            TransportEvent::PlaybackFinished => {
                inner.is_playing = false;
                drop(inner);
                self.kick();
            }
            TransportEvent::PlaybackFailed(reason) => {
                warn!(target = "session", guild = %self.guild_id, error = %reason, "Playback failed");
                inner.is_playing = false;
                drop(inner);
                self.kick();
            }
        }
        true
    }

    // ---------------------------------------------------------------
    // Queue
    // ---------------------------------------------------------------

    /// Route, bill and enqueue one utterance
    pub async fn add_queue(self: &Arc<Self>, text: String, user: UserId) -> EnqueueOutcome {
        let guild = self.guild_settings().await;

        // Held until the item is queued; lock order is admission, then inner
        let _admission = self.admission.lock().await;
        let usage = match self.deps.ledger.get(&self.guild_id).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(target = "session", guild = %self.guild_id, error = %e, "Usage ledger unreadable; rejecting utterance");
                return EnqueueOutcome::LedgerUnavailable;
            }
        };

        let voice = self.voice_for(&user).await;
        let decision = match self.deps.router.decide(&usage, voice.engine, guild.licensed) {
            Route::Drop => {
                info!(target = "session", guild = %self.guild_id, cost = usage.cost, "Usage limit reached; utterance dropped");
                return EnqueueOutcome::OverLimit;
            }
            Route::Speak(decision) => decision,
        };

        let cost = decision.cost_of(&text);
        let after = match self.deps.ledger.add(&self.guild_id, cost).await {
            Ok(after) => after,
            Err(e) => {
                warn!(target = "session", guild = %self.guild_id, error = %e, "Usage ledger unwritable; rejecting utterance");
                return EnqueueOutcome::LedgerUnavailable;
            }
        };

        let mut inner = self.inner.lock().await;
        if !guild.licensed
            && self
                .deps
                .router
                .crossed_threshold(after.cost - cost, after.cost, &decision)
        {
            info!(target = "session", guild = %self.guild_id, total = after.cost, "Primary threshold crossed");
            self.post_detached(
                inner.text_target.clone(),
                Notice::PrimaryThresholdReached {
                    threshold: self.deps.router.limits().primary_threshold,
                },
            );
        }

        debug!(target = "session", guild = %self.guild_id, engine = decision.engine.as_str(), cost, "Queued utterance");
        inner.queue.push_back(PlaybackItem {
            text,
            user_id: user,
            forced_fallback: decision.forced_fallback,
        });
        drop(inner);

        self.kick();
        EnqueueOutcome::Queued
    }

    /// Play the waiting item now, ignoring ActiveSpeech once
    pub async fn force_play(self: &Arc<Self>) {
        let warning = {
            let mut inner = self.inner.lock().await;
            inner.cancel_poll();
            inner.force_next = true;
            inner.take_warning()
        };
        self.delete_detached(warning);
        self.kick();
    }

    /// Drop the item that is waiting on ActiveSpeech
    pub async fn skip_head(self: &Arc<Self>) {
        let warning = {
            let mut inner = self.inner.lock().await;
            inner.cancel_poll();
            if !inner.is_playing {
                inner.queue.pop_front();
            }
            inner.take_warning()
        };
        self.delete_detached(warning);
        self.kick();
    }

    fn kick(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain(None).await });
    }

    fn schedule_poll(self: &Arc<Self>, inner: &mut SessionInner) {
        inner.poll_generation += 1;
        inner.poll_pending = true;
        let generation = inner.poll_generation;
        let delay = self.deps.timings.poll_interval;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.drain(Some(generation)).await;
        });
    }

    fn begin_warning(self: &Arc<Self>, inner: &mut SessionInner) {
        let Some(target) = inner.text_target.clone() else {
            return;
        };
        inner.warning_in_flight = true;
        let waited = self.deps.timings.poll_interval * inner.strike_count;
        let notice = Notice::ActiveSpeechWaiting {
            waited_secs: waited.as_secs(),
        };
        let epoch = inner.epoch;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let posted = match this.deps.notices.send(&target, &notice).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(target = "session", guild = %this.guild_id, error = %e, "Failed to post ActiveSpeech warning");
                    None
                }
            };
            let mut inner = this.inner.lock().await;
            inner.warning_in_flight = false;
            let Some(id) = posted else {
                return;
            };
            // Still waiting on the same connection: keep it so it can be cleaned up later
            if inner.epoch == epoch && inner.strike_count > 0 {
                inner.pending_warning = Some(id);
            } else {
                drop(inner);
                this.delete_detached(Some((target, id)));
            }
        });
    }

    /// One drain step. `poll` carries the generation of the timer that
    /// scheduled it; plain kicks pass `None`.
    async fn drain(self: Arc<Self>, mut poll: Option<u64>) {
        loop {
            let active_speech = self.active_speech_enabled().await;

            let (conn, epoch, warning) = {
                let mut inner = self.inner.lock().await;
                match poll.take() {
                    Some(generation) => {
                        if generation != inner.poll_generation {
                            return;
                        }
                        inner.poll_pending = false;
                    }
                    // A pending poll owns the next evaluation
                    None if inner.poll_pending => return,
                    None => {}
                }
                if inner.is_playing || inner.queue.is_empty() || !inner.is_active() {
                    return;
                }

                if inner.should_wait(active_speech) {
                    inner.strike_count += 1;
                    if inner.strike_count == self.deps.timings.warn_after_strikes
                        && inner.pending_warning.is_none()
                        && !inner.warning_in_flight
                    {
                        self.begin_warning(&mut inner);
                    }
                    self.schedule_poll(&mut inner);
                    return;
                }

                inner.force_next = false;
                let warning = inner.take_warning();
                inner.is_playing = true;
                let Some(conn) = inner.connection.clone() else {
                    inner.is_playing = false;
                    return;
                };
                (conn, inner.epoch, warning)
            };
            self.delete_detached(warning);

            if current_state(conn.as_ref()) != ConnectionState::Ready {
                if let Err(e) = wait_ready(conn.as_ref(), self.deps.timings.ready_wait).await {
                    debug!(target = "session", guild = %self.guild_id, error = %e, "Transport not ready; retrying");
                    let mut inner = self.inner.lock().await;
                    if inner.epoch == epoch {
                        inner.is_playing = false;
                        self.schedule_poll(&mut inner);
                    }
                    return;
                }
            }

            let item = {
                let mut inner = self.inner.lock().await;
                if inner.epoch != epoch {
                    return;
                }
                match inner.queue.pop_front() {
                    Some(item) if inner.is_active() => item,
                    _ => {
                        inner.is_playing = false;
                        return;
                    }
                }
            };

            let voice = self.voice_for(&item.user_id).await;
            let engine = if item.forced_fallback || voice.engine == Engine::Fallback {
                Engine::Fallback
            } else {
                Engine::Primary
            };
            let resolved = self
                .deps
                .synthesizer
                .resolve(&item.text, engine, &VoiceParams::from(&voice))
                .await;

            {
                let mut inner = self.inner.lock().await;
                if inner.epoch != epoch || !inner.is_active() {
                    debug!(target = "session", guild = %self.guild_id, "Session moved on; discarding synthesized audio");
                    if inner.epoch == epoch {
                        inner.is_playing = false;
                    }
                    return;
                }
                if resolved.is_err() {
                    // Dropped, not requeued
                    inner.is_playing = false;
                    continue;
                }
            }

            if let Ok(audio) = resolved {
                if self.start_playback(&conn, epoch, audio).await {
                    return;
                }
            }
        }
    }

    /// Hand audio to the transport. Returns false when the next item should be tried.
    async fn start_playback(&self, conn: &Arc<dyn VoiceConnection>, epoch: u64, audio: AudioArtifact) -> bool {
        let Err(e) = conn.play(audio).await else {
            return true;
        };
        warn!(target = "session", guild = %self.guild_id, error = %e, "Transport rejected audio");
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return true;
        }
        inner.is_playing = false;
        false
    }
}
