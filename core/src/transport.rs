//! Realtime voice transport capability.
//!
//! The transport (joining a channel, encoding and sending frames, speaking
//! detection) is external. A session only sees these traits: a join that
//! yields a connection plus its event stream, the connection's state as a
//! `watch` channel, and a handful of commands.

use crate::cache::AudioArtifact;
use crate::{ChannelId, GuildId, Result, UserId, VcReadError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Signalling,
    Connecting,
    Ready,
    /// Transient; may resume on its own
    Disconnected,
    /// Terminal
    Destroyed,
}

impl ConnectionState {
    /// States a disconnected connection reaches when it is recovering
    pub fn is_resuming(&self) -> bool {
        matches!(
            self,
            ConnectionState::Signalling | ConnectionState::Connecting | ConnectionState::Ready
        )
    }
}

/// Events raised by a live connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    SpeakingStarted(UserId),
    SpeakingStopped(UserId),
    /// The audio handed to `play` finished
    PlaybackFinished,
    /// The audio handed to `play` could not be played to the end
    PlaybackFailed(String),
}

/// A fresh connection and the receiver for its events
pub struct JoinedConnection {
    pub connection: Arc<dyn VoiceConnection>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Start joining `channel`. The returned connection may not be Ready yet.
    async fn join(
        &self,
        guild: &GuildId,
        channel: &ChannelId,
        self_mute: bool,
    ) -> Result<JoinedConnection>;
}

#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Subscribe to state changes
    fn state(&self) -> watch::Receiver<ConnectionState>;

    async fn set_self_mute(&self, mute: bool) -> Result<()>;

    /// Start playing; completion is reported through the event stream
    async fn play(&self, audio: AudioArtifact) -> Result<()>;

    /// Tear the connection down. Implementations move the state to Destroyed.
    fn destroy(&self) -> Result<()>;
}

pub fn current_state(conn: &dyn VoiceConnection) -> ConnectionState {
    *conn.state().borrow()
}

/// Wait until the connection reaches Ready, bounded by `limit`
pub async fn wait_ready(conn: &dyn VoiceConnection, limit: Duration) -> Result<()> {
    let mut rx = conn.state();
    let waited = tokio::time::timeout(limit, rx.wait_for(|s| {
        matches!(s, ConnectionState::Ready | ConnectionState::Destroyed)
    }))
    .await;

    match waited {
        Ok(Ok(state)) if *state == ConnectionState::Ready => Ok(()),
        Ok(Ok(_)) => Err(VcReadError::TransportError("connection destroyed".into())),
        Ok(Err(_)) => Err(VcReadError::TransportError("connection state closed".into())),
        Err(_) => Err(VcReadError::Timeout(format!(
            "connection not ready within {}ms",
            limit.as_millis()
        ))),
    }
}

/// Destroy a connection, treating "already destroyed" as success
pub fn destroy_quietly(conn: &dyn VoiceConnection, guild: &GuildId) {
    if current_state(conn) == ConnectionState::Destroyed {
        return;
    }
    if let Err(e) = conn.destroy() {
        debug!(target = "transport", guild = %guild, error = %e, "Destroy raced with teardown; ignoring");
    }
}
