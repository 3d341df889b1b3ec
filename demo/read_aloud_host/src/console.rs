//! Console stand-ins for the chat platform: a voice transport that "plays"
//! audio by logging it, and a notice sink that prints to stdout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use vcread_core::{
    AudioArtifact, ChannelId, ConnectionState, GuildId, JoinedConnection, MessageId, Notice,
    NoticeControl, NoticeSink, Result, TransportEvent, VcReadError, VoiceConnection, VoiceTransport,
};

pub struct ConsoleConnection {
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<TransportEvent>,
    ms_per_kb: u64,
}

#[async_trait]
impl VoiceConnection for ConsoleConnection {
    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn set_self_mute(&self, mute: bool) -> Result<()> {
        info!(target = "console", mute, "Self-mute");
        Ok(())
    }

    async fn play(&self, audio: AudioArtifact) -> Result<()> {
        let destroyed = *self.state.borrow() == ConnectionState::Destroyed;
        if destroyed {
            return Err(VcReadError::TransportError("connection destroyed".into()));
        }
        let bytes = audio.read().await?;
        let source = match &audio {
            AudioArtifact::File(path) => path.display().to_string(),
            AudioArtifact::Inline(_) => "inline".to_string(),
        };
        info!(target = "console", bytes = bytes.len(), source = %source, "▶️  Playing");

        let duration = Duration::from_millis(self.ms_per_kb * (bytes.len() as u64 / 1024).max(1));
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = events.send(TransportEvent::PlaybackFinished).await;
        });
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.state.send_replace(ConnectionState::Destroyed);
        Ok(())
    }
}

/// Joins instantly; the latest connection's event sender is kept so stdin
/// commands can simulate speakers.
pub struct ConsoleTransport {
    ms_per_kb: u64,
    current: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl ConsoleTransport {
    pub fn new(ms_per_kb: u64) -> Arc<Self> {
        Arc::new(Self {
            ms_per_kb,
            current: Mutex::new(None),
        })
    }

    pub async fn emit(&self, event: TransportEvent) {
        let sender = match self.current.lock() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match sender {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    warn!(target = "console", "Connection is gone");
                }
            }
            None => warn!(target = "console", "Not connected"),
        }
    }
}

#[async_trait]
impl VoiceTransport for ConsoleTransport {
    async fn join(
        &self,
        guild: &GuildId,
        channel: &ChannelId,
        self_mute: bool,
    ) -> Result<JoinedConnection> {
        info!(target = "console", guild = %guild, channel = %channel, self_mute, "Joining voice channel");
        let (state, _) = watch::channel(ConnectionState::Ready);
        let (events_tx, events_rx) = mpsc::channel(64);
        match self.current.lock() {
            Ok(mut current) => *current = Some(events_tx.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(events_tx.clone()),
        }
        Ok(JoinedConnection {
            connection: Arc::new(ConsoleConnection {
                state,
                events: events_tx,
                ms_per_kb: self.ms_per_kb,
            }),
            events: events_rx,
        })
    }
}

#[derive(Default)]
pub struct ConsoleNotices {
    next_id: AtomicU64,
}

#[async_trait]
impl NoticeSink for ConsoleNotices {
    async fn send(&self, channel: &ChannelId, notice: &Notice) -> Result<MessageId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        println!("[#{channel}] {notice}");
        for control in notice.controls() {
            println!("    [{}] → /{}", control.custom_id(), control_command(*control));
        }
        Ok(format!("notice-{id}"))
    }

    async fn delete(&self, channel: &ChannelId, message: &MessageId) -> Result<()> {
        debug!(target = "console", channel = %channel, message = %message, "Notice removed");
        Ok(())
    }
}

fn control_command(control: NoticeControl) -> &'static str {
    match control {
        NoticeControl::Skip => "skip",
        NoticeControl::ForcePlay => "force",
    }
}
