//! Status notices posted to a session's bound text channel.
//!
//! Notices are fire-and-forget: the session logs and swallows delivery
//! failures.

use crate::{ChannelId, MessageId, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Interactive control attached to a notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeControl {
    /// Drop the item that is waiting
    Skip,
    /// Play the waiting item now
    ForcePlay,
}

impl NoticeControl {
    /// Stable id the front-end routes button presses by
    pub fn custom_id(&self) -> &'static str {
        match self {
            NoticeControl::Skip => "activespeech_skip",
            NoticeControl::ForcePlay => "activespeech_force",
        }
    }

    pub fn from_custom_id(id: &str) -> Option<Self> {
        match id {
            "activespeech_skip" => Some(NoticeControl::Skip),
            "activespeech_force" => Some(NoticeControl::ForcePlay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    /// The bound voice channel emptied and the session left
    AutoDisconnected,
    /// The guild crossed its primary-engine budget this period
    PrimaryThresholdReached { threshold: f64 },
    /// Playback has been deferred by ActiveSpeech for a while
    ActiveSpeechWaiting { waited_secs: u64 },
    /// The first message after an auto-join picked this channel
    TextChannelBound,
    /// Joined a voice channel on its own and bound this text channel
    AutoJoined { voice_channel: ChannelId },
}

impl Notice {
    pub fn controls(&self) -> &'static [NoticeControl] {
        match self {
            Notice::ActiveSpeechWaiting { .. } => &[NoticeControl::Skip, NoticeControl::ForcePlay],
            _ => &[],
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::AutoDisconnected => {
                write!(f, "👋 Everyone left the voice channel, so I disconnected.")
            }
            Notice::PrimaryThresholdReached { threshold } => write!(
                f,
                "**⚠️ Notice**\nThis server reached the primary voice budget ({threshold:.0} characters).\nReading continues with the fallback voice."
            ),
            Notice::ActiveSpeechWaiting { waited_secs } => write!(
                f,
                "⏳ **ActiveSpeech waiting**\nSomeone is still talking, so reading has been on hold for {waited_secs}s."
            ),
            Notice::TextChannelBound => write!(
                f,
                "✅ **Reading started**\nThis channel had the first message after joining, so it is now read aloud.\n💡 Run `/join` in another channel to move."
            ),
            Notice::AutoJoined { voice_channel } => write!(
                f,
                "✅ **Joined automatically**\n🔊 Joined <#{voice_channel}> and reading this channel."
            ),
        }
    }
}

/// The bound-text-target abstraction
#[async_trait]
pub trait NoticeSink: Send + Sync {
    /// Post a notice, returning the posted message id
    async fn send(&self, channel: &ChannelId, notice: &Notice) -> Result<MessageId>;

    /// Remove a previously posted notice
    async fn delete(&self, channel: &ChannelId, message: &MessageId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_waiting_notice_has_controls() {
        assert_eq!(
            Notice::ActiveSpeechWaiting { waited_secs: 10 }.controls(),
            &[NoticeControl::Skip, NoticeControl::ForcePlay]
        );
        assert!(Notice::AutoDisconnected.controls().is_empty());
    }

    #[test]
    fn test_control_ids_roundtrip() {
        for c in [NoticeControl::Skip, NoticeControl::ForcePlay] {
            assert_eq!(NoticeControl::from_custom_id(c.custom_id()), Some(c));
        }
        assert_eq!(NoticeControl::from_custom_id("other"), None);
    }

    #[test]
    fn test_threshold_notice_mentions_threshold() {
        let text = Notice::PrimaryThresholdReached { threshold: 1000.0 }.to_string();
        assert!(text.contains("1000"));
    }
}
