mod common;

use common::*;
use std::time::Duration;
use vcread_core::{
    EnqueueOutcome, GuildSettings, InboundMessage, Notice, NoticeControl, SettingsStore,
    VoiceSettings, VoiceStateChange,
};

fn message(author: &str, channel: &str, in_voice: Option<&str>, content: &str) -> InboundMessage {
    InboundMessage {
        guild_id: id(GUILD),
        text_channel: id(channel),
        author_id: id(author),
        author_is_bot: false,
        author_voice_channel: in_voice.map(id),
        content: content.to_string(),
        has_image: false,
    }
}

fn moved(user: &str, old: Option<&str>, new: Option<&str>, humans_left_in_old: usize) -> VoiceStateChange {
    VoiceStateChange {
        guild_id: id(GUILD),
        user_id: id(user),
        display_name: user.to_uppercase(),
        is_bot: false,
        old_channel: old.map(id),
        new_channel: new.map(id),
        humans_left_in_old,
    }
}

async fn set_guild(h: &Harness, edit: impl FnOnce(&mut GuildSettings)) {
    let mut guild = h.settings.guild_settings(&id(GUILD)).await.unwrap();
    edit(&mut guild);
    h.settings.set_guild_settings(&id(GUILD), guild).await.unwrap();
}

#[tokio::test]
async fn test_message_read_only_from_bound_channel() {
    let h = Harness::new(limits(0.0, 0.0));
    let registry = h.registry();
    assert!(registry.join(&id(GUILD), id(VOICE), Some(id(TEXT))).await);

    let outcome = registry
        .handle_message(&message("u1", TEXT, None, "hello https://x.y/z"))
        .await;
    assert_eq!(outcome, Some(EnqueueOutcome::Queued));
    assert_eq!(registry.handle_message(&message("u1", "other", None, "nope")).await, None);

    let mut bot = message("bot", TEXT, None, "beep");
    bot.author_is_bot = true;
    assert_eq!(registry.handle_message(&bot).await, None);

    assert!(eventually(|| async { h.transport.played().len() == 1 }).await);
    assert_eq!(h.transport.played(), vec!["primary:hello URL"]);
}

#[tokio::test]
async fn test_first_message_from_voice_member_binds_text_channel() {
    let h = Harness::new(limits(0.0, 0.0));
    let registry = h.registry();
    assert!(registry.join(&id(GUILD), id(VOICE), None).await);

    // author not in the bot's voice channel
    assert_eq!(registry.handle_message(&message("u1", "t9", Some("vc2"), "hi")).await, None);

    let outcome = registry
        .handle_message(&message("u1", TEXT, Some(VOICE), "hi"))
        .await;
    assert_eq!(outcome, Some(EnqueueOutcome::Queued));
    assert_eq!(h.notices.sent(), vec![(id(TEXT), Notice::TextChannelBound)]);

    let session = registry.session(&id(GUILD)).unwrap();
    assert_eq!(session.text_target().await, Some(id(TEXT)));
    assert_eq!(registry.handle_message(&message("u2", "t9", Some(VOICE), "hi")).await, None);
}

#[tokio::test]
async fn test_dictionary_applied_before_reading() {
    let h = Harness::new(limits(0.0, 0.0));
    set_guild(&h, |g| {
        g.dictionary.insert("gg".into(), "good game".into());
    })
    .await;
    let registry = h.registry();
    assert!(registry.join(&id(GUILD), id(VOICE), Some(id(TEXT))).await);

    registry.handle_message(&message("u1", TEXT, None, "gg all")).await;
    assert!(eventually(|| async { h.transport.played().len() == 1 }).await);
    assert_eq!(h.transport.played(), vec!["primary:good game all"]);
}

#[tokio::test]
async fn test_empty_channel_disconnects_with_notice_and_forgets_session() {
    let h = Harness::new(limits(0.0, 0.0));
    let registry = h.registry();
    assert!(registry.join(&id(GUILD), id(VOICE), Some(id(TEXT))).await);
    assert_eq!(registry.len(), 1);

    registry
        .handle_voice_state(&moved("u1", Some(VOICE), None, 0))
        .await;

    assert!(eventually(|| async { registry.is_empty() }).await);
    assert!(eventually(|| async { h.notices.sent() == vec![(id(TEXT), Notice::AutoDisconnected)] }).await);
}

#[tokio::test]
async fn test_leave_on_request_posts_nothing() {
    let h = Harness::new(limits(0.0, 0.0));
    let registry = h.registry();
    assert!(registry.join(&id(GUILD), id(VOICE), Some(id(TEXT))).await);

    assert!(registry.leave(&id(GUILD)).await);
    assert!(eventually(|| async { registry.is_empty() }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.notices.sent().is_empty());
    assert!(!registry.leave(&id(GUILD)).await);
}

#[tokio::test]
async fn test_join_and_leave_announcements() {
    let h = Harness::new(limits(0.0, 0.0));
    set_guild(&h, |g| {
        g.read_join = true;
        g.read_leave = true;
    })
    .await;
    let registry = h.registry();
    assert!(registry.join(&id(GUILD), id(VOICE), Some(id(TEXT))).await);

    registry
        .handle_voice_state(&moved("alice", None, Some(VOICE), 0))
        .await;
    registry
        .handle_voice_state(&moved("alice", Some(VOICE), Some("vc2"), 2))
        .await;

    assert!(eventually(|| async { h.transport.played().len() == 2 }).await);
    assert_eq!(
        h.transport.played(),
        vec!["primary:ALICE joined", "primary:ALICE left"]
    );
}

#[tokio::test]
async fn test_auto_join_uses_channel_pair() {
    let h = Harness::new(limits(0.0, 0.0));
    set_guild(&h, |g| {
        g.auto_join = true;
        g.channel_pairs.insert(id(VOICE), id(TEXT));
        g.ignore_channels.insert(id("afk"));
    })
    .await;
    let registry = h.registry();

    registry
        .handle_voice_state(&moved("u1", None, Some("afk"), 0))
        .await;
    assert_eq!(h.transport.join_count(), 0);

    registry
        .handle_voice_state(&moved("u1", None, Some(VOICE), 0))
        .await;
    assert_eq!(h.transport.join_count(), 1);
    let session = registry.session(&id(GUILD)).unwrap();
    assert_eq!(session.text_target().await, Some(id(TEXT)));
    assert_eq!(
        h.notices.sent(),
        vec![(
            id(TEXT),
            Notice::AutoJoined {
                voice_channel: id(VOICE)
            }
        )]
    );

    // already connected: another member arriving does not rejoin
    registry
        .handle_voice_state(&moved("u2", None, Some(VOICE), 0))
        .await;
    assert_eq!(h.transport.join_count(), 1);
}

#[tokio::test]
async fn test_follow_join_user_pulls_bot_in() {
    let h = Harness::new(limits(0.0, 0.0));
    let mut voice = VoiceSettings::with_speaker(1);
    voice.follow_join = true;
    h.settings
        .set_voice_settings(&id(GUILD), &id("owner"), voice)
        .await
        .unwrap();
    let registry = h.registry();

    registry
        .handle_voice_state(&moved("stranger", None, Some(VOICE), 0))
        .await;
    assert_eq!(h.transport.join_count(), 0);

    registry
        .handle_voice_state(&moved("owner", None, Some(VOICE), 0))
        .await;
    assert_eq!(h.transport.join_count(), 1);
    // no channel pair, so nothing to announce yet
    assert!(h.notices.sent().is_empty());
}

#[tokio::test]
async fn test_controls_route_to_session() {
    let h = Harness::new(limits(0.0, 0.0));
    let registry = h.registry();
    assert!(!registry.handle_control(&id(GUILD), NoticeControl::Skip).await);

    assert!(registry.join(&id(GUILD), id(VOICE), Some(id(TEXT))).await);
    assert!(registry.handle_control(&id(GUILD), NoticeControl::ForcePlay).await);
}
