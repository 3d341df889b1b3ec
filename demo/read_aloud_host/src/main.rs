mod config;
mod console;

use config::HostConfig;
use console::{ConsoleNotices, ConsoleTransport};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use vcread_core::ledger::current_period_key;
use vcread_core::{
    AudioCache, EngineRouter, InMemoryLedger, InMemorySettings, InboundMessage, NoticeControl,
    NoticeSink, SessionDeps, SessionRegistry, SettingsStore, Stats, Storage, Synthesizer,
    TextPipeline, TransportEvent, UsageLedger, VoiceTransport,
};

const HELP: &str = "Type a message to read it aloud. Commands: /join, /leave, /skip, /force, \
/talk <user>, /quiet <user>, /stats, /help";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,vcread_core=info,read_aloud_host=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(target = "read_aloud_host", "Starting read-aloud host: stdin → session → TTS → console");

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = HostConfig::load();
    let console_cfg = cfg.console.clone();

    // 1) Audio cache: rebuild index from disk, sweep once, then periodically
    let cache = Arc::new(AudioCache::open(&cfg.core.cache)?);
    {
        let cache = Arc::clone(&cache);
        let report = tokio::task::spawn_blocking(move || cache.sweep()).await?;
        info!(
            target = "read_aloud_host",
            total_bytes = report.total_bytes,
            evicted = report.evicted,
            "Startup cache sweep done"
        );
    }
    let sweeper = Arc::clone(&cache).spawn_sweeper(cfg.core.cache.sweep_interval);

    // 2) Synthesis backends + metrics
    let stats = Arc::new(Stats::new());
    let synthesizer = Arc::new(Synthesizer::from_config(
        &cfg.core.backends,
        Arc::clone(&cache),
        Arc::clone(&stats),
    )?);

    // 3) Settings and usage ledger (RocksDB when configured)
    let (settings, ledger): (Arc<dyn SettingsStore>, Arc<dyn UsageLedger>) = match &cfg.storage_path {
        Some(path) => {
            let storage = Storage::open_shared(path)?;
            info!(target = "read_aloud_host", path = %path.display(), "Using persistent storage");
            (
                Arc::clone(&storage) as Arc<dyn SettingsStore>,
                storage as Arc<dyn UsageLedger>,
            )
        }
        None => {
            warn!(target = "read_aloud_host", "STORAGE_PATH unset; settings and usage are kept in memory");
            (
                InMemorySettings::new() as Arc<dyn SettingsStore>,
                InMemoryLedger::new() as Arc<dyn UsageLedger>,
            )
        }
    };

    // 4) Sessions
    let transport = ConsoleTransport::new(console_cfg.playback_ms_per_kb);
    let notices: Arc<dyn NoticeSink> = Arc::new(ConsoleNotices::default());
    let deps = SessionDeps {
        transport: Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        settings,
        ledger: Arc::clone(&ledger),
        synthesizer,
        notices,
        router: EngineRouter::new(cfg.core.limits),
        timings: cfg.core.timings,
        default_speaker_id: cfg.core.default_speaker_id,
    };
    let registry = SessionRegistry::new(deps, TextPipeline::new(cfg.core.text.clone())?);

    // 5) Billing period rollover
    let rollover_task = {
        let ledger = Arc::clone(&ledger);
        let every = cfg.rollover_check;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = ledger.roll_over(&current_period_key()).await {
                    error!(target = "read_aloud_host", error = %e, "Usage rollover failed");
                }
            }
        })
    };

    // 6) Periodic usage report
    let stats_task = {
        let stats = Arc::clone(&stats);
        let every = cfg.stats_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Stats::log_snapshot(&stats.snapshot_and_reset());
            }
        })
    };

    let guild = console_cfg.guild_id.clone();
    if !registry
        .join(&guild, console_cfg.voice_channel.clone(), Some(console_cfg.text_channel.clone()))
        .await
    {
        error!(target = "read_aloud_host", "Initial join failed");
    }
    println!("{HELP}");

    // 7) stdin → messages and commands
    let input_task = {
        let registry = Arc::clone(&registry);
        let transport = Arc::clone(&transport);
        let stats = Arc::clone(&stats);
        let console_cfg = console_cfg.clone();
        let guild = guild.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(target = "read_aloud_host", error = %e, "stdin read failed");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let mut parts = line.splitn(2, ' ');
                let command = parts.next().unwrap_or_default();
                let arg = parts.next().map(str::trim).unwrap_or_default();
                match command {
                    "/join" => {
                        let joined = registry
                            .join(&guild, console_cfg.voice_channel.clone(), Some(console_cfg.text_channel.clone()))
                            .await;
                        info!(target = "read_aloud_host", joined, "Join requested");
                    }
                    "/leave" => {
                        registry.leave(&guild).await;
                    }
                    "/skip" => {
                        registry.handle_control(&guild, NoticeControl::Skip).await;
                    }
                    "/force" => {
                        registry.handle_control(&guild, NoticeControl::ForcePlay).await;
                    }
                    "/talk" if !arg.is_empty() => {
                        transport.emit(TransportEvent::SpeakingStarted(arg.to_string())).await;
                    }
                    "/quiet" if !arg.is_empty() => {
                        transport.emit(TransportEvent::SpeakingStopped(arg.to_string())).await;
                    }
                    "/stats" => Stats::log_snapshot(&stats.snapshot()),
                    "/help" => println!("{HELP}"),
                    _ => {
                        let msg = InboundMessage {
                            guild_id: guild.clone(),
                            text_channel: console_cfg.text_channel.clone(),
                            author_id: console_cfg.user_id.clone(),
                            author_is_bot: false,
                            author_voice_channel: Some(console_cfg.voice_channel.clone()),
                            content: line.to_string(),
                            has_image: false,
                        };
                        match registry.handle_message(&msg).await {
                            Some(outcome) => info!(target = "read_aloud_host", ?outcome, "Message handled"),
                            None => info!(target = "read_aloud_host", "Message not read (no active session)"),
                        }
                    }
                }
            }
        })
    };

    // Ctrl+C handler to shutdown gracefully
    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                error!(target = "read_aloud_host", error = %e, "Failed to listen for Ctrl+C");
            }
            info!(target = "read_aloud_host", "Shutting down...");
        }
        _ = input_task => {
            info!(target = "read_aloud_host", "stdin closed; shutting down...");
        }
    }

    registry.leave(&guild).await;
    Stats::log_snapshot(&stats.snapshot_and_reset());

    sweeper.abort();
    rollover_task.abort();
    stats_task.abort();
    Ok(())
}
