use anyhow::Result;
use chat_cache::cli::{Cli, Commands};
use chat_cache::source::{ChannelEventSource, EventSource, ReplayEventSource};
use chat_cache::{utils, SessionCache, SessionId, Settings};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = Settings::new()?;
    if let Some(backend) = cli.backend {
        settings.persistence.backend = backend.into();
    }
    if let Some(path) = cli.path {
        settings.persistence.path = path;
    }
    settings.validate()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { session } => handle_inspect(settings, session).await,
        Commands::Replay { events, session } => handle_replay(settings, events, session).await,
        Commands::Sweep => handle_sweep(settings).await,
        Commands::Clear { session } => handle_clear(settings, session).await,
    }
}

/// Open the cache without a live connection; maintenance commands never subscribe
async fn open_offline(settings: Settings) -> Result<SessionCache> {
    let source: Arc<dyn EventSource> = Arc::new(ChannelEventSource::new());
    Ok(SessionCache::builder(settings, source).open().await?)
}

async fn handle_inspect(settings: Settings, session: Option<String>) -> Result<()> {
    let cache = open_offline(settings).await?;
    let report = cache.load_report().clone();

    match session {
        None => {
            utils::print_header("Cached Sessions");
            let sessions = cache.list_sessions().await?;
            if sessions.is_empty() {
                utils::print_info("Cache is empty");
            }
            for meta in &sessions {
                utils::print_session(meta);
            }

            let stats = cache.stats().await?;
            println!();
            utils::print_info(&format!(
                "{} sessions ({} full), {} messages, {} bytes",
                stats.sessions, stats.full_sessions, stats.messages, stats.total_bytes
            ));
            if report.corrupt_keys > 0 || report.orphaned_keys > 0 {
                utils::print_warning(&format!(
                    "Dropped {} corrupt and {} orphaned entries while loading",
                    report.corrupt_keys, report.orphaned_keys
                ));
            }
        }
        Some(id) => {
            let snapshot = cache.get_snapshot(id.as_str()).await;
            match snapshot.session {
                Some(meta) => {
                    utils::print_header(&format!("Session {}", id));
                    utils::print_session(&meta);
                    println!();
                    for message in &snapshot.messages {
                        utils::print_message(message);
                    }
                }
                None => utils::print_error(&format!("Session '{}' is not cached", id)),
            }
        }
    }

    cache.shutdown().await?;
    Ok(())
}

async fn handle_replay(settings: Settings, events: String, session: String) -> Result<()> {
    let source: Arc<dyn EventSource> = Arc::new(ReplayEventSource::new(&events));
    let cache = SessionCache::builder(settings, source).open().await?;
    let session_id = SessionId::from(session);

    utils::print_info(&format!("Replaying {} into '{}'...", events, session_id));
    cache.prefetch(session_id.clone()).await?;
    let state = cache
        .wait_for_stream_state(&session_id, |state| state.is_terminal())
        .await;

    let snapshot = cache.get_snapshot(session_id.clone()).await;
    match state {
        Some(state) if state.is_terminal() && !snapshot.is_stale => utils::print_success(&format!(
            "Replay finished ({}): {} messages cached",
            state,
            snapshot.messages.len()
        )),
        Some(state) => utils::print_warning(&format!(
            "Replay ended in state {}: {} messages cached, view is stale",
            state,
            snapshot.messages.len()
        )),
        None => utils::print_error("Replay did not start"),
    }

    cache.shutdown().await?;
    Ok(())
}

async fn handle_sweep(settings: Settings) -> Result<()> {
    let cache = open_offline(settings).await?;
    let expired = cache.load_report().expired_sessions;
    let removed = cache.sweep().await?;
    cache.flush().await?;

    utils::print_success(&format!(
        "Removed {} expired sessions ({} already dropped while loading)",
        removed.len(),
        expired
    ));
    for session_id in &removed {
        println!("  {}", session_id);
    }

    cache.shutdown().await?;
    Ok(())
}

async fn handle_clear(settings: Settings, session: Option<String>) -> Result<()> {
    let cache = open_offline(settings).await?;

    match session {
        Some(id) => {
            if cache.remove_session(id.as_str()).await? {
                utils::print_success(&format!("Removed session '{}'", id));
            } else {
                utils::print_error(&format!("Session '{}' is not cached", id));
            }
        }
        None => {
            let removed = cache.evict_all().await?;
            utils::print_success(&format!("Removed {} sessions", removed));
        }
    }

    cache.shutdown().await?;
    Ok(())
}
