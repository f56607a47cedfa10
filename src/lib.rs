//! # Notes Sync
//!
//! Offline sync core for a notes app: a durable queue of note mutations,
//! a cache of server-confirmed notes, and a replay worker that drains the
//! queue against the hosted backend whenever connectivity returns.

pub mod config;
pub mod db;
pub mod sync;

use config::AppConfig;
use std::sync::Arc;
use sync::{
    open_local_store, RestNoteBackend, SchedulerConfig, Session, SyncManager, SyncNotice,
    SyncOptions,
};

// ============================================================================
// Application Entry Point
// ============================================================================

pub fn run() {
    // Load .env file for backend settings
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        log::error!("Sync service failed: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}

async fn serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("Offline store path: {:?}", config.db_path);
    let store = open_local_store(config.db_path.clone());

    let backend = Arc::new(RestNoteBackend::new(
        &config.backend_url,
        config.api_key.clone(),
        config.request_timeout,
    )?);
    match &config.session {
        Some(session) => {
            backend
                .set_session(Session::new(session.user_id.clone(), session.access_token.clone()))
                .await;
        }
        None => log::warn!("No session configured; mutations will queue until sign-in"),
    }

    let manager = SyncManager::new(
        store.clone(),
        backend,
        SyncOptions {
            retry: config.retry,
            scheduler: SchedulerConfig {
                enabled: true,
                interval_minutes: config.replay_interval_minutes,
                last_run: None,
            },
            probe_interval: Some(config.probe_interval),
            ..SyncOptions::default()
        },
    );

    let mut notices = manager.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            log_notice(&notice);
        }
    });

    manager.watch_storage(&store);
    manager.start().await;

    let stats = manager.queue_stats()?;
    log::info!("{} pending mutations from earlier sessions", stats.pending_count);

    manager.replay_on_startup().await;
    match manager.refresh_cache().await {
        Ok(notes) => log::info!("{} notes available offline", notes.len()),
        Err(e) => log::warn!("Note cache not refreshed: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    manager.shutdown().await;
    Ok(())
}

fn log_notice(notice: &SyncNotice) {
    match notice {
        SyncNotice::Unauthorized => log::warn!("Sign in again to resume syncing notes"),
        SyncNotice::Rejected { note_id, reason, .. } => {
            log::warn!("A change to note {} was rejected and discarded: {}", note_id, reason)
        }
        SyncNotice::PersistentFailure { note_id, attempts, last_error, .. } => log::warn!(
            "A change to note {} has failed {} times and is still queued: {}",
            note_id,
            attempts,
            last_error
        ),
        SyncNotice::NoteIdAssigned { temp_id, note_id } => {
            log::info!("Note {} is now stored on the server as {}", temp_id, note_id)
        }
        SyncNotice::StorageDegraded { reason } => {
            log::warn!("Offline storage unavailable, changes kept in memory only: {}", reason)
        }
    }
}
