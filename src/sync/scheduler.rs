//! Background Replay Scheduler
//!
//! Periodic replay at a configurable interval, standing in for the
//! platform's background-sync wakeups when the app stays open.
//! Uses Tokio tasks for non-blocking background execution.

use super::replay::{ReplayOutcome, ReplayTrigger, ReplayWorker};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

/// Periodic replay trigger
#[derive(Clone)]
pub struct BackgroundScheduler {
    worker: ReplayWorker,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be 1-1440 minutes, got {}",
            interval_minutes
        )));
    }
    Ok(())
}

impl BackgroundScheduler {
    pub fn new(worker: ReplayWorker, config: SchedulerConfig) -> Self {
        Self {
            worker,
            config: Arc::new(RwLock::new(config)),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Start background scheduler task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let period = Duration::from_secs(60 * interval_minutes);
        let handle = tokio::spawn(Self::scheduler_loop(
            self.running.clone(),
            self.config.clone(),
            self.worker.clone(),
            period,
        ));

        let mut task = self.task_handle.lock().unwrap_or_else(|e| e.into_inner());
        *task = Some(handle);

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        let handle = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart the scheduler if needed
    pub async fn update_config(&self, enabled: bool, interval_minutes: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }

        if self.is_running() {
            // Ignore error if it stopped in between
            let _ = self.stop().await;
        }

        if enabled {
            self.start().await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} minutes",
            enabled,
            interval_minutes
        );
        Ok(())
    }

    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        config: Arc<RwLock<SchedulerConfig>>,
        worker: ReplayWorker,
        period: Duration,
    ) {
        // First tick one period from now; startup replay is triggered separately
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::info!("Scheduler loop started (period: {:?})", period);

        loop {
            interval.tick().await;

            if !running.load(Ordering::SeqCst) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            log::debug!("Periodic replay triggered by scheduler");

            match worker.trigger(ReplayTrigger::Periodic).await {
                ReplayOutcome::Completed(report) => {
                    if report.failed > 0 {
                        log::warn!("Periodic replay left {} mutations failing", report.failed);
                    }
                    config.write().await.last_run = Some(Utc::now().to_rfc3339());
                }
                ReplayOutcome::Coalesced => {
                    log::debug!("Periodic replay folded into running replay");
                }
                ReplayOutcome::Paused => {
                    log::debug!("Periodic replay skipped while paused");
                }
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
