//! Background sync scheduler.
//!
//! One tokio task owns the sync lifecycle: it runs a cycle at startup, on a
//! timer, and on explicit triggers, never more than one cycle at a time.
//! Triggers that arrive mid-run are coalesced into a single follow-up cycle.
//! Failures move the state machine to `Failed` and retry with exponential
//! backoff; queries keep serving whatever the cache already holds.
//!
//! Status is published on a watch channel so callers can snapshot it or wait
//! for the first successful cycle without polling.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::DocumentSource;
use crate::config::SyncConfig;
use crate::error::{ReadyError, SyncError};
use crate::models::{SyncState, SyncStatus};
use crate::parser::{document_revision, BulkParser, ParseSummary};
use crate::store::{MetadataStore, StoreCounts};

enum Command {
    Trigger,
}

/// Handle to the scheduler task.
pub struct SyncScheduler {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SyncStatus>,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Starts the background task. The first cycle begins immediately.
    pub fn spawn(
        source: Arc<dyn DocumentSource>,
        store: Arc<MetadataStore>,
        batch_size: usize,
        config: SyncConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn(run_loop(
            source,
            store,
            batch_size,
            config,
            cmd_rx,
            status_tx,
            shutdown.clone(),
        ));

        Self {
            cmd_tx,
            status_rx,
            shutdown,
            handle,
        }
    }

    /// Requests a sync cycle. If one is already running, at most one
    /// follow-up cycle happens no matter how many triggers queue up.
    pub async fn trigger(&self) {
        let _ = self.cmd_tx.send(Command::Trigger).await;
    }

    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Blocks until the cache has completed at least one successful cycle.
    /// A zero timeout checks and returns immediately.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), ReadyError> {
        let mut rx = self.status_rx.clone();
        if rx.borrow().is_ready() {
            return Ok(());
        }
        if timeout.is_zero() {
            return Err(ReadyError::Timeout(timeout));
        }

        let wait = async {
            loop {
                rx.changed().await.map_err(|_| ReadyError::Closed)?;
                if rx.borrow().is_ready() {
                    return Ok(());
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ReadyError::Timeout(timeout)),
        }
    }

    /// Stops the task. A cycle in progress finishes its current batch; only
    /// fully committed batches remain visible.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        drop(self.cmd_tx);
        let _ = self.handle.await;
    }
}

/// Runs one full sync cycle: fetch, parse, store, log. Used by the scheduler
/// and by the foreground CLI sync command.
pub async fn run_once(
    source: &dyn DocumentSource,
    store: &MetadataStore,
    batch_size: usize,
) -> Result<ParseSummary, SyncError> {
    let log_id = store.begin_sync_log().await?;

    let result = async {
        let document = source.fetch_document().await?;
        let revision = document_revision(document.as_bytes());
        BulkParser::new(batch_size)
            .parse(document.as_bytes(), &revision, store)
            .await
    }
    .await;

    match result {
        Ok(summary) => {
            let counts = store.counts().await?;
            store.finish_sync_log(&log_id, true, counts, None).await?;
            Ok(summary)
        }
        Err(e) => {
            let _ = store
                .finish_sync_log(&log_id, false, StoreCounts::default(), Some(&e.to_string()))
                .await;
            Err(e)
        }
    }
}

async fn run_loop(
    source: Arc<dyn DocumentSource>,
    store: Arc<MetadataStore>,
    batch_size: usize,
    config: SyncConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<SyncStatus>,
    shutdown: Arc<Notify>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        u64::from(config.interval_hours) * 3600,
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut status = SyncStatus::default();
    let mut retry_delay: Option<Duration> = None;

    loop {
        // The first interval tick fires immediately, which is the cold-start
        // sync. After a failure the retry sleep replaces the timer.
        if let Some(delay) = retry_delay.take() {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = tokio::time::sleep(delay) => {}
                cmd = cmd_rx.recv() => {
                    if cmd.is_none() {
                        break;
                    }
                }
            }
        } else {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = interval.tick() => {}
                cmd = cmd_rx.recv() => {
                    if cmd.is_none() {
                        break;
                    }
                }
            }
        }

        loop {
            run_cycle(&*source, &store, batch_size, &status_tx, &mut status).await;

            // Coalesce triggers that queued up while the cycle ran: any
            // number of them collapses into one follow-up cycle.
            let mut rerun = false;
            while let Ok(Command::Trigger) = cmd_rx.try_recv() {
                rerun = true;
            }
            if !rerun {
                break;
            }
            info!("coalesced queued sync triggers into one follow-up cycle");
        }

        if status.state == SyncState::Failed {
            retry_delay = Some(backoff_delay(&config, status.consecutive_failures));
        }
    }
}

async fn run_cycle(
    source: &dyn DocumentSource,
    store: &MetadataStore,
    batch_size: usize,
    status_tx: &watch::Sender<SyncStatus>,
    status: &mut SyncStatus,
) {
    status.state = SyncState::Syncing;
    status_tx.send_replace(status.clone());

    match run_once(source, store, batch_size).await {
        Ok(summary) => {
            info!(
                entities = summary.entities,
                enums = summary.enums,
                warnings = summary.warnings.len(),
                "sync cycle completed"
            );
            status.state = SyncState::Idle;
            status.last_success = Some(chrono::Utc::now());
            status.last_error = None;
            status.consecutive_failures = 0;
            status.completed_runs += 1;
        }
        Err(e) => {
            error!(error = %e, "sync cycle failed");
            status.state = SyncState::Failed;
            status.last_error = Some(e.to_string());
            status.consecutive_failures += 1;
        }
    }
    status_tx.send_replace(status.clone());
}

/// Exponential backoff from the failure count, capped, upper half jittered.
fn backoff_delay(config: &SyncConfig, consecutive_failures: u32) -> Duration {
    let base = Duration::from_secs(config.retry_base_secs);
    let cap = Duration::from_secs(config.retry_cap_secs);
    let exp = base.saturating_mul(2u32.saturating_pow(consecutive_failures.saturating_sub(1)));
    let capped = exp.min(cap);
    let half = capped / 2;
    let jitter_ms = rand::rng().random_range(0..=half.as_millis() as u64);
    let delay = half + Duration::from_millis(jitter_ms);
    warn!(failures = consecutive_failures, ?delay, "scheduling sync retry");
    delay
}
