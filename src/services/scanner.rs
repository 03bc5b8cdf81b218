use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::{ConverterConfig, ScanMode};
use crate::models::ConversionTask;
use crate::services::queue::TaskQueue;
use crate::services::storage::StorageService;
use crate::utils::keys;
use crate::utils::run_guard::{RunGuard, RunState};

/// Why a scan did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another scan holds the token
    AlreadyRunning,
    /// The queue still has pending messages, or a delivered task is still
    /// being processed
    QueueBusy,
}

/// Result of one scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanReport {
    Skipped(SkipReason),
    Completed { enqueued: usize },
    /// Listing or publishing failed part-way. Tasks emitted before the
    /// failure stay emitted; the remainder waits for the next scan.
    Aborted { enqueued: usize, error: String },
}

impl ScanReport {
    pub fn enqueued(&self) -> usize {
        match self {
            ScanReport::Skipped(_) => 0,
            ScanReport::Completed { enqueued } | ScanReport::Aborted { enqueued, .. } => *enqueued,
        }
    }
}

/// Walks the bucket and publishes one task per object that still needs work.
///
/// The store is the only record of what is left to convert: converted objects
/// no longer carry the trigger extension, so they are not picked up again.
pub struct BucketScanner {
    storage: Arc<dyn StorageService>,
    queue: Arc<dyn TaskQueue>,
    config: ConverterConfig,
    guard: RunGuard,
    in_flight: Option<RunGuard>,
}

impl BucketScanner {
    pub fn new(
        storage: Arc<dyn StorageService>,
        queue: Arc<dyn TaskQueue>,
        config: ConverterConfig,
    ) -> Self {
        Self {
            storage,
            queue,
            config,
            guard: RunGuard::new(),
            in_flight: None,
        }
    }

    /// Treats the queue as busy while `in_flight` is running. The broker
    /// only reports ready messages, so the task taken off the queue but not
    /// yet acknowledged is invisible to `is_empty`.
    pub fn with_in_flight(mut self, in_flight: RunGuard) -> Self {
        self.in_flight = Some(in_flight);
        self
    }

    pub fn state(&self) -> RunState {
        self.guard.state()
    }

    /// Whether a listed key becomes a task.
    pub fn wants(&self, key: &str) -> bool {
        if key.ends_with('/') {
            return false;
        }
        if let Some(quarantine) = &self.config.quarantine_prefix {
            if key.starts_with(quarantine.as_str()) {
                return false;
            }
        }

        match self.config.scan_mode {
            ScanMode::Convertible => keys::has_extension(key, &self.config.convert_extension),
            ScanMode::All => {
                // validate() guarantees the output prefix does not cover the source
                !key.starts_with(self.config.output_prefix.as_str())
            }
        }
    }

    pub async fn scan(&self) -> ScanReport {
        let Some(_ticket) = self.guard.try_start() else {
            info!("🔎 Scan already running, skipping");
            return ScanReport::Skipped(SkipReason::AlreadyRunning);
        };

        let task_running = self
            .in_flight
            .as_ref()
            .is_some_and(|guard| guard.state() == RunState::Running);
        if task_running || !self.queue.is_empty().await {
            info!("🔎 Queue has outstanding work, skipping scan");
            return ScanReport::Skipped(SkipReason::QueueBusy);
        }

        info!("🔎 Scanning '{}'", self.config.source_prefix);
        let mut enqueued = 0;
        let mut continuation = None;

        loop {
            let page = match self
                .storage
                .list_page(&self.config.source_prefix, continuation.take())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!("❌ Listing failed after {} tasks: {:#}", enqueued, e);
                    return ScanReport::Aborted {
                        enqueued,
                        error: format!("{e:#}"),
                    };
                }
            };

            for key in page.keys.into_iter().filter(|k| self.wants(k)) {
                let task = ConversionTask::new(key);
                if let Err(e) = self.queue.enqueue(&task).await {
                    error!("❌ Failed to enqueue '{}': {:#}", task.s3key, e);
                    return ScanReport::Aborted {
                        enqueued,
                        error: format!("{e:#}"),
                    };
                }
                debug!("Enqueued '{}'", task.s3key);
                enqueued += 1;
            }

            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        info!("✅ Scan finished, {} task(s) enqueued", enqueued);
        ScanReport::Completed { enqueued }
    }
}
