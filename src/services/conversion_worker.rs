use async_recursion::async_recursion;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::{AckPolicy, ConverterConfig};
use crate::models::{ConversionTask, Stage, TaskOutcome, content_type_for};
use crate::services::converter::{ConversionError, ImageConverter};
use crate::services::queue::{TaskDelivery, TaskQueue, TaskSubscription};
use crate::services::staging::{StagingArea, StagingError};
use crate::services::storage::StorageService;
use crate::utils::keys;
use crate::utils::retry::RetryConfig;
use crate::utils::run_guard::{RunGuard, RunState};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("download failed: {0:#}")]
    Download(anyhow::Error),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("upload to '{key}' failed: {cause:#}")]
    Upload { key: String, cause: anyhow::Error },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Download(_) => Stage::Download,
            PipelineError::Staging(_) => Stage::Staging,
            PipelineError::Conversion(_) => Stage::Conversion,
            PipelineError::Upload { .. } => Stage::Upload,
        }
    }
}

/// Result of one staged-batch sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Why [`ConversionWorker::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Shutdown,
    /// The broker ended the delivery stream; the caller should resubscribe.
    SubscriptionClosed,
}

/// Queue consumer: download, convert or copy, republish, remove the original.
pub struct ConversionWorker {
    storage: Arc<dyn StorageService>,
    converter: Arc<dyn ImageConverter>,
    staging: StagingArea,
    config: ConverterConfig,
    retry: RetryConfig,
    task_guard: RunGuard,
    batch_guard: RunGuard,
    /// Exclusive access to the staging tree, shared by tasks and the sweep.
    staging_lock: Mutex<()>,
}

impl ConversionWorker {
    pub fn new(
        storage: Arc<dyn StorageService>,
        converter: Arc<dyn ImageConverter>,
        config: ConverterConfig,
    ) -> Self {
        Self {
            storage,
            converter,
            staging: StagingArea::new(&config),
            retry: RetryConfig::with_attempts(config.store_retry_attempts),
            config,
            task_guard: RunGuard::new(),
            batch_guard: RunGuard::new(),
            staging_lock: Mutex::new(()),
        }
    }

    /// Overrides the backoff used for store mutations.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn batch_state(&self) -> RunState {
        self.batch_guard.state()
    }

    /// Shares the token that is `Running` while a task is being processed.
    /// The broker no longer counts an unacked delivery as ready, so the
    /// scanner checks this too before deciding the queue is drained.
    pub fn in_flight(&self) -> RunGuard {
        self.task_guard.clone()
    }

    pub fn is_convertible(&self, key: &str) -> bool {
        keys::has_extension(key, &self.config.convert_extension)
    }

    /// Output name of `key` inside the staging `converted` tree.
    fn staged_name(&self, key: &str) -> String {
        if self.is_convertible(key) {
            keys::swap_extension(key, self.config.target_format.extension())
        } else {
            key.to_string()
        }
    }

    /// Store key the output of `key` is published under.
    pub fn destination_key(&self, key: &str) -> String {
        let renamed = self.staged_name(key);
        if self.config.output_prefix == self.config.source_prefix {
            renamed
        } else {
            keys::rebase(&renamed, &self.config.source_prefix, &self.config.output_prefix)
        }
    }

    /// Runs the whole pipeline for one object. Never fails: every error ends up
    /// as a logged `Failed` or `Partial` outcome.
    pub async fn process_task(&self, key: &str) -> TaskOutcome {
        let _ticket = self.task_guard.try_start();
        let _staging = self.staging_lock.lock().await;
        info!("⚙️  Processing '{}'", key);

        let outcome = match self.run_pipeline(key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("❌ Task '{}' failed at {}: {}", key, e.stage(), e);
                TaskOutcome::Failed {
                    stage: e.stage(),
                    reason: e.to_string(),
                }
            }
        };

        self.cleanup(key).await;

        match &outcome {
            TaskOutcome::Converted { dest_key } => info!("✅ Converted '{}' -> '{}'", key, dest_key),
            TaskOutcome::CopiedVerbatim { dest_key } => {
                info!("✅ Copied '{}' -> '{}' unchanged", key, dest_key)
            }
            TaskOutcome::Partial { dest_key, reason } => {
                warn!("⚠️  Task '{}' left partial state at '{}': {}", key, dest_key, reason)
            }
            TaskOutcome::Failed { .. } => {}
        }

        outcome
    }

    async fn run_pipeline(&self, key: &str) -> Result<TaskOutcome, PipelineError> {
        let convert = self.is_convertible(key);
        let dest_key = self.destination_key(key);
        let original_path = self.staging.original_path(key)?;
        let converted_path = self.staging.converted_path(&self.staged_name(key))?;

        // 1-2. download into staging, normalized on write
        let data = self
            .storage
            .get_file(key)
            .await
            .map_err(PipelineError::Download)?;
        let staged = self.staging.write_file(&original_path, &data).await?;
        debug!(
            "Staged '{}' ({} bytes) at {} (owner {:?}, mode {:o})",
            key,
            data.len(),
            staged.path.display(),
            staged.owner,
            staged.mode
        );

        // 3-4. convert or copy into the converted tree
        let content_type = if convert {
            let staged = self.staging.read_file(&original_path).await?;
            let output = self
                .converter
                .convert(&staged, self.config.target_format)
                .await?;
            self.staging.write_file(&converted_path, &output).await?;
            self.config.target_format.mime_type()
        } else {
            self.staging
                .copy_file(&original_path, &converted_path)
                .await?;
            content_type_for(key)
        };

        if dest_key == key && !convert {
            // Pass-through onto itself: the store already holds the final state.
            return Ok(TaskOutcome::CopiedVerbatim { dest_key });
        }

        // 5. publish under the new key
        let body = self.staging.read_file(&converted_path).await?;
        self.retry
            .retry("upload", || {
                self.storage
                    .upload_file(&dest_key, body.clone(), content_type.essence_str())
            })
            .await
            .map_err(|cause| PipelineError::Upload {
                key: dest_key.clone(),
                cause,
            })?;

        // 6. remove the original, unless the output overwrote it in place
        if dest_key != key {
            if let Err(e) = self
                .retry
                .retry("delete original", || self.storage.delete_file(key))
                .await
            {
                return Ok(TaskOutcome::Partial {
                    dest_key,
                    reason: format!(
                        "{}: uploaded, but original was not removed: {e:#}",
                        Stage::Delete
                    ),
                });
            }
        }

        // Post-condition: new key present, old key gone.
        if let Err(e) = self.verify(key, &dest_key).await {
            return Ok(TaskOutcome::Partial {
                dest_key,
                reason: format!("{}: {e:#}", Stage::Verification),
            });
        }

        Ok(if convert {
            TaskOutcome::Converted { dest_key }
        } else {
            TaskOutcome::CopiedVerbatim { dest_key }
        })
    }

    async fn verify(&self, key: &str, dest_key: &str) -> anyhow::Result<()> {
        self.retry
            .retry("verify", || async {
                if !self.storage.file_exists(dest_key).await? {
                    anyhow::bail!("'{}' is missing after upload", dest_key);
                }
                if dest_key != key && self.storage.file_exists(key).await? {
                    anyhow::bail!("'{}' still exists after delete", key);
                }
                Ok(())
            })
            .await
    }

    async fn cleanup(&self, key: &str) {
        let paths = [
            self.staging.original_path(key),
            self.staging.converted_path(&self.staged_name(key)),
        ];
        for path in paths.into_iter().flatten() {
            if let Err(e) = self.staging.remove_file(&path).await {
                warn!("Failed to remove staged file {}: {}", path.display(), e);
            }
        }
    }

    /// Moves an unconvertible original out of the scanned prefix.
    async fn quarantine(&self, key: &str) {
        let Some(prefix) = &self.config.quarantine_prefix else {
            return;
        };
        let target = keys::rebase(key, &self.config.source_prefix, prefix);

        match self.move_object(key, &target).await {
            Ok(()) => warn!("🚫 Quarantined '{}' as '{}'", key, target),
            Err(e) => error!("Failed to quarantine '{}': {:#}", key, e),
        }
    }

    async fn move_object(&self, key: &str, target: &str) -> anyhow::Result<()> {
        self.retry
            .retry("quarantine copy", || self.storage.copy_object(key, target))
            .await?;
        self.retry
            .retry("quarantine delete", || self.storage.delete_file(key))
            .await
    }

    /// Decodes, processes and settles one delivery according to the ack
    /// policy. Returns `None` for payloads that could not be decoded.
    pub async fn handle_delivery(
        &self,
        delivery: TaskDelivery,
        queue: &dyn TaskQueue,
    ) -> Option<TaskOutcome> {
        let task = match ConversionTask::decode(&delivery.payload) {
            Ok(task) => task,
            Err(e) => {
                warn!("📭 Malformed task payload, dead-lettering: {}", e);
                if let Err(dl) = queue.dead_letter(&delivery.payload, &e.to_string()).await {
                    error!("Failed to dead-letter malformed payload: {:#}", dl);
                }
                if let Err(e) = delivery.ack().await {
                    error!("Failed to ack malformed payload: {:#}", e);
                }
                return None;
            }
        };

        let outcome = self.process_task(&task.s3key).await;

        if outcome.is_success() {
            if let Err(e) = delivery.ack().await {
                error!("Failed to ack '{}': {:#}", task.s3key, e);
            }
            return Some(outcome);
        }

        let reason = match &outcome {
            TaskOutcome::Failed { stage, reason } => format!("{stage}: {reason}"),
            TaskOutcome::Partial { reason, .. } => reason.clone(),
            _ => String::new(),
        };
        let poisoned = matches!(
            outcome,
            TaskOutcome::Failed {
                stage: Stage::Conversion,
                ..
            }
        );

        match self.config.ack_policy {
            AckPolicy::Always => {
                warn!(
                    "Dropping task '{}' after failure (ack policy: always): {}",
                    task.s3key, reason
                );
                if poisoned {
                    self.quarantine(&task.s3key).await;
                }
            }
            AckPolicy::Requeue { max_attempts } if task.attempt.saturating_add(1) < max_attempts => {
                let retry = task.next_attempt();
                info!(
                    "🔁 Requeueing '{}' (attempt {}/{})",
                    task.s3key,
                    retry.attempt.saturating_add(1),
                    max_attempts
                );
                if let Err(e) = queue.enqueue(&retry).await {
                    error!("Failed to requeue '{}', returning it to the broker: {:#}", task.s3key, e);
                    if let Err(e) = delivery.requeue().await {
                        error!("Failed to nack '{}': {:#}", task.s3key, e);
                    }
                    return Some(outcome);
                }
            }
            AckPolicy::Requeue { max_attempts } => {
                warn!(
                    "☠️  Task '{}' exhausted {} attempts, dead-lettering",
                    task.s3key, max_attempts
                );
                if let Err(e) = queue.dead_letter(&task.encode(), &reason).await {
                    error!("Failed to dead-letter '{}': {:#}", task.s3key, e);
                }
                if poisoned {
                    self.quarantine(&task.s3key).await;
                }
            }
        }

        if let Err(e) = delivery.ack().await {
            error!("Failed to ack '{}': {:#}", task.s3key, e);
        }
        Some(outcome)
    }

    /// Consumes deliveries one at a time until shutdown or until the
    /// subscription ends. A pending shutdown wins over a ready delivery.
    pub async fn run<S: TaskSubscription>(
        &self,
        mut subscription: S,
        queue: &dyn TaskQueue,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumerExit {
        info!("🚀 Conversion worker started");

        loop {
            if *shutdown.borrow() {
                info!("🛑 Conversion worker shutting down");
                return ConsumerExit::Shutdown;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("🛑 Conversion worker shutting down");
                    return ConsumerExit::Shutdown;
                }
                next = subscription.next_delivery() => match next {
                    Some(Ok(delivery)) => {
                        self.handle_delivery(delivery, queue).await;
                    }
                    Some(Err(e)) => {
                        error!("Failed to receive delivery: {:#}", e);
                    }
                    None => {
                        warn!("📪 Task subscription closed");
                        return ConsumerExit::SubscriptionClosed;
                    }
                }
            }
        }
    }

    /// Converts convertible files left in the staging `original` tree into the
    /// `converted` tree. Never touches the store. Returns `None` if a sweep is
    /// already running or a task currently owns the staging tree.
    pub async fn convert_staged(&self) -> Result<Option<BatchReport>, StagingError> {
        let Some(_ticket) = self.batch_guard.try_start() else {
            debug!("Staged sweep already running, skipping");
            return Ok(None);
        };
        let Ok(_staging) = self.staging_lock.try_lock() else {
            debug!("Task in flight, skipping staged sweep");
            return Ok(None);
        };

        let root = self.staging.original_root().to_path_buf();
        self.staging.ensure_directory(&root).await?;
        self.staging
            .ensure_directory(self.staging.converted_root())
            .await?;

        let mut files = Vec::new();
        collect_files(&root, &mut files).await?;

        let mut report = BatchReport::default();
        for path in files {
            let Some(key) = relative_key(&root, &path) else {
                report.skipped += 1;
                continue;
            };
            if !self.is_convertible(&key) {
                report.skipped += 1;
                continue;
            }

            let dest = self.staging.converted_path(&self.staged_name(&key))?;
            if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                report.skipped += 1;
                continue;
            }

            let converted = async {
                let input = self.staging.read_file(&path).await?;
                let output = self
                    .converter
                    .convert(&input, self.config.target_format)
                    .await?;
                self.staging.write_file(&dest, &output).await?;
                Ok::<_, PipelineError>(())
            }
            .await;

            match converted {
                Ok(()) => {
                    info!("🖼️  Converted staged {} -> {}", path.display(), dest.display());
                    report.converted += 1;
                }
                Err(e) => {
                    error!("Staged conversion of {} failed: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }

        Ok(Some(report))
    }
}

#[async_recursion]
async fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), StagingError> {
    let io_err = |source| StagingError::Io {
        op: "read_dir",
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(io_err)?;
        if file_type.is_dir() {
            collect_files(&path, files).await?;
        } else if file_type.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let segments: Option<Vec<&str>> = rel.iter().map(|s| s.to_str()).collect();
    Some(segments?.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::converter::NativeConverter;
    use crate::services::storage::ObjectPage;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;

    struct OfflineStorage;

    #[async_trait]
    impl StorageService for OfflineStorage {
        async fn list_page(&self, _prefix: &str, _c: Option<String>) -> Result<ObjectPage> {
            Err(anyhow!("offline"))
        }
        async fn get_file(&self, _key: &str) -> Result<Vec<u8>> {
            Err(anyhow!("offline"))
        }
        async fn upload_file(&self, _key: &str, _data: Vec<u8>, _ct: &str) -> Result<()> {
            Err(anyhow!("offline"))
        }
        async fn copy_object(&self, _from: &str, _to: &str) -> Result<()> {
            Err(anyhow!("offline"))
        }
        async fn delete_file(&self, _key: &str) -> Result<()> {
            Err(anyhow!("offline"))
        }
        async fn file_exists(&self, _key: &str) -> Result<bool> {
            Err(anyhow!("offline"))
        }
    }

    fn worker(config: ConverterConfig) -> ConversionWorker {
        ConversionWorker::new(Arc::new(OfflineStorage), Arc::new(NativeConverter), config)
            .with_retry(RetryConfig::immediate(1))
    }

    #[test]
    fn test_destination_key() {
        let worker = worker(ConverterConfig::default());
        assert_eq!(worker.destination_key("a.HEIC"), "a.jpg");
        assert_eq!(worker.destination_key("x/y/a.heic"), "x/y/a.jpg");
        assert_eq!(worker.destination_key("b.txt"), "b.txt");
    }

    #[test]
    fn test_destination_key_between_prefixes() {
        let worker = worker(ConverterConfig {
            source_prefix: "in/".to_string(),
            output_prefix: "out/".to_string(),
            ..ConverterConfig::default()
        });
        assert_eq!(worker.destination_key("in/2024/a.heic"), "out/2024/a.jpg");
        assert_eq!(worker.destination_key("in/b.txt"), "out/b.txt");
    }

    #[tokio::test]
    async fn test_download_failure_is_reported_with_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = worker(ConverterConfig {
            staging_root: tmp.path().join("tmp"),
            ..ConverterConfig::default()
        });

        let outcome = worker.process_task("a.heic").await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed {
                stage: Stage::Download,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unmappable_key_fails_in_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = worker(ConverterConfig {
            staging_root: tmp.path().join("tmp"),
            ..ConverterConfig::default()
        });

        let outcome = worker.process_task("../escape.heic").await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed {
                stage: Stage::Staging,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_staged_sweep_is_single_flight() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = worker(ConverterConfig {
            staging_root: tmp.path().join("tmp"),
            ..ConverterConfig::default()
        });

        let held = worker.batch_guard.try_start().unwrap();
        assert_eq!(worker.batch_state(), RunState::Running);
        assert!(worker.convert_staged().await.unwrap().is_none());

        drop(held);
        let report = worker.convert_staged().await.unwrap().unwrap();
        assert_eq!(report, BatchReport::default());
        assert_eq!(worker.batch_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_task_and_sweep_never_share_the_staging_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = worker(ConverterConfig {
            staging_root: tmp.path().join("tmp"),
            ..ConverterConfig::default()
        });

        let held = worker.staging_lock.try_lock().unwrap();
        assert!(worker.convert_staged().await.unwrap().is_none());
        assert_eq!(worker.batch_state(), RunState::Idle);

        let task = worker.process_task("a.heic");
        tokio::pin!(task);
        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), &mut task).await;
        assert!(waited.is_err());
        assert_eq!(worker.in_flight().state(), RunState::Running);

        drop(held);
        assert!(matches!(
            task.await,
            TaskOutcome::Failed {
                stage: Stage::Download,
                ..
            }
        ));
        assert_eq!(worker.in_flight().state(), RunState::Idle);
        assert!(worker.convert_staged().await.unwrap().is_some());
    }

    #[test]
    fn test_relative_key_uses_slashes() {
        let root = Path::new("/stage/original");
        assert_eq!(
            relative_key(root, Path::new("/stage/original/a/b/c.heic")).as_deref(),
            Some("a/b/c.heic")
        );
        assert_eq!(relative_key(root, Path::new("/elsewhere/c.heic")), None);
    }
}
