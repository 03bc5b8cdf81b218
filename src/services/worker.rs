use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::services::conversion_worker::ConversionWorker;
use crate::services::scanner::BucketScanner;

/// Periodic trigger for the scan and, optionally, the staged-batch sweep.
pub struct BackgroundWorker {
    scanner: Arc<BucketScanner>,
    converter: Option<Arc<ConversionWorker>>,
    scan_interval: Duration,
    sweep_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        scanner: Arc<BucketScanner>,
        scan_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            scanner,
            converter: None,
            scan_interval,
            sweep_interval: Duration::ZERO,
            shutdown,
        }
    }

    /// Also sweep the staging tree every `interval`; zero disables it.
    pub fn with_staged_sweep(mut self, converter: Arc<ConversionWorker>, interval: Duration) -> Self {
        self.converter = Some(converter);
        self.sweep_interval = interval;
        self
    }

    pub async fn run(mut self) {
        tracing::info!(
            "🚀 Background worker started (scan every {:?})",
            self.scan_interval
        );

        let scan_period = self.scan_interval.max(Duration::from_secs(1));
        let mut scan_tick = interval_at(Instant::now() + scan_period, scan_period);
        scan_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // A zero period would panic in interval(); park the branch instead.
        let sweep = self
            .converter
            .clone()
            .filter(|_| !self.sweep_interval.is_zero());
        let sweep_period = if sweep.is_some() {
            self.sweep_interval
        } else {
            Duration::from_secs(u32::MAX as u64)
        };
        let mut sweep_tick = interval_at(Instant::now() + sweep_period, sweep_period);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = scan_tick.tick() => {
                    let report = self.scanner.scan().await;
                    tracing::debug!("Scheduled scan: {:?}", report);
                }
                _ = sweep_tick.tick(), if sweep.is_some() => {
                    if let Some(converter) = &sweep {
                        match converter.convert_staged().await {
                            Ok(Some(report)) if report.converted + report.failed > 0 => {
                                tracing::info!(
                                    "🧹 Staged sweep: {} converted, {} failed",
                                    report.converted,
                                    report.failed
                                );
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!("Staged sweep failed: {}", e),
                        }
                    }
                }
            }
        }
    }
}
