use crate::config::{NetworkConfig, RetryPolicy};
use crate::error::AppError;
use crate::models::classify_types::ModelId;
use crate::services::classifier::catalog::ModelDescriptor;
use crate::services::classifier::fetcher::{LoadedModel, ModelFetcher};
use crate::services::classifier::network::NetworkProbe;
use crate::services::classifier::progress::ProgressReporter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

pub const NETWORK_LOST_MESSAGE: &str = "⚠️ Network connection lost. Waiting for reconnection...";
pub const NETWORK_RESTORED_MESSAGE: &str = "✓ Connection restored. Resuming download...";

/// Loads one model at a time with retries, backoff and cooperative cancel.
pub struct ModelAcquirer {
    fetcher: Arc<dyn ModelFetcher>,
    probe: Arc<dyn NetworkProbe>,
    retry: RetryPolicy,
    network: NetworkConfig,
    loaded: Mutex<HashMap<ModelId, LoadedModel>>,
    cancel: Arc<AtomicBool>,
}

impl ModelAcquirer {
    pub fn new(
        fetcher: Arc<dyn ModelFetcher>,
        probe: Arc<dyn NetworkProbe>,
        retry: RetryPolicy,
        network: NetworkConfig,
    ) -> Self {
        Self {
            fetcher,
            probe,
            retry,
            network,
            loaded: Mutex::new(HashMap::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn reset_cancel_flag(&self) {
        self.cancel.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn loaded(&self, id: ModelId) -> Option<LoadedModel> {
        self.loaded.lock().ok()?.get(&id).cloned()
    }

    pub async fn load(
        &self,
        descriptor: &ModelDescriptor,
        allow_resume: bool,
        reporter: Option<&ProgressReporter>,
    ) -> Result<LoadedModel, AppError> {
        if let Some(model) = self.loaded(descriptor.id) {
            return Ok(model);
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if self.is_cancelled() {
                info!("Download cancelled for {}", descriptor.id);
                return Err(AppError::Cancelled);
            }

            if attempt > 0 {
                let delay = self.retry.delay_before(attempt);
                info!(
                    "Retry attempt {}/{} for {} after {:?}",
                    attempt + 1,
                    max_attempts,
                    descriptor.id,
                    delay
                );
                self.backoff(delay).await?;
            }

            info!("Loading {} model: {}", descriptor.id, descriptor.remote_id);
            let handle = tokio::spawn(self.fetcher.fetch(
                descriptor.clone(),
                allow_resume,
                self.cancel.clone(),
            ));

            match self.supervise(handle, descriptor, reporter).await {
                Ok(model) => {
                    self.loaded
                        .lock()
                        .map_err(|_| AppError::NonRetriable("Model cache lock poisoned".to_string()))?
                        .insert(descriptor.id, model.clone());
                    info!("{} model loaded successfully", descriptor.id);
                    return Ok(model);
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) if !e.is_retriable() => {
                    warn!("Giving up on {}: {}", descriptor.id, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Error loading {} (attempt {}): {}", descriptor.id, attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        warn!("Failed to load {} after {} attempts", descriptor.id, max_attempts);
        Err(AppError::RetriesExhausted {
            attempts: max_attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Sleeps `delay` in poll-sized slices so a cancel is seen promptly.
    async fn backoff(&self, delay: Duration) -> Result<(), AppError> {
        let deadline = Instant::now() + delay;
        let slice = self.network.poll_interval();
        loop {
            if self.is_cancelled() {
                info!("Download cancelled during retry delay");
                return Err(AppError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep(slice.min(deadline - now)).await;
        }
    }

    /// Waits for the fetch worker while watching the cancel flag and the network.
    /// A cancel never aborts the worker; it waits for the worker to stop cleanly.
    async fn supervise(
        &self,
        mut handle: JoinHandle<Result<LoadedModel, AppError>>,
        descriptor: &ModelDescriptor,
        reporter: Option<&ProgressReporter>,
    ) -> Result<LoadedModel, AppError> {
        let mut ticker = tokio::time::interval(self.network.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let check_every = self.network.check_every_polls.max(1);
        let mut polls = 0u32;
        let mut pending_cancel = false;
        let mut network_lost = false;

        loop {
            tokio::select! {
                joined = &mut handle => {
                    let outcome = joined.map_err(|e| {
                        AppError::NonRetriable(format!("Download worker failed: {}", e))
                    })?;
                    if pending_cancel || self.is_cancelled() {
                        info!("Current file completed, cancellation complete for {}", descriptor.id);
                        return Err(AppError::Cancelled);
                    }
                    return outcome;
                }
                _ = ticker.tick() => {
                    if !pending_cancel && self.is_cancelled() {
                        info!("Cancel requested for {}, waiting for current file to complete", descriptor.id);
                        pending_cancel = true;
                    }

                    polls += 1;
                    if polls >= check_every {
                        polls = 0;
                        let reachable = self.probe.is_reachable().await;
                        network_lost = self
                            .on_probe(reachable, network_lost, descriptor, reporter)
                            .await;
                    }
                }
            }
        }
    }

    /// Updates user-facing text on a network transition; returns whether the
    /// connection is currently considered lost. The transfer itself is left alone.
    async fn on_probe(
        &self,
        reachable: bool,
        network_lost: bool,
        descriptor: &ModelDescriptor,
        reporter: Option<&ProgressReporter>,
    ) -> bool {
        if !reachable && !network_lost {
            warn!("Network connection lost while loading {}", descriptor.id);
            if let Some(r) = reporter {
                r.restate(NETWORK_LOST_MESSAGE, false);
            }
            return true;
        }
        if reachable && network_lost {
            info!("Network connection restored, resuming {}", descriptor.id);
            if let Some(r) = reporter {
                r.restate(NETWORK_RESTORED_MESSAGE, true);
                tokio::time::sleep(self.network.restore_notice()).await;
                if !self.is_cancelled() {
                    r.restate(format!("Loading {}...", descriptor.id.label()), false);
                }
            }
            return false;
        }
        network_lost
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::services::classifier::catalog::ModelCatalog;

    fn dog_descriptor() -> ModelDescriptor {
        ModelCatalog::from_config(&ClassifierConfig::default())
            .unwrap()
            .get(ModelId::DogBreed)
            .clone()
    }

    fn transient() -> AppError {
        AppError::Transient("connection reset by peer".to_string())
    }

    fn disk_full() -> AppError {
        AppError::NonRetriable("Insufficient disk space".to_string())
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let fetcher = ScriptedFetcher::new(vec![Step::Fail(transient), Step::Fail(transient)]);
        let acquirer =
            ModelAcquirer::new(fetcher.clone(), FixedProbe::new(true), fast_retry(), fast_network());

        let result = acquirer.load(&dog_descriptor(), true, None).await;
        assert!(result.is_ok());
        assert_eq!(fetcher.calls(), 3);
        assert!(acquirer.loaded(ModelId::DogBreed).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_two_then_four_seconds() {
        let fetcher = ScriptedFetcher::new(vec![Step::Fail(transient), Step::Fail(transient)]);
        let acquirer = ModelAcquirer::new(
            fetcher.clone(),
            FixedProbe::new(true),
            RetryPolicy::default(),
            fast_network(),
        );

        let start = Instant::now();
        acquirer.load(&dog_descriptor(), true, None).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(6), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(7), "waited {:?}", waited);
    }

    #[tokio::test]
    async fn loaded_models_are_memoised() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let acquirer =
            ModelAcquirer::new(fetcher.clone(), FixedProbe::new(true), fast_retry(), fast_network());
        let d = dog_descriptor();

        acquirer.load(&d, true, None).await.unwrap();
        acquirer.load(&d, true, None).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn non_retriable_errors_fail_immediately() {
        let fetcher = ScriptedFetcher::new(vec![Step::Fail(disk_full)]);
        let acquirer =
            ModelAcquirer::new(fetcher.clone(), FixedProbe::new(true), fast_retry(), fast_network());

        let err = acquirer.load(&dog_descriptor(), true, None).await.unwrap_err();
        assert!(matches!(err, AppError::NonRetriable(_)));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_reason() {
        let fetcher = ScriptedFetcher::new(vec![
            Step::Fail(transient),
            Step::Fail(transient),
            Step::Fail(transient),
        ]);
        let acquirer =
            ModelAcquirer::new(fetcher.clone(), FixedProbe::new(true), fast_retry(), fast_network());

        let err = acquirer.load(&dog_descriptor(), true, None).await.unwrap_err();
        match err {
            AppError::RetriesExhausted { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn cancel_waits_for_worker_then_reports_cancelled() {
        let fetcher = ScriptedFetcher::new(vec![Step::UntilCancelled]);
        let acquirer = Arc::new(ModelAcquirer::new(
            fetcher.clone(),
            FixedProbe::new(true),
            fast_retry(),
            fast_network(),
        ));

        let task = {
            let acquirer = acquirer.clone();
            tokio::spawn(async move { acquirer.load(&dog_descriptor(), true, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        acquirer.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert_eq!(fetcher.calls(), 1);
        assert!(acquirer.loaded(ModelId::DogBreed).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_is_prompt() {
        let fetcher = ScriptedFetcher::new(vec![Step::Fail(transient)]);
        let acquirer = Arc::new(ModelAcquirer::new(
            fetcher.clone(),
            FixedProbe::new(true),
            RetryPolicy::default(),
            NetworkConfig::default(),
        ));

        let task = {
            let acquirer = acquirer.clone();
            tokio::spawn(async move { acquirer.load(&dog_descriptor(), true, None).await })
        };
        tokio::time::sleep(Duration::from_millis(600)).await;
        acquirer.cancel();
        let start = Instant::now();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert!(start.elapsed() <= Duration::from_millis(500));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn network_loss_and_restore_only_change_messages() {
        use crate::models::classify_types::DownloadProgress;
        use tokio::sync::watch;

        let fetcher = ScriptedFetcher::new(vec![Step::Slow(Duration::from_millis(80))]);
        let probe = Arc::new(ScriptedProbe(Mutex::new(
            vec![false, false, true].into_iter().collect(),
        )));
        let acquirer = ModelAcquirer::new(fetcher.clone(), probe, fast_retry(), fast_network());

        let (tx, _rx) = watch::channel(DownloadProgress::default());
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(
            Arc::new(tx),
            Some(Arc::new(move |_, _, msg: &str| {
                sink.lock().unwrap().push(msg.to_string())
            })),
        );

        acquirer
            .load(&dog_descriptor(), true, Some(&reporter))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let lost = seen.iter().position(|m| m == NETWORK_LOST_MESSAGE).unwrap();
        let restored = seen.iter().position(|m| m == NETWORK_RESTORED_MESSAGE).unwrap();
        assert!(lost < restored);
        assert_eq!(seen.iter().filter(|m| *m == NETWORK_LOST_MESSAGE).count(), 1);
        assert_eq!(seen[restored + 1], "Loading dog breed model...");
        assert_eq!(fetcher.calls(), 1);
    }
}
