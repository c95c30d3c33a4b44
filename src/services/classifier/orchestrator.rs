use crate::error::AppError;
use crate::models::classify_types::{DownloadProgress, DownloadState, ModelId};
use crate::services::classifier::acquirer::ModelAcquirer;
use crate::services::classifier::cache::CacheInspector;
use crate::services::classifier::catalog::ModelCatalog;
use crate::services::classifier::fetcher::LoadedModel;
use crate::services::classifier::network::NetworkProbe;
use crate::services::classifier::progress::{ProgressCallback, ProgressReporter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const ALREADY_IN_PROGRESS: &str = "Download already in progress...";

#[derive(Default)]
struct RunState {
    active: Option<ModelId>,
    outcomes: HashMap<ModelId, DownloadState>,
}

/// Sequences the three acquisitions; at most one orchestration runs at a time.
pub struct DownloadOrchestrator {
    catalog: Arc<ModelCatalog>,
    cache: CacheInspector,
    probe: Arc<dyn NetworkProbe>,
    acquirer: Arc<ModelAcquirer>,
    run_lock: tokio::sync::Mutex<()>,
    downloading: AtomicBool,
    state: Mutex<RunState>,
    progress: Arc<watch::Sender<DownloadProgress>>,
}

/// Clears the in-progress markers however the orchestration ends.
struct RunGuard<'a> {
    orchestrator: &'a DownloadOrchestrator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.set_active(None);
        self.orchestrator.downloading.store(false, Ordering::SeqCst);
        self.orchestrator.acquirer.reset_cancel_flag();
    }
}

impl DownloadOrchestrator {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        cache: CacheInspector,
        probe: Arc<dyn NetworkProbe>,
        acquirer: Arc<ModelAcquirer>,
    ) -> Self {
        let (tx, _) = watch::channel(DownloadProgress::default());
        Self {
            catalog,
            cache,
            probe,
            acquirer,
            run_lock: tokio::sync::Mutex::new(()),
            downloading: AtomicBool::new(false),
            state: Mutex::new(RunState::default()),
            progress: Arc::new(tx),
        }
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    /// Only meaningful while an orchestration is running.
    pub fn cancel(&self) {
        if !self.is_downloading() {
            debug!("Cancel requested with no download running");
            return;
        }
        info!("Download cancellation requested");
        self.acquirer.cancel();
    }

    pub fn progress(&self) -> DownloadProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadProgress> {
        self.progress.subscribe()
    }

    /// Derived on demand from the cache and the last orchestration.
    pub fn state_of(&self, id: ModelId) -> DownloadState {
        if self.cache.is_present(self.catalog.get(id)) {
            return DownloadState::Downloaded;
        }
        let Ok(state) = self.state.lock() else {
            return DownloadState::NotDownloaded;
        };
        if state.active == Some(id) {
            return DownloadState::Downloading;
        }
        state
            .outcomes
            .get(&id)
            .copied()
            .unwrap_or(DownloadState::NotDownloaded)
    }

    pub async fn download_all(&self, on_progress: Option<ProgressCallback>) -> bool {
        let Ok(_lock) = self.run_lock.try_lock() else {
            info!("Download already in progress, skipping duplicate request");
            if let Some(cb) = &on_progress {
                cb(0, DownloadProgress::TOTAL_STEPS, ALREADY_IN_PROGRESS);
            }
            return false;
        };

        self.downloading.store(true, Ordering::SeqCst);
        let _guard = RunGuard { orchestrator: self };
        self.acquirer.reset_cancel_flag();
        self.clear_outcomes();

        let reporter = ProgressReporter::new(self.progress.clone(), on_progress);
        match self.run(&reporter).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Model download ended: {}", e);
                false
            }
        }
    }

    /// Loads one model outside a full orchestration. Anything that may touch the
    /// cache holds the run lock, so it is rejected while a download is running.
    pub async fn load_one(&self, id: ModelId) -> Result<LoadedModel, AppError> {
        if let Some(model) = self.acquirer.loaded(id) {
            return Ok(model);
        }
        let Ok(_lock) = self.run_lock.try_lock() else {
            info!("Load of {} rejected, download in progress", id);
            return Err(AppError::NotAvailable(
                "a model download is already in progress".to_string(),
            ));
        };

        let descriptor = self.catalog.get(id);
        let fetching = !self.cache.is_present(descriptor);
        self.downloading.store(fetching, Ordering::SeqCst);
        let _guard = RunGuard { orchestrator: self };
        self.acquirer.reset_cancel_flag();

        self.set_active(Some(id));
        let result = self.acquirer.load(descriptor, true, None).await;
        match &result {
            Err(AppError::Cancelled) => self.record(id, DownloadState::Cancelled),
            Err(_) if fetching => self.record(id, DownloadState::Failed),
            _ => {}
        }
        result
    }

    async fn run(&self, reporter: &ProgressReporter) -> Result<(), AppError> {
        reporter.report(0, "Checking network connection...");
        if !self.probe.is_reachable().await {
            let err = AppError::NoNetwork;
            reporter.report(0, err.to_string());
            return Err(err);
        }

        let total_mb = self.missing_size_mb();
        if total_mb > 0 {
            reporter.report(0, format!("Preparing to download ~{}MB of AI models...", total_mb));
        }

        let mut step = 0u32;
        for descriptor in self.catalog.iter() {
            let id = descriptor.id;
            let size_note = if self.cache.is_present(descriptor) {
                " (cached)".to_string()
            } else {
                format!(" (~{}MB)", descriptor.approx_size_mb)
            };
            reporter.report(step, format!("Loading {}{}...", id.label(), size_note));

            self.set_active(Some(id));
            let result = self.acquirer.load(descriptor, true, Some(reporter)).await;
            self.set_active(None);

            match result {
                Ok(_) => {
                    step += 1;
                    reporter.report(step, format!("{} model ready ✓", id.short_name()));
                }
                Err(AppError::Cancelled) => {
                    self.record(id, DownloadState::Cancelled);
                    reporter.report(step, AppError::Cancelled.to_string());
                    return Err(AppError::Cancelled);
                }
                Err(e) => {
                    self.record(id, DownloadState::Failed);
                    reporter.report(step, format!("Failed to download {}: {}", id.label(), e));
                    return Err(e);
                }
            }
        }

        reporter.report(DownloadProgress::TOTAL_STEPS, "All models ready ✓");
        info!("All models ready");
        Ok(())
    }

    /// Sum of `approx_size_mb` over models not yet on disk.
    pub fn missing_size_mb(&self) -> u32 {
        self.catalog
            .iter()
            .filter(|d| !self.cache.is_present(d))
            .map(|d| d.approx_size_mb)
            .sum()
    }

    fn set_active(&self, id: Option<ModelId>) {
        if let Ok(mut state) = self.state.lock() {
            state.active = id;
        }
    }

    fn record(&self, id: ModelId, outcome: DownloadState) {
        if let Ok(mut state) = self.state.lock() {
            state.outcomes.insert(id, outcome);
        }
    }

    fn clear_outcomes(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.outcomes.clear();
        }
    }
}
