use crate::config::ClassifierConfig;
use crate::error::AppError;
use crate::models::classify_types::{
    ClassificationResult, DownloadProgress, ModelId, ModelStatus, Species,
};
use crate::services::classifier::acquirer::ModelAcquirer;
use crate::services::classifier::cache::CacheInspector;
use crate::services::classifier::catalog::ModelCatalog;
use crate::services::classifier::fetcher::{HubFetcher, ModelFetcher};
use crate::services::classifier::inference;
use crate::services::classifier::network::{NetworkProbe, TcpProbe};
use crate::services::classifier::orchestrator::DownloadOrchestrator;
use crate::services::classifier::pipeline::ClassificationPipeline;
use crate::services::classifier::progress::ProgressCallback;
use crate::services::image_loader::{self, ImageSource};
use image::RgbImage;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::{info, warn};

pub type RuntimeCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Entry point held by the application's composition root.
pub struct ClassificationService {
    catalog: Arc<ModelCatalog>,
    cache: CacheInspector,
    orchestrator: DownloadOrchestrator,
    pipeline: ClassificationPipeline,
    uploads_dir: Option<PathBuf>,
    runtime_check: RuntimeCheck,
    runtime_available: OnceLock<bool>,
}

impl ClassificationService {
    /// Hub downloads, TCP probe and the ONNX runtime.
    pub fn new(config: ClassifierConfig) -> Result<Self, AppError> {
        std::fs::create_dir_all(&config.model_dir).map_err(|e| {
            AppError::NonRetriable(format!(
                "Failed to create model directory {}: {}",
                config.model_dir.display(),
                e
            ))
        })?;
        let fetcher = Arc::new(HubFetcher::new(&config)?);
        let probe = Arc::new(TcpProbe::from_config(&config.network));
        Self::with_components(config, fetcher, probe, Arc::new(inference::runtime_available))
    }

    pub fn with_components(
        config: ClassifierConfig,
        fetcher: Arc<dyn ModelFetcher>,
        probe: Arc<dyn NetworkProbe>,
        runtime_check: RuntimeCheck,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let catalog = Arc::new(ModelCatalog::from_config(&config)?);
        let cache = CacheInspector::new(config.model_dir.clone());
        let acquirer = Arc::new(ModelAcquirer::new(
            fetcher,
            probe.clone(),
            config.retry.clone(),
            config.network.clone(),
        ));
        let orchestrator =
            DownloadOrchestrator::new(catalog.clone(), cache.clone(), probe, acquirer);

        Ok(Self {
            catalog,
            cache,
            orchestrator,
            pipeline: ClassificationPipeline::new(config.thresholds, config.labels),
            uploads_dir: config.uploads_dir,
            runtime_check,
            runtime_available: OnceLock::new(),
        })
    }

    /// Checked once, then cached for the life of the service.
    pub fn is_available(&self) -> bool {
        *self.runtime_available.get_or_init(|| (self.runtime_check)())
    }

    /// Recomputed from disk on every call.
    pub fn download_status(&self) -> BTreeMap<ModelId, bool> {
        self.catalog
            .iter()
            .map(|d| (d.id, self.cache.is_present(d)))
            .collect()
    }

    pub fn model_statuses(&self) -> Vec<ModelStatus> {
        self.catalog
            .iter()
            .map(|d| ModelStatus {
                id: d.id,
                state: self.orchestrator.state_of(d.id),
                approx_size_mb: d.approx_size_mb,
            })
            .collect()
    }

    pub fn total_download_size(&self) -> u32 {
        self.orchestrator.missing_size_mb()
    }

    pub async fn download_all(&self, on_progress: Option<ProgressCallback>) -> bool {
        if !self.is_available() {
            if let Some(cb) = &on_progress {
                cb(0, DownloadProgress::TOTAL_STEPS, "AI dependencies not available");
            }
            return false;
        }
        self.orchestrator.download_all(on_progress).await
    }

    pub fn cancel_download(&self) {
        self.orchestrator.cancel();
    }

    pub fn is_downloading(&self) -> bool {
        self.orchestrator.is_downloading()
    }

    pub fn download_progress(&self) -> DownloadProgress {
        self.orchestrator.progress()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<DownloadProgress> {
        self.orchestrator.subscribe()
    }

    /// Loads the species model and, if given, that species' breed model.
    /// Rejected while a download is running.
    pub async fn preload(&self, species: Option<Species>) -> bool {
        if !self.is_available() {
            return false;
        }
        let mut ids = vec![ModelId::Species];
        ids.extend(species.and_then(|s| s.breed_model()));
        for id in ids {
            if let Err(e) = self.orchestrator.load_one(id).await {
                warn!("Preload of {} failed: {}", id, e);
                return false;
            }
        }
        true
    }

    /// Blocking work runs on worker threads; failures come back inside the result.
    pub async fn classify(
        &self,
        source: ImageSource,
        on_progress: Option<ProgressCallback>,
    ) -> ClassificationResult {
        if !self.is_available() {
            return ClassificationResult::from_error(
                AppError::NotAvailable("the ONNX runtime could not be initialised".to_string())
                    .to_string(),
            );
        }

        if !self.download_status().values().all(|present| *present) {
            match on_progress {
                Some(cb) => {
                    if !self.orchestrator.download_all(Some(cb)).await {
                        return ClassificationResult::from_error("Failed to download AI models");
                    }
                }
                None => {
                    return ClassificationResult::from_error(
                        AppError::NotAvailable("AI models are not downloaded yet".to_string())
                            .to_string(),
                    );
                }
            }
        }

        let uploads_dir = self.uploads_dir.clone();
        let image = match tokio::task::spawn_blocking(move || {
            image_loader::decode(&source, uploads_dir.as_deref())
        })
        .await
        {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                warn!("{}", e);
                return ClassificationResult::from_error(
                    "Failed to load image. Please try a different image.",
                );
            }
            Err(e) => return ClassificationResult::from_error(format!("Image worker failed: {}", e)),
        };

        match self.run_pipeline(image).await {
            Ok(result) => {
                info!(
                    "Classified as {:?} / {} ({:.2})",
                    result.species, result.breed, result.breed_confidence
                );
                result
            }
            Err(e) => {
                warn!("Classification error: {}", e);
                ClassificationResult::from_error(e.to_string())
            }
        }
    }

    /// Species first, then only the breed model that species needs.
    async fn run_pipeline(&self, image: RgbImage) -> Result<ClassificationResult, AppError> {
        let image = Arc::new(image);
        let species_model = self.orchestrator.load_one(ModelId::Species).await?;

        let (pipeline, input) = (self.pipeline.clone(), image.clone());
        let (species, confidence) = tokio::task::spawn_blocking(move || {
            pipeline.species_of(&input, species_model.as_ref())
        })
        .await
        .map_err(|e| AppError::Classification(format!("Species worker failed: {}", e)))??;

        let breed_model = match species.breed_model() {
            Some(id) => Some(self.orchestrator.load_one(id).await?),
            None => None,
        };

        let pipeline = self.pipeline.clone();
        tokio::task::spawn_blocking(move || {
            pipeline.breed_result(&image, species, confidence, breed_model.as_deref())
        })
        .await
        .map_err(|e| AppError::Classification(format!("Breed worker failed: {}", e)))?
    }
}
