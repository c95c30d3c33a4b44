pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use config::ClassifierConfig;
pub use error::AppError;
pub use models::classify_types::{
    BreedPrediction, ClassificationResult, DownloadProgress, DownloadState, ModelId, ModelStatus,
    Prediction, Species,
};
pub use services::classifier::fetcher::{LoadedModel, ModelFetcher};
pub use services::classifier::inference::Classifier;
pub use services::classifier::network::NetworkProbe;
pub use services::classifier::progress::ProgressCallback;
pub use services::classifier::service::ClassificationService;
pub use services::image_loader::ImageSource;

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber (`RUST_LOG`, default `info`) unless one is already set.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
