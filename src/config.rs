use crate::error::AppError;
use crate::models::classify_types::ModelId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MODEL_DIR_ENV: &str = "RESCUE_AI_MODEL_DIR";
pub const HUB_URL_ENV: &str = "RESCUE_AI_HUB_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Root of the on-disk model cache.
    pub model_dir: PathBuf,

    /// Fallback directory for relative image paths.
    pub uploads_dir: Option<PathBuf>,

    pub hub_base_url: String,

    pub network: NetworkConfig,

    pub retry: RetryPolicy,

    pub thresholds: Thresholds,

    pub labels: BreedLabels,

    pub onnx: OnnxConfig,

    pub models: Vec<ModelSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_timeout_ms: u64,
    /// Controller poll period while a fetch is in flight.
    pub poll_interval_ms: u64,
    /// Probe the network every N polls during a fetch.
    pub check_every_polls: u32,
    /// Pause after announcing a restored connection.
    pub restore_notice_ms: u64,
    /// A download stream idle this long fails as transient.
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: u32,
    pub backoff_unit_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub min_species_confidence: f32,
    pub fallback_species_confidence: f32,
    pub min_breed_confidence: f32,
    pub species_top_k: usize,
    pub alternatives: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreedLabels {
    pub mixed_dog: String,
    pub mixed_cat: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxConfig {
    pub use_gpu: bool,
    pub intra_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: ModelId,
    pub remote_id: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
    /// ONNX weight candidates in preference order; any one present is enough.
    #[serde(default = "default_weights_files")]
    pub weights_files: Vec<String>,
    pub approx_size_mb: u32,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_norm")]
    pub mean: [f32; 3],
    #[serde(default = "default_norm")]
    pub std: [f32; 3],
}

fn default_revision() -> String {
    "main".to_string()
}

fn default_metadata_file() -> String {
    "config.json".to_string()
}

fn default_weights_files() -> Vec<String> {
    vec!["onnx/model.onnx".to_string(), "model.onnx".to_string()]
}

fn default_input_size() -> u32 {
    224
}

fn default_norm() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}

impl ModelSpec {
    fn new(id: ModelId, remote_id: &str, approx_size_mb: u32) -> Self {
        Self {
            id,
            remote_id: remote_id.to_string(),
            revision: default_revision(),
            metadata_file: default_metadata_file(),
            weights_files: default_weights_files(),
            approx_size_mb,
            input_size: default_input_size(),
            mean: default_norm(),
            std: default_norm(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("storage").join("ai_models"),
            uploads_dir: None,
            hub_base_url: "https://huggingface.co".to_string(),
            network: NetworkConfig::default(),
            retry: RetryPolicy::default(),
            thresholds: Thresholds::default(),
            labels: BreedLabels::default(),
            onnx: OnnxConfig::default(),
            models: vec![
                ModelSpec::new(ModelId::Species, "Xenova/vit-base-patch16-224", 330),
                ModelSpec::new(ModelId::DogBreed, "prithivMLmods/Dog-Breed-120", 340),
                ModelSpec::new(ModelId::CatBreed, "dima806/cat_breed_image_detection", 340),
            ],
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_host: "huggingface.co".to_string(),
            probe_port: 443,
            probe_timeout_ms: 5_000,
            poll_interval_ms: 500,
            check_every_polls: 10,
            restore_notice_ms: 2_000,
            read_timeout_ms: 30_000,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2,
            backoff_unit_ms: 1_000,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_species_confidence: 0.60,
            fallback_species_confidence: 0.30,
            min_breed_confidence: 0.58,
            species_top_k: 10,
            alternatives: 3,
        }
    }
}

impl Default for BreedLabels {
    fn default() -> Self {
        Self {
            mixed_dog: "Aspin (Mixed Breed)".to_string(),
            mixed_cat: "Puspin (Mixed Breed)".to_string(),
        }
    }
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            use_gpu: true,
            intra_threads: 4,
        }
    }
}

impl RetryPolicy {
    /// Sleep before attempt `attempt` (zero-based): `base^attempt` units, none for the first.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = u64::from(self.backoff_base).saturating_pow(attempt);
        Duration::from_millis(self.backoff_unit_ms.saturating_mul(factor))
    }
}

impl NetworkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn restore_notice(&self) -> Duration {
        Duration::from_millis(self.restore_notice_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

impl ClassifierConfig {
    /// Reads `path` when it exists, falls back to defaults, then applies env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                serde_json::from_str::<ClassifierConfig>(&content).map_err(|e| {
                    AppError::NonRetriable(format!("Invalid config {}: {}", p.display(), e))
                })?
            }
            _ => ClassifierConfig::default(),
        };

        if let Ok(dir) = std::env::var(MODEL_DIR_ENV) {
            config.model_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var(HUB_URL_ENV) {
            config.hub_base_url = url.trim_end_matches('/').to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        for id in ModelId::ALL {
            if !self.models.iter().any(|m| m.id == id) {
                return Err(AppError::NonRetriable(format!(
                    "Config is missing the {} model",
                    id
                )));
            }
        }
        if let Some(m) = self.models.iter().find(|m| m.weights_files.is_empty()) {
            return Err(AppError::NonRetriable(format!(
                "Model {} lists no weights files",
                m.id
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::NonRetriable(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
