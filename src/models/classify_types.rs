use serde::{Deserialize, Serialize};
use std::fmt;

pub const NOT_SPECIFIED: &str = "Not Specified";
pub const NOT_APPLICABLE: &str = "Not Applicable";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelId {
    Species,
    DogBreed,
    CatBreed,
}

impl ModelId {
    /// Download order.
    pub const ALL: [ModelId; 3] = [ModelId::Species, ModelId::DogBreed, ModelId::CatBreed];

    pub fn key(&self) -> &'static str {
        match self {
            ModelId::Species => "species",
            ModelId::DogBreed => "dog_breed",
            ModelId::CatBreed => "cat_breed",
        }
    }

    /// Lower-case label used inside progress sentences.
    pub fn label(&self) -> &'static str {
        match self {
            ModelId::Species => "species detection model",
            ModelId::DogBreed => "dog breed model",
            ModelId::CatBreed => "cat breed model",
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            ModelId::Species => "Species",
            ModelId::DogBreed => "Dog breed",
            ModelId::CatBreed => "Cat breed",
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Species {
    Dog,
    Cat,
    Other,
}

impl Species {
    pub fn breed_model(&self) -> Option<ModelId> {
        match self {
            Species::Dog => Some(ModelId::DogBreed),
            Species::Cat => Some(ModelId::CatBreed),
            Species::Other => None,
        }
    }
}

/// Raw classifier output, ordered by descending confidence.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    pub confidence: f32,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct BreedPrediction {
    pub breed: String,
    pub confidence: f32,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ClassificationResult {
    /// `None` only for error results.
    pub species: Option<Species>,
    pub species_confidence: f32,
    pub breed: String,
    pub breed_confidence: f32,
    pub alternative_breeds: Vec<BreedPrediction>,
    pub is_mixed_breed: bool,
    /// Unformatted top label from the breed model.
    pub raw_breed: String,
    pub error: Option<String>,
}

impl Default for ClassificationResult {
    fn default() -> Self {
        Self {
            species: None,
            species_confidence: 0.0,
            breed: NOT_SPECIFIED.to_string(),
            breed_confidence: 0.0,
            alternative_breeds: Vec::new(),
            is_mixed_breed: false,
            raw_breed: String::new(),
            error: None,
        }
    }
}

impl ClassificationResult {
    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.species.is_some()
    }

    pub fn has_breed(&self) -> bool {
        !self.is_mixed_breed
            && !matches!(self.breed.as_str(), NOT_SPECIFIED | NOT_APPLICABLE | "")
    }

    pub fn confidence_level(&self) -> &'static str {
        if self.breed_confidence >= 0.80 {
            "High"
        } else if self.breed_confidence >= 0.58 {
            "Medium"
        } else {
            "Low"
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotDownloaded,
    Downloading,
    Downloaded,
    Failed,
    Cancelled,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct DownloadProgress {
    pub current_step: u32,
    pub total_steps: u32,
    pub message: String,
    pub fraction: f32,
    pub network_restored: bool,
}

impl DownloadProgress {
    pub const TOTAL_STEPS: u32 = ModelId::ALL.len() as u32;

    pub fn new(current_step: u32, message: impl Into<String>) -> Self {
        let current_step = current_step.min(Self::TOTAL_STEPS);
        Self {
            current_step,
            total_steps: Self::TOTAL_STEPS,
            message: message.into(),
            fraction: current_step as f32 / Self::TOTAL_STEPS as f32,
            network_restored: false,
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new(0, "Waiting to start...")
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct ModelStatus {
    pub id: ModelId,
    pub state: DownloadState,
    pub approx_size_mb: u32,
}
