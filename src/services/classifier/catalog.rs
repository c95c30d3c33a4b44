use crate::config::{ClassifierConfig, ModelSpec};
use crate::error::AppError;
use crate::models::classify_types::ModelId;
use std::path::{Path, PathBuf};

/// Static description of one required model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelDescriptor {
    pub id: ModelId,
    pub remote_id: String,
    pub revision: String,
    /// `models--<org>--<name>`, derived from `remote_id`.
    pub cache_subdir: String,
    pub metadata_file: String,
    pub weights_files: Vec<String>,
    pub approx_size_mb: u32,
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ModelDescriptor {
    pub fn from_spec(spec: &ModelSpec) -> Self {
        Self {
            id: spec.id,
            remote_id: spec.remote_id.clone(),
            revision: spec.revision.clone(),
            cache_subdir: cache_dir_name(&spec.remote_id),
            metadata_file: spec.metadata_file.clone(),
            weights_files: spec.weights_files.clone(),
            approx_size_mb: spec.approx_size_mb,
            input_size: spec.input_size,
            mean: spec.mean,
            std: spec.std,
        }
    }

    /// First weights candidate present in `snapshot`.
    pub fn weights_in(&self, snapshot: &Path) -> Option<PathBuf> {
        self.weights_files
            .iter()
            .map(|file| snapshot.join(file))
            .find(|path| path.is_file())
    }
}

pub fn cache_dir_name(remote_id: &str) -> String {
    format!("models--{}", remote_id.replace('/', "--"))
}

#[derive(Clone, Debug)]
pub struct ModelCatalog {
    descriptors: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, AppError> {
        let descriptors = ModelId::ALL
            .iter()
            .map(|id| {
                config
                    .models
                    .iter()
                    .find(|m| m.id == *id)
                    .map(ModelDescriptor::from_spec)
                    .ok_or_else(|| {
                        AppError::NonRetriable(format!("No model configured for {}", id))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { descriptors })
    }

    /// Descriptors in download order.
    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.descriptors.iter()
    }

    pub fn get(&self, id: ModelId) -> &ModelDescriptor {
        // from_config guarantees one descriptor per id, in ModelId::ALL order
        &self.descriptors[id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_dir_follows_hub_layout() {
        assert_eq!(
            cache_dir_name("prithivMLmods/Dog-Breed-120"),
            "models--prithivMLmods--Dog-Breed-120"
        );
    }

    #[test]
    fn catalog_is_ordered_species_dog_cat() {
        let mut config = ClassifierConfig::default();
        config.models.reverse();
        let catalog = ModelCatalog::from_config(&config).unwrap();
        let ids: Vec<_> = catalog.iter().map(|d| d.id).collect();
        assert_eq!(ids, ModelId::ALL.to_vec());
        assert_eq!(catalog.get(ModelId::CatBreed).id, ModelId::CatBreed);
        assert_eq!(catalog.get(ModelId::Species).approx_size_mb, 330);
    }
}
