use crate::services::classifier::catalog::ModelDescriptor;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const PARTIAL_SUFFIX: &str = ".part";

/// Answers "is this model fully on disk" from the filesystem alone.
#[derive(Clone, Debug)]
pub struct CacheInspector {
    root: PathBuf,
}

impl CacheInspector {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.root.join(&descriptor.cache_subdir)
    }

    pub fn snapshot_dir(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.model_dir(descriptor)
            .join(SNAPSHOTS_DIR)
            .join(&descriptor.revision)
    }

    pub fn is_present(&self, descriptor: &ModelDescriptor) -> bool {
        self.complete_snapshot(descriptor).is_some()
    }

    /// First snapshot holding the metadata and at least one weights candidate.
    pub fn complete_snapshot(&self, descriptor: &ModelDescriptor) -> Option<PathBuf> {
        let snapshots = self.model_dir(descriptor).join(SNAPSHOTS_DIR);
        if !snapshots.is_dir() {
            return None;
        }

        // Prefer the configured revision, then any other snapshot.
        let preferred = snapshots.join(&descriptor.revision);
        if is_complete(&preferred, descriptor) {
            return Some(preferred);
        }

        WalkDir::new(&snapshots)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .find(|dir| is_complete(dir, descriptor))
    }
}

fn is_complete(snapshot: &Path, descriptor: &ModelDescriptor) -> bool {
    snapshot.join(&descriptor.metadata_file).is_file()
        && descriptor.weights_in(snapshot).is_some()
}
