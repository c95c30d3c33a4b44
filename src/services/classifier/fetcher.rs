use crate::config::{ClassifierConfig, OnnxConfig};
use crate::error::AppError;
use crate::services::classifier::cache::{CacheInspector, PARTIAL_SUFFIX};
use crate::services::classifier::catalog::ModelDescriptor;
use crate::services::classifier::inference::{Classifier, OnnxClassifier};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub type LoadedModel = Arc<dyn Classifier>;

/// Gap between cancel checks while a download stream is idle.
const CANCEL_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    Complete,
    /// The hub answered 404; nothing was written.
    NotFound,
}

/// Fetches a model into the cache and materialises it.
///
/// Implementations poll `cancel` at safe points and return
/// [`AppError::Cancelled`] without leaving a truncated file behind.
pub trait ModelFetcher: Send + Sync {
    fn fetch(
        &self,
        descriptor: ModelDescriptor,
        allow_resume: bool,
        cancel: Arc<AtomicBool>,
    ) -> BoxFuture<'static, Result<LoadedModel, AppError>>;
}

/// Downloads from a hub using the `models--org--name/snapshots/<rev>` layout.
#[derive(Clone)]
pub struct HubFetcher {
    client: reqwest::Client,
    base_url: String,
    cache: CacheInspector,
    onnx: OnnxConfig,
}

impl HubFetcher {
    pub fn new(config: &ClassifierConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rescue-classifier/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.network.probe_timeout())
            .read_timeout(config.network.read_timeout())
            .build()
            .map_err(|e| AppError::NotAvailable(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.hub_base_url.trim_end_matches('/').to_string(),
            cache: CacheInspector::new(config.model_dir.clone()),
            onnx: config.onnx.clone(),
        })
    }

    fn file_url(&self, descriptor: &ModelDescriptor, file: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.base_url, descriptor.remote_id, descriptor.revision, file
        )
    }

    async fn acquire(
        self,
        descriptor: ModelDescriptor,
        allow_resume: bool,
        cancel: Arc<AtomicBool>,
    ) -> Result<LoadedModel, AppError> {
        let snapshot = match self.cache.complete_snapshot(&descriptor) {
            Some(snapshot) => {
                debug!("{} found in cache at {}", descriptor.id, snapshot.display());
                snapshot
            }
            None => {
                let snapshot = self.cache.snapshot_dir(&descriptor);
                if !snapshot.join(&descriptor.metadata_file).is_file() {
                    let url = self.file_url(&descriptor, &descriptor.metadata_file);
                    let dest = snapshot.join(&descriptor.metadata_file);
                    if download_file(&self.client, &url, &dest, allow_resume, &cancel).await?
                        == Fetched::NotFound
                    {
                        return Err(AppError::NonRetriable(format!(
                            "{} has no {} on the hub",
                            descriptor.remote_id, descriptor.metadata_file
                        )));
                    }
                }
                if descriptor.weights_in(&snapshot).is_none() {
                    self.fetch_weights(&descriptor, &snapshot, allow_resume, &cancel)
                        .await?;
                }
                snapshot
            }
        };

        if cancel.load(Ordering::Relaxed) {
            return Err(AppError::Cancelled);
        }

        let onnx = self.onnx.clone();
        let model = tokio::task::spawn_blocking(move || {
            OnnxClassifier::load(&snapshot, &descriptor, &onnx)
        })
        .await
        .map_err(|e| AppError::NonRetriable(format!("Failed to spawn model loading task: {}", e)))??;

        Ok(Arc::new(model) as LoadedModel)
    }

    /// Tries each weights candidate in order until one exists upstream.
    async fn fetch_weights(
        &self,
        descriptor: &ModelDescriptor,
        snapshot: &Path,
        allow_resume: bool,
        cancel: &AtomicBool,
    ) -> Result<(), AppError> {
        for file in &descriptor.weights_files {
            let url = self.file_url(descriptor, file);
            match download_file(&self.client, &url, &snapshot.join(file), allow_resume, cancel)
                .await?
            {
                Fetched::Complete => return Ok(()),
                Fetched::NotFound => debug!("{} not published, trying next candidate", url),
            }
        }
        Err(AppError::NonRetriable(format!(
            "No ONNX weights published for {} (tried {})",
            descriptor.remote_id,
            descriptor.weights_files.join(", ")
        )))
    }
}

impl ModelFetcher for HubFetcher {
    fn fetch(
        &self,
        descriptor: ModelDescriptor,
        allow_resume: bool,
        cancel: Arc<AtomicBool>,
    ) -> BoxFuture<'static, Result<LoadedModel, AppError>> {
        self.clone().acquire(descriptor, allow_resume, cancel).boxed()
    }
}

pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Streams `url` into `dest` through a `.part` file, renamed once complete.
pub async fn download_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    allow_resume: bool,
    cancel: &AtomicBool,
) -> Result<Fetched, AppError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = partial_path(dest);

    let offset = if allow_resume {
        tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0)
    } else {
        0
    };

    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={}-", offset));
    }
    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Ok(Fetched::NotFound);
    }
    if status == StatusCode::RANGE_NOT_SATISFIABLE {
        // Stale part file from a different upstream revision.
        tokio::fs::remove_file(&part).await?;
        return Err(AppError::Transient(format!(
            "Partial download of {} was invalid, restarting",
            url
        )));
    }
    let response = response.error_for_status()?;

    let resuming = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
    let mut file = if resuming {
        info!("Resuming {} from byte {}", url, offset);
        tokio::fs::OpenOptions::new().append(true).open(&part).await?
    } else {
        tokio::fs::File::create(&part).await?
    };

    let mut stream = response.bytes_stream();
    loop {
        if cancel.load(Ordering::Relaxed) {
            // Keep what we have for the next resume.
            file.flush().await?;
            file.sync_all().await?;
            return Err(AppError::Cancelled);
        }
        let next = match tokio::time::timeout(CANCEL_POLL, stream.next()).await {
            Ok(next) => next,
            Err(_) => continue,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                file.flush().await?;
                file.sync_all().await?;
                return Err(e.into());
            }
        };
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&part, dest).await?;
    debug!("Downloaded {} to {}", url, dest.display());
    Ok(Fetched::Complete)
}
