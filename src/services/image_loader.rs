use crate::error::AppError;
use base64::Engine;
use image::{ImageReader, RgbImage};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub enum ImageSource {
    Bytes(Vec<u8>),
    /// Plain base64 or a `data:image/...;base64,` URI.
    Base64(String),
    Path(PathBuf),
}

impl ImageSource {
    /// Long strings, or ones with a `;` near the start, are treated as base64.
    pub fn parse(source: &str) -> Self {
        let head: String = source.chars().take(100).collect();
        if source.len() > 500 || head.contains(';') {
            ImageSource::Base64(source.to_string())
        } else {
            ImageSource::Path(PathBuf::from(source))
        }
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(bytes)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        ImageSource::Path(path.to_path_buf())
    }
}

/// Decodes to RGB. Relative paths that do not exist are retried under `uploads_dir`.
pub fn decode(source: &ImageSource, uploads_dir: Option<&Path>) -> Result<RgbImage, AppError> {
    let img = match source {
        ImageSource::Bytes(bytes) => image::load_from_memory(bytes)?,
        ImageSource::Base64(data) => {
            let payload = match data.split_once("base64,") {
                Some((_, rest)) => rest,
                None => data.as_str(),
            };
            let bytes = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
            image::load_from_memory(&bytes)?
        }
        ImageSource::Path(path) => {
            let resolved = resolve_path(path, uploads_dir).ok_or_else(|| {
                AppError::Decode(format!("Image not found: {}", path.display()))
            })?;
            ImageReader::open(&resolved)
                .map_err(|e| {
                    AppError::Decode(format!("Failed to open image {}: {}", resolved.display(), e))
                })?
                .with_guessed_format()
                .map_err(|e| {
                    AppError::Decode(format!("Failed to read image {}: {}", resolved.display(), e))
                })?
                .decode()?
        }
    };
    Ok(img.to_rgb8())
}

fn resolve_path(path: &Path, uploads_dir: Option<&Path>) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }
    uploads_dir
        .map(|dir| dir.join(path))
        .filter(|candidate| candidate.exists())
}
