use std::io::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("AI classification is not available: {0}")]
    NotAvailable(String),

    #[error("No network connection. Please check your internet and try again.")]
    NoNetwork,

    #[error("Download cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Transient(String),

    #[error("{0}")]
    NonRetriable(String),

    #[error("Failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Failed to load image: {0}")]
    Decode(String),

    #[error("Classification failed: {0}")]
    Classification(String),
}

impl AppError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }
}

// ENOSPC on unix, ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL on windows
#[cfg(unix)]
const DISK_FULL_CODES: &[i32] = &[28];
#[cfg(windows)]
const DISK_FULL_CODES: &[i32] = &[39, 112];
#[cfg(not(any(unix, windows)))]
const DISK_FULL_CODES: &[i32] = &[];

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == ErrorKind::PermissionDenied {
            return AppError::NonRetriable(format!("Permission denied: {}", err));
        }
        if err
            .raw_os_error()
            .map(|code| DISK_FULL_CODES.contains(&code))
            .unwrap_or(false)
        {
            return AppError::NonRetriable(format!("Insufficient disk space: {}", err));
        }
        AppError::Transient(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status)
                if status.is_client_error()
                    && status != reqwest::StatusCode::REQUEST_TIMEOUT
                    && status != reqwest::StatusCode::TOO_MANY_REQUESTS =>
            {
                AppError::NonRetriable(err.to_string())
            }
            _ => AppError::Transient(err.to_string()),
        }
    }
}

impl From<image::ImageError> for AppError {
    fn from(err: image::ImageError) -> Self {
        AppError::Decode(err.to_string())
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::NonRetriable(format!("Invalid model metadata: {}", err))
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Transient(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Transient(msg.to_string())
    }
}
