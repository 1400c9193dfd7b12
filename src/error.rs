use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No device available: {0}")]
    DeviceNotFound(String),

    #[error("Connection to {serial} failed: {message}")]
    Connection { serial: String, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Session not ready: {0}")]
    NotReady(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote I/O failed for {path}: {message}")]
    RemoteIo { path: String, message: String },

    #[error("Failed to execute `{command}`: {message}")]
    CommandExecution { command: String, message: String },

    #[error("Failed to load version manifest: {0}")]
    Manifest(String),

    #[error("Failed to fetch patch from {url}: {message}")]
    PatchFetch { url: String, message: String },

    #[error(
        "Invalid patch input (source {}, patch {})",
        validity(.source_valid),
        validity(.patch_valid)
    )]
    InvalidInput { source_valid: bool, patch_valid: bool },

    #[error("Error occurred while patching{}", worker_detail(.message, .code))]
    PatchWorker {
        message: Option<String>,
        code: Option<i32>,
    },

    #[error("A patch job is already running")]
    PatchInProgress,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn remote_io(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteIo {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Extra detail line shown under the headline for worker failures.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::PatchWorker {
                message: Some(message),
                code,
            } => Some(format!(
                "Details: {} (code {})",
                message,
                code.map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )),
            _ => None,
        }
    }
}

fn validity(valid: &bool) -> &'static str {
    if *valid {
        "ok"
    } else {
        "invalid"
    }
}

fn worker_detail(message: &Option<String>, code: &Option<i32>) -> String {
    match message {
        Some(message) => format!(
            ": {} (code {})",
            message,
            code.map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_with_detail() {
        let err = BridgeError::PatchWorker {
            message: Some("target window checksum mismatch".to_string()),
            code: Some(-17712),
        };
        assert_eq!(
            err.to_string(),
            "Error occurred while patching: target window checksum mismatch (code -17712)"
        );
        assert_eq!(
            err.detail().unwrap(),
            "Details: target window checksum mismatch (code -17712)"
        );
    }

    #[test]
    fn test_worker_error_unknown_code() {
        let err = BridgeError::PatchWorker {
            message: Some("boom".to_string()),
            code: None,
        };
        assert_eq!(err.detail().unwrap(), "Details: boom (code unknown)");
    }

    #[test]
    fn test_worker_error_without_detail() {
        let err = BridgeError::PatchWorker {
            message: None,
            code: Some(1),
        };
        assert_eq!(err.to_string(), "Error occurred while patching");
        assert!(err.detail().is_none());
    }

    #[test]
    fn test_invalid_input_message() {
        let err = BridgeError::InvalidInput {
            source_valid: false,
            patch_valid: true,
        };
        assert_eq!(
            err.to_string(),
            "Invalid patch input (source invalid, patch ok)"
        );
    }
}
