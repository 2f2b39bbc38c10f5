use thiserror::Error;

use crate::dsp::NodeId;
use crate::host::{DecodeFailure, FailureCode, HandleId};

pub use widget_types::ErrorKind;

/// Failures reported by an [`AudioGraph`](crate::dsp::AudioGraph) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("decode handle {0} already has a graph source")]
    AlreadyWrapped(HandleId),
    #[error("unknown graph node {0}")]
    UnknownNode(NodeId),
    #[error("node {node} has no port {port}")]
    InvalidPort { node: NodeId, port: usize },
    #[error("connecting {from} to {to} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },
}

/// Why the local backend could not open or decode a locator.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("http status {0}")]
    Status(u16),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("unsupported media: {0}")]
    Unsupported(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("resampler: {0}")]
    Resample(String),
    #[error("load cancelled")]
    Cancelled,
}

impl LoadError {
    /// Host-level failure code reported to the engine.
    pub fn failure_code(&self) -> FailureCode {
        match self {
            LoadError::Open { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                FailureCode::Network
            }
            LoadError::Open { .. } => FailureCode::Other,
            LoadError::Status(_) | LoadError::Http(_) => FailureCode::Network,
            LoadError::Unsupported(_) => FailureCode::SourceNotSupported,
            LoadError::Decode(_) => FailureCode::Decode,
            LoadError::Resample(_) => FailureCode::Other,
            LoadError::Cancelled => FailureCode::Aborted,
        }
    }

    pub fn to_failure(&self) -> DecodeFailure {
        DecodeFailure::new(self.failure_code(), self.to_string())
    }
}

/// Settings persistence failures.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings decode: {0}")]
    Decode(String),
    #[error("settings encode: {0}")]
    Encode(String),
}
