use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::problems::ProblemReason;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid GEO series accession: {0}")]
    InvalidAccession(String),

    #[error("{kind} not found upstream: {id}")]
    NotFound { kind: String, id: String },

    #[error("{service} request failed transiently: {message}")]
    TransientFetch { service: String, message: String },

    #[error("{service} returned status {status}: {message}")]
    UpstreamStatus {
        service: String,
        status: u16,
        message: String,
    },

    #[error("{service} request failed: {message}")]
    Http { service: String, message: String },

    #[error("{provider} provider error: {message}")]
    Provider {
        provider: String,
        message: String,
        retryable: bool,
    },

    #[error("unreadable cache entry at {path}: {message}")]
    CacheCorruption { path: String, message: String },

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("worker pool error: {0}")]
    WorkerPool(String),
}

impl PipelineError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        PipelineError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::TransientFetch { .. } => true,
            PipelineError::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn problem_reason(&self) -> ProblemReason {
        match self {
            PipelineError::InvalidAccession(_) => ProblemReason::InvalidAccession,
            PipelineError::NotFound { .. } => ProblemReason::NotFound,
            PipelineError::TransientFetch { .. } | PipelineError::Http { .. } => {
                ProblemReason::TransientFetch
            }
            PipelineError::Provider { .. } => ProblemReason::ProviderError,
            PipelineError::Parse { .. } | PipelineError::CacheCorruption { .. } => {
                ProblemReason::UnparseableRecord
            }
            _ => ProblemReason::StageFailed,
        }
    }
}
