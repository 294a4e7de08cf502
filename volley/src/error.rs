use thiserror::Error as ThisError;

use crate::provider::ProviderError;
use crate::types::ProviderId;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine's public API.
///
/// Failures of individual generation attempts never reach the caller through
/// this type; they are recorded on the item and reflected in job status.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Provider is unknown or currently inactive
    #[error("Provider {0} not found or inactive")]
    ProviderNotFound(ProviderId),

    /// No active provider is flagged as the default
    #[error("No default provider configured")]
    NoProviderConfigured,

    /// Routing needed a provider but none is selectable
    #[error("No active providers available")]
    NoActiveProviders,

    /// Invalid request parameters or batch shape
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Conflicting registration, e.g. a duplicate provider id
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Direct provider call failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
