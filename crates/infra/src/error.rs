//! Error taxonomy of the dispatch layer.
//!
//! Infrastructure errors (`LeaseUnavailable`, `BackendUnavailable`, claim store
//! outages) are transient: they end the current cycle or sweep and the next
//! scheduled invocation retries. `DomainFailure` means the job ran and its
//! action failed; the claim records it as `failed` with the reason.

use syncwarden_core::{ConfigError, CoreError, ResourceId};

use crate::claims::ClaimStoreError;
use crate::jobs::{BackendError, DedupError, RegistryError};
use crate::lease::LeaseError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("lease unavailable: {0}")]
    LeaseUnavailable(String),

    #[error("job backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend refused this one submission; other submissions may pass.
    #[error("job submission rejected: {0}")]
    Rejected(String),

    #[error("domain failure in {}{}: {}", .handler, resource_suffix(.resource_id), .reason)]
    DomainFailure {
        handler: String,
        resource_id: Option<ResourceId>,
        reason: String,
    },

    #[error("unknown job handler: {0}")]
    UnknownHandler(String),

    #[error("claim store error: {0}")]
    ClaimStore(#[from] ClaimStoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

fn resource_suffix(resource_id: &Option<ResourceId>) -> String {
    resource_id
        .map(|id| format!(" (resource {id})"))
        .unwrap_or_default()
}

impl DispatchError {
    /// Whether the failure is expected to clear on a later invocation.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::LeaseUnavailable(_) | DispatchError::BackendUnavailable(_) => true,
            DispatchError::ClaimStore(err) => err.is_unavailable(),
            _ => false,
        }
    }
}

impl From<LeaseError> for DispatchError {
    fn from(value: LeaseError) -> Self {
        match value {
            LeaseError::Unavailable(msg) => DispatchError::LeaseUnavailable(msg),
            LeaseError::InvalidTtl(msg) => DispatchError::Config(msg),
        }
    }
}

impl From<BackendError> for DispatchError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Rejected(msg) => DispatchError::Rejected(msg),
            other => DispatchError::BackendUnavailable(other.to_string()),
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnknownHandler(name) => DispatchError::UnknownHandler(name),
            other => DispatchError::Config(other.to_string()),
        }
    }
}

impl From<DedupError> for DispatchError {
    fn from(value: DedupError) -> Self {
        match value {
            DedupError::Unavailable(msg) => DispatchError::BackendUnavailable(msg),
            DedupError::Canonicalize(msg) => DispatchError::Config(msg),
        }
    }
}

impl From<ConfigError> for DispatchError {
    fn from(value: ConfigError) -> Self {
        DispatchError::Config(value.to_string())
    }
}

impl From<CoreError> for DispatchError {
    fn from(value: CoreError) -> Self {
        DispatchError::Config(value.to_string())
    }
}
