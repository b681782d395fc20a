//! Provider operation interface.
//!
//! The engine knows nothing about what a provider does behind these calls.
//! Every call gets the explicit [`Context`] for the target environment.

pub mod command;
pub mod memory;

pub use command::CommandProvider;
pub use memory::{MemoryProvider, ProviderCall};

use crate::core::types::{Address, Attributes, Context, StepOperation};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Provider failure, classified for the retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeout, rate limit, temporary unavailability: retried with backoff
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Invalid attribute, quota exceeded, authorization denied: not retried
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

/// A create or update call.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyRequest {
    pub context: Context,
    pub kind: String,
    pub address: Address,
    pub operation: StepOperation,
    /// Fully resolved attributes; secrets travel as handle markers
    pub attributes: Attributes,
    /// Recorded attributes for updates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<Attributes>,
}

/// A delete call. `attributes` describe the instance being removed, which
/// for a create-before-destroy replace is the old one, not the current one.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteRequest {
    pub context: Context,
    pub kind: String,
    pub address: Address,
    pub attributes: Attributes,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Create or update; returns the observed attributes.
    async fn apply(&self, request: &ApplyRequest) -> Result<Attributes, ProviderError>;

    async fn delete(&self, request: &DeleteRequest) -> Result<(), ProviderError>;

    /// Read live attributes; `None` if the object no longer exists.
    async fn read(
        &self,
        ctx: &Context,
        kind: &str,
        address: &Address,
    ) -> Result<Option<Attributes>, ProviderError>;

    fn name(&self) -> &str;
}
