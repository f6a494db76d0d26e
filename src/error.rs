//! Error types for the gantry core.

use thiserror::Error;

/// Main error type for gantry operations.
///
/// Per-pod scheduling failures are deliberately not represented here; they
/// are ordinary results of a pass and surface as
/// [`crate::scheduling::Unschedulable`] values instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A resource quantity could not be parsed.
    #[error("resource error: {0}")]
    Resource(#[from] crate::resources::ResourceError),

    /// A pod or pool constrained a label key reserved for the orchestrator.
    #[error("label {0} is restricted")]
    RestrictedLabel(String),

    /// Cloud provider failure.
    #[error("cloud provider error: {0}")]
    CloudProvider(#[from] crate::cloud::CloudProviderError),

    /// The in-memory cluster mirror and an observation disagree.
    #[error("state inconsistency: {0}")]
    State(String),

    /// Invalid pool or claim configuration.
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Create a restricted-label error for the given key.
    pub fn restricted_label(key: impl Into<String>) -> Self {
        Self::RestrictedLabel(key.into())
    }

    /// Create a state-inconsistency error with the given message.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a validation error with the given message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_their_context() {
        let err = Error::restricted_label("kubernetes.io/custom");
        assert!(err.to_string().contains("kubernetes.io/custom"));

        let err = Error::state("pod default/web references unknown node n-1");
        assert!(err.to_string().contains("unknown node"));
    }
}
