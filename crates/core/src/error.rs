//! Error kinds surfaced by the interpolation pipeline.
//!
//! Every variant is fatal to the current `process` call: no partial output is
//! produced and nothing is retried.

use std::fmt::Display;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterpolationError {
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },
    #[error("allocation failed: {0}")]
    AllocationFailure(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("sub-network '{network}' failed: {message}")]
    Inference { network: String, message: String },
    #[error("kernel failure: {0}")]
    Kernel(String),
}

pub type Result<T, E = InterpolationError> = std::result::Result<T, E>;

impl InterpolationError {
    pub fn shape(
        context: impl Into<String>,
        expected: impl Display,
        actual: impl Display,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub fn inference(network: impl Into<String>, error: impl Display) -> Self {
        Self::Inference {
            network: network.into(),
            message: error.to_string(),
        }
    }

    /// True for errors detected before any compute started.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration(_) | Self::DeviceUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_message_names_context() {
        let error = InterpolationError::shape("correlation", "32x32x8", "32x16x8");
        assert_eq!(
            error.to_string(),
            "shape mismatch in correlation: expected 32x32x8, got 32x16x8"
        );
    }

    #[test]
    fn configuration_errors_are_flagged() {
        assert!(InterpolationError::config("tile size 100").is_configuration());
        assert!(InterpolationError::DeviceUnavailable("gpu 3".into()).is_configuration());
        assert!(!InterpolationError::AllocationFailure("oom".into()).is_configuration());
    }

    #[test]
    fn inference_error_keeps_network_name() {
        let error = InterpolationError::inference("flownet", "bad input");
        assert_eq!(error.to_string(), "sub-network 'flownet' failed: bad input");
    }
}
