//! Error types for peft-tuners.

use thiserror::Error;

use crate::config::PeftType;

/// Result type alias for peft-tuners operations.
pub type Result<T> = std::result::Result<T, PeftError>;

/// Errors that can occur in peft-tuners operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PeftError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No module in the network matched the configured target patterns.
    #[error("target modules {patterns:?} not found in the base model")]
    TargetNotFound {
        /// Patterns that were searched for
        patterns: Vec<String>,
    },

    /// Fewer eligible modules than a layer-count based configuration requested.
    #[error("config specifies more adapter layers ({requested}) than the model has ({available})")]
    InsufficientLayers {
        /// Layers requested by the configuration
        requested: usize,
        /// Eligible layers found in the model
        available: usize,
    },

    /// Adapter family cannot be combined with the adapters already present.
    #[error("adapter type {peft_type} is not compatible, compatible types are {compatible:?}")]
    IncompatibleAdapter {
        /// Rejected adapter family
        peft_type: PeftType,
        /// Families that may be combined
        compatible: Vec<PeftType>,
    },

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dimension mismatch.
    #[error("dimension mismatch: {message}")]
    DimensionMismatch {
        /// Descriptive message
        message: String,
    },

    /// Adapter not found.
    #[error("adapter(s) {name} not found, available adapters: {available:?}")]
    AdapterNotFound {
        /// Name(s) of the missing adapter
        name: String,
        /// Sorted names that do exist
        available: Vec<String>,
    },

    /// Adapter already exists.
    #[error("adapter already exists: {name}")]
    AdapterExists {
        /// Name of the duplicate adapter
        name: String,
    },

    /// Operation is not valid in the current adapter state.
    #[error("invalid adapter state: {0}")]
    StateConflict(String),

    /// A safe merge produced NaN or infinite weights.
    #[error("NaNs detected in the merged weights, the adapter {adapter} seems to be broken")]
    NonFiniteWeights {
        /// Adapter whose delta corrupted the weights
        adapter: String,
    },

    /// Operation is not supported by this model variant.
    #[error("{0}")]
    Unsupported(String),

    /// Weight loading error.
    #[error("failed to load weights: {0}")]
    WeightLoad(String),

    /// Filesystem or (de)serialization error.
    #[error("io error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl PeftError {
    /// Lookup error listing every available name in sorted order.
    pub(crate) fn not_found<S: AsRef<str>>(name: impl Into<String>, available: &[S]) -> Self {
        let mut available: Vec<String> = available.iter().map(|s| s.as_ref().to_string()).collect();
        available.sort();
        Self::AdapterNotFound {
            name: name.into(),
            available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_sorts_available() {
        let err = PeftError::not_found("c", &["b", "a"]);
        match &err {
            PeftError::AdapterNotFound { available, .. } => {
                assert_eq!(available, &["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("available adapters"));
    }
}
