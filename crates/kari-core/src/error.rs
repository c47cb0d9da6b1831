use thiserror::Error;

/// Errors that can occur while specifying, compiling or training Kari models.
#[derive(Debug, Error)]
pub enum KariError {
    /// The model specification could not be read or is missing a key.
    #[error("invalid model specification: {0}")]
    Config(String),

    /// A dataset violates the aligned, post-padded layout.
    #[error("invalid dataset {name:?}: {reason}")]
    InvalidDataset {
        /// Display name of the offending dataset.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The fold count is incompatible with a dataset size.
    #[error("cannot split {samples} samples into {k} folds")]
    InvalidFolds {
        /// Requested number of folds.
        k: usize,
        /// Number of samples available.
        samples: usize,
    },

    /// An operation was called before the model reached the required state.
    #[error("model is {actual:?}, expected {expected:?}")]
    InvalidState {
        /// State required by the operation.
        expected: crate::model::ModelState,
        /// State the model is actually in.
        actual: crate::model::ModelState,
    },

    /// The optimizer name is not one of the supported optimizers.
    #[error("unknown optimizer: {0}")]
    UnknownOptimizer(String),

    /// The activation name is not one of the supported activations.
    #[error("unknown activation function: {0}")]
    UnknownActivation(String),

    /// Scores handed to the Viterbi decoder do not fit its tag set.
    #[error("decode error: {0}")]
    Decode(String),

    /// Candle ML framework error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Kari operations.
pub type Result<T> = std::result::Result<T, KariError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelState;

    #[test]
    fn error_display_messages() {
        let err = KariError::InvalidFolds { k: 5, samples: 3 };
        assert_eq!(err.to_string(), "cannot split 3 samples into 5 folds");

        let err = KariError::InvalidState {
            expected: ModelState::Specified,
            actual: ModelState::Unspecified,
        };
        assert!(err.to_string().contains("Unspecified"));

        let err = KariError::InvalidDataset {
            name: "bc5cdr".into(),
            reason: "ragged".into(),
        };
        assert!(err.to_string().contains("bc5cdr"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KariError>();
    }
}
