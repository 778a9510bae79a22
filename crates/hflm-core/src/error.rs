//! Error types for the evaluation adapter

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed constructor or call input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Checkpoint, tokenizer or hub fetch could not be completed
    #[error("Load failure: {0}")]
    LoadFailure(String),

    /// Forward pass or generation failed inside the runtime
    #[error("Inference failure: {0}")]
    InferenceFailure(String),

    #[error("Tokenization error: {0}")]
    TokenizationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap any loader error, keeping its message.
    pub fn load(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::LoadFailure(format!("{context}: {err}"))
    }
}

// Candle errors surface almost exclusively while running the network. Load
// paths map them explicitly through `Error::load`.
impl From<candle_core::Error> for Error {
    fn from(err: candle_core::Error) -> Self {
        Self::InferenceFailure(err.to_string())
    }
}

impl From<ort::Error> for Error {
    fn from(err: ort::Error) -> Self {
        Self::InferenceFailure(err.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        Self::LoadFailure(format!("Hub error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_keeps_underlying_message() {
        let err = Error::load("config.json", "404 Not Found");
        assert!(matches!(err, Error::LoadFailure(_)));
        assert_eq!(err.to_string(), "Load failure: config.json: 404 Not Found");
    }

    #[test]
    fn test_candle_error_maps_to_inference_failure() {
        let err: Error = candle_core::Error::Msg("shape mismatch".to_string()).into();
        assert!(matches!(err, Error::InferenceFailure(msg) if msg.contains("shape mismatch")));
    }
}
