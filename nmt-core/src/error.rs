use thiserror::Error;

use crate::model::ModelError;

/// Unified translation errors.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Shape mismatch in {what}: expected {expected}, got {actual}")]
    Shape {
        what: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Model: {0}")]
    Model(#[from] ModelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Input(String),
}

impl TranslateError {
    pub(crate) fn shape(
        what: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::Shape {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Config(_) => "The translation settings are invalid. Check beam width and lengths.",
            Self::Shape { .. } | Self::Model(_) => {
                "The model produced output the search could not use. Check the model weights."
            }
            Self::Io(_) => "Could not read or write the requested files.",
            Self::Json(_) => "A JSON file could not be parsed.",
            Self::Input(_) => "The source input could not be used for translation.",
        }
    }
}

impl serde::Serialize for TranslateError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
