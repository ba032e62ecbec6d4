//! Error type for model validation and parsing.

/// Failure raised while parsing, validating or transforming the cluster model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Input that is well-formed but semantically rejected.
    #[error("{0}")]
    Invalid(String),

    #[error("Unknown setting: '{0}'")]
    UnknownSetting(String),

    #[error("Invalid {what}: '{input}'")]
    Malformed { what: &'static str, input: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Duplicate {0}")]
    Duplicate(String),
}

impl ModelError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub(crate) fn malformed(what: &'static str, input: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            input: input.into(),
        }
    }
}
