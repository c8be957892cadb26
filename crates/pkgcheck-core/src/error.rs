#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CheckError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error("dispatch error: {0}")]
    Dispatch(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("evaluation error: {0}")]
    Evaluation(String),
}

impl CheckError {
    #[must_use]
    pub fn missing(what: &str) -> Self {
        Self::InvalidArgument(format!("{what} MUST be provided"))
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::Dispatch(_) => "dispatch",
            Self::Configuration(_) => "configuration",
            Self::Storage(_) => "storage",
            Self::Evaluation(_) => "evaluation",
        }
    }
}
