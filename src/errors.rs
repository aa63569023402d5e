use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("COLLECTION_FAILED: {0}")]
    Collection(String),
    #[error("EVALUATION_FAILED: {0}")]
    Evaluation(String),
    #[error("PERSISTENCE_FAILED: {0}")]
    Persistence(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Short tag stored alongside error log entries.
    pub fn location(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::Collection(_) => "collection",
            Self::Evaluation(_) => "evaluation",
            Self::Persistence(_) => "persistence",
            Self::NotFound(_) => "lookup",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
