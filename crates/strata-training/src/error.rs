use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    /// An operation that needs a trained or loaded model ran before one existed.
    #[error("model has not been trained or loaded: {0}")]
    Initialization(String),

    /// Invalid or contradictory configuration, detected before any I/O.
    #[error("invalid configuration: {0}")]
    ConfigResolution(String),

    #[error("preprocessing failed: {0}")]
    Preprocessing(String),

    #[error("training failed: {0}")]
    Training(String),

    /// The model or backend does not implement the requested capability.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("unknown model type: {0}")]
    UnknownModelType(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    /// Whether composite flows may degrade this error to "skipped".
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOperation(_))
    }
}
