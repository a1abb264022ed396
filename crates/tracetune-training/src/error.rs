use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    /// A data-pipeline or template contract was broken for a single record.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("distributed runtime error: {0}")]
    Distributed(String),

    /// Workers disagree on how many steps they will run.
    #[error("distributed desync: {0}")]
    DistributedDesync(String),

    /// Another worker failed and released the group.
    #[error("a peer worker aborted the run")]
    PeerAborted,

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    /// Errors that concern one record only and may be skipped by policy.
    #[must_use]
    pub fn is_record_level(&self) -> bool {
        matches!(self, Self::InvariantViolation(_) | Self::Tokenizer(_))
    }
}
