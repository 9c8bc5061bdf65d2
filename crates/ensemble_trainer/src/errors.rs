use thiserror::Error;

/// Errors returned by the offline trainer.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("training error: {0}")]
    Training(String),

    #[error("save error: {0}")]
    Save(String),
}
