use thiserror::Error;

pub type PopupResult<T> = Result<T, PopupError>;

#[derive(Error, Debug)]
pub enum PopupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Campaign store error: {0}")]
    CampaignStore(String),

    #[error("Tracking error: {0}")]
    Tracking(String),

    #[error("Consent error: {0}")]
    Consent(String),

    #[error("Trigger rule error: {0}")]
    Rule(String),

    #[error("Variant allocation error: {0}")]
    Allocation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
