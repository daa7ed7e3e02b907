use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelStoreError {
    #[error("no channels configured for this pool")]
    NoChannels,

    #[error("channel not found at index {0}")]
    IndexNotFound(usize),

    #[error("channel name '{0}' already in use")]
    DuplicateName(String),

    #[error("composite mapping invalid: {0}")]
    InvalidComposite(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, ChannelStoreError>;

impl From<ChannelStoreError> for fc_common::GatewayError {
    fn from(err: ChannelStoreError) -> Self {
        match err {
            ChannelStoreError::NoChannels => fc_common::GatewayError::NoChannels,
            ChannelStoreError::IndexNotFound(i) => {
                fc_common::GatewayError::NotFound(format!("channel index {i}"))
            }
            ChannelStoreError::DuplicateName(n) => fc_common::GatewayError::Conflict(n),
            ChannelStoreError::InvalidComposite(m) | ChannelStoreError::Validation(m) => {
                fc_common::GatewayError::InvalidInput(m)
            }
            other => fc_common::GatewayError::Persistence(other.to_string()),
        }
    }
}
