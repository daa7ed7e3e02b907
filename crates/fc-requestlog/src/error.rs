use thiserror::Error;

#[derive(Error, Debug)]
pub enum RequestLogError {
    #[error("request log entry not found: {0}")]
    NotFound(String),

    #[error("subscriber capacity reached ({0} subscribers)")]
    SubscriberCapacityReached(usize),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RequestLogError>;

impl From<RequestLogError> for fc_common::GatewayError {
    fn from(err: RequestLogError) -> Self {
        match err {
            RequestLogError::NotFound(id) => fc_common::GatewayError::NotFound(id),
            other => fc_common::GatewayError::Persistence(other.to_string()),
        }
    }
}
