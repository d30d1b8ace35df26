use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Channel write error: {0}")]
    ChannelWrite(String),

    #[error("Channel subscription error: {0}")]
    ChannelSubscription(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Dispatch already in flight")]
    DispatchInFlight,

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
