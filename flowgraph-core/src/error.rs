/// Errors raised by the collaborative document store.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Awareness encode error: {0}")]
    AwarenessEncode(#[from] bincode::error::EncodeError),

    #[error("Awareness decode error: {0}")]
    AwarenessDecode(#[from] bincode::error::DecodeError),

    #[error("Corrupt record in '{collection}': {reason}")]
    Corrupt {
        collection: &'static str,
        reason: String,
    },
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::Crdt(e.to_string())
    }
}
