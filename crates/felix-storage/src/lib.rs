// Message store contract consumed by the dispatch core, plus an in-memory item stream.
use std::fmt;

pub mod cursor;
pub mod item_stream;
pub mod message;

pub use cursor::{AcceptAll, LockableCursor, LockedMessage, MessageFilter, MessageStore};
pub use item_stream::ItemStream;
pub use message::{LockId, Message, MessageId, StoredMessage};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageError {
    Unavailable(String),
    NotFound(MessageId),
    NotLocked(MessageId),
    Filter(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable(reason) => write!(f, "store unavailable: {reason}"),
            StorageError::NotFound(id) => write!(f, "message not found: {id}"),
            StorageError::NotLocked(id) => write!(f, "message not locked by caller: {id}"),
            StorageError::Filter(reason) => write!(f, "filter evaluation failed: {reason}"),
        }
    }
}

impl std::error::Error for StorageError {}
