// Anycast consumption: serving remote consumers from a local destination, and
// consuming from a destination hosted on another node.
//
// Serving side: an `AnycastStream` owns one `RemoteConsumerPoint` per
// requesting consumer. Each point tracks that consumer's outstanding get
// requests (ticks) and satisfies them from its key on the local destination.
//
// Requesting side: a `RemoteQueueKey` stands in for a local consumer key,
// issuing get requests over a `RemoteTransport` and buffering the replies.
// A `PrefetchController` sizes its speculative request window.
use felix_dispatch::DispatchError;
use felix_storage::StorageError;

pub mod correlation;
pub mod durable;
pub mod prefetch;
pub mod remote_key;
pub mod remote_point;
pub mod stream;
pub mod tick;
pub mod transport;

pub use correlation::TickTable;
pub use durable::{DurableSubscriptionClient, SubscriptionDefinition};
pub use prefetch::PrefetchController;
pub use remote_key::{RemoteKeyOptions, RemoteQueueKey};
pub use remote_point::{RemoteConsumerPoint, RemotePointParent};
pub use stream::AnycastStream;
pub use tick::{RequestTick, Tick, TickGenerator, TickOutcome};
pub use transport::{
    ControlKind, ControlReply, ControlRequest, ControlTransport, GetRequest, RemoteTransport,
    ReplySink, RequesterId,
};

pub type Result<T> = std::result::Result<T, AnycastError>;

#[derive(thiserror::Error, Debug)]
pub enum AnycastError {
    #[error("remote consumer point closed")]
    Closed,
    #[error("node {0} is unreachable")]
    Unreachable(String),
    #[error("no reply after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("durable subscription {0} not found")]
    SubscriptionNotFound(String),
    #[error("not authorized for durable subscription {0}")]
    NotAuthorized(String),
    #[error("durable subscription {0} exists with a different definition")]
    SubscriptionMismatch(String),
    #[error("durable subscription {0} already exists")]
    SubscriptionExists(String),
    #[error("durable subscription {0} is in use")]
    SubscriptionInUse(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
