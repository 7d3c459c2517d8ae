// Consumer dispatch core: admission control, key matching and local delivery.
// Lock order, outermost first: destination ready-list, key group, consumer
// point state, consumer set gate, classification table, key cursors, store.
use felix_storage::StorageError;

pub mod alarm;
pub mod classification;
pub mod consumer_point;
pub mod consumer_set;
pub mod destination;
pub mod key;
pub mod key_group;
pub mod selector;

pub use alarm::{AlarmHandle, AlarmService};
pub use classification::{ClassTable, Classifications, UNCLASSIFIED};
pub use consumer_point::{LocalConsumerPoint, MessageListener, SuspendFlags};
pub use consumer_set::{AdmissionPermit, ConsumerSet, ConsumerSetMember};
pub use destination::{Destination, DestinationOptions};
pub use key::{
    Admission, ConsumableKey, ConsumerKey, ConsumerOptions, ConsumerPointHandle, DetachReason,
    Offer,
};
pub use key_group::ConsumerKeyGroup;
pub use selector::{ConsumerFilter, Discriminator, Selector};

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("usage error: {0}")]
    Usage(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
    #[error("destination deleted: {0}")]
    DestinationDeleted(String),
    #[error("consumer closed")]
    Closed,
    #[error("no tokio runtime available for alarms")]
    NoRuntime,
    #[error(transparent)]
    Storage(#[from] StorageError),
}
