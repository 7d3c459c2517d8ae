// Durable-subscription control requests to the subscription's home node.
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

use felix_common::DispatchConfig;
use felix_common::ids::NodeId;
use felix_dispatch::Selector;

use crate::correlation::TickTable;
use crate::tick::{Tick, TickGenerator};
use crate::transport::{ControlKind, ControlReply, ControlRequest, ControlTransport};
use crate::{AnycastError, Result};

/// What a durable subscription consumes. Attaching with a different
/// definition than the one it was created with is a mismatch.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDefinition {
    pub destination: String,
    pub selector: Option<Selector>,
}

impl SubscriptionDefinition {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            selector: None,
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }
}

/// Issues create, delete and attach requests and waits for their replies.
///
/// A request is resent with the same tick every retry interval until a reply
/// arrives or the attempt budget runs out. Replies are fed in through
/// [`DurableSubscriptionClient::handle_reply`] by whatever receives them.
pub struct DurableSubscriptionClient {
    transport: Arc<dyn ControlTransport>,
    home: NodeId,
    retry_interval: Duration,
    max_attempts: u32,
    ticks: TickGenerator,
    pending: Mutex<TickTable<oneshot::Sender<ControlReply>>>,
    closed: AtomicBool,
}

impl DurableSubscriptionClient {
    pub fn new(
        transport: Arc<dyn ControlTransport>,
        home: NodeId,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            transport,
            home,
            retry_interval: config.durable_retry_interval(),
            max_attempts: config.durable_max_attempts.max(1),
            ticks: TickGenerator::new(),
            pending: Mutex::new(TickTable::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn home(&self) -> NodeId {
        self.home
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn create(&self, name: &str, definition: SubscriptionDefinition) -> Result<()> {
        self.request(name, ControlKind::Create(definition)).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.request(name, ControlKind::Delete).await
    }

    pub async fn attach(&self, name: &str, definition: SubscriptionDefinition) -> Result<()> {
        self.request(name, ControlKind::Attach(definition)).await
    }

    /// Completes the request waiting on `tick`. Returns false if none is.
    pub fn handle_reply(&self, tick: Tick, reply: ControlReply) -> bool {
        let Some(waiter) = self.pending.lock().remove(tick) else {
            tracing::debug!(%tick, ?reply, "durable subscription reply for unknown request");
            return false;
        };
        waiter.send(reply).is_ok()
    }

    /// Fails every waiting request and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let waiters = self.pending.lock().drain();
        if !waiters.is_empty() {
            tracing::debug!(
                count = waiters.len(),
                "closing durable subscription client with requests pending",
            );
        }
    }

    async fn request(&self, name: &str, kind: ControlKind) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AnycastError::Closed);
        }
        let tick = self.ticks.next();
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(tick, tx);
        let _pending = PendingEntry {
            pending: &self.pending,
            tick,
        };
        let request = ControlRequest {
            tick,
            subscription: name.to_string(),
            kind,
        };

        let mut attempts = 0;
        let reply = loop {
            attempts += 1;
            self.transport.send(self.home, request.clone())?;
            match tokio::time::timeout(self.retry_interval, &mut rx).await {
                Ok(Ok(reply)) => break reply,
                Ok(Err(_)) => return Err(AnycastError::Closed),
                Err(_) if attempts >= self.max_attempts => {
                    tracing::warn!(
                        subscription = name,
                        %tick,
                        attempts,
                        "durable subscription request gave up",
                    );
                    return Err(AnycastError::Timeout { attempts });
                }
                Err(_) => {
                    metrics::counter!("felix_durable_request_retry_total").increment(1);
                    tracing::warn!(
                        subscription = name,
                        %tick,
                        attempts,
                        "no reply to durable subscription request; resending",
                    );
                }
            }
        };
        check_reply(name, reply)
    }
}

// Forgets the request's tick however the request ends, including when the
// caller drops the future mid-wait.
struct PendingEntry<'a> {
    pending: &'a Mutex<TickTable<oneshot::Sender<ControlReply>>>,
    tick: Tick,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(self.tick);
    }
}

fn check_reply(name: &str, reply: ControlReply) -> Result<()> {
    let name = name.to_string();
    match reply {
        ControlReply::Ok => Ok(()),
        ControlReply::NotFound => Err(AnycastError::SubscriptionNotFound(name)),
        ControlReply::NotAuthorized => Err(AnycastError::NotAuthorized(name)),
        ControlReply::Mismatch => Err(AnycastError::SubscriptionMismatch(name)),
        ControlReply::Exists => Err(AnycastError::SubscriptionExists(name)),
        ControlReply::InUse => Err(AnycastError::SubscriptionInUse(name)),
    }
}
