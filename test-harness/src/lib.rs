// In-process node wiring for cross-crate tests: a loopback anycast transport,
// a loopback durable-subscription home, and small recording helpers.
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use felix_anycast::{
    AnycastError, AnycastStream, ControlKind, ControlReply, ControlRequest, ControlTransport,
    DurableSubscriptionClient, GetRequest, RemoteQueueKey, RemoteTransport, ReplySink, RequesterId,
    SubscriptionDefinition, Tick,
};
use felix_common::DispatchConfig;
use felix_common::ids::NodeId;
use felix_dispatch::{AlarmService, Destination, DetachReason, MessageListener};
use felix_storage::{LockedMessage, Message, StoredMessage};

/// Installs a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
/// Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_test_writer();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

pub fn message(payload: &'static str) -> Message {
    Message::new(Bytes::from_static(payload.as_bytes()))
}

/// Routes serving-node replies to the requesting keys registered with it.
#[derive(Default)]
pub struct ReplyRouter {
    keys: Mutex<HashMap<RequesterId, Weak<RemoteQueueKey>, ahash::RandomState>>,
}

impl ReplyRouter {
    fn key(&self, requester: RequesterId) -> Option<Arc<RemoteQueueKey>> {
        self.keys.lock().get(&requester).and_then(Weak::upgrade)
    }
}

impl ReplySink for ReplyRouter {
    fn satisfied(&self, requester: RequesterId, tick: Tick, message: Arc<StoredMessage>) {
        match self.key(requester) {
            Some(key) => key.message_received(tick, message),
            None => tracing::debug!(%requester, %tick, "reply for unregistered requester"),
        }
    }

    fn expired(&self, requester: RequesterId, tick: Tick) {
        if let Some(key) = self.key(requester) {
            key.completed_received(tick);
        }
    }
}

/// A serving node reached through direct calls. Requests run synchronously
/// on the caller's thread, replies come back the same way.
pub struct Loopback {
    node: NodeId,
    stream: Arc<AnycastStream>,
    router: Arc<ReplyRouter>,
    reachable: AtomicBool,
    gets: AtomicUsize,
}

impl Loopback {
    /// Serves `destination` as a node of its own.
    pub fn serve(
        destination: Arc<Destination>,
        alarms: AlarmService,
        config: &DispatchConfig,
    ) -> Arc<Self> {
        let router = Arc::new(ReplyRouter::default());
        let stream = AnycastStream::new(destination, router.clone(), alarms, config);
        Arc::new(Self {
            node: NodeId::new(),
            stream,
            router,
            reachable: AtomicBool::new(true),
            gets: AtomicUsize::new(0),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn stream(&self) -> &Arc<AnycastStream> {
        &self.stream
    }

    /// Routes replies for the key's requester back to it.
    pub fn register(&self, key: &Arc<RemoteQueueKey>) {
        self.router
            .keys
            .lock()
            .insert(key.requester(), Arc::downgrade(key));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Get requests that reached the serving node.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn check(&self, node: NodeId) -> felix_anycast::Result<()> {
        if node != self.node || !self.reachable.load(Ordering::SeqCst) {
            return Err(AnycastError::Unreachable(node.to_string()));
        }
        Ok(())
    }
}

impl RemoteTransport for Loopback {
    fn is_reachable(&self, node: NodeId) -> bool {
        self.check(node).is_ok()
    }

    fn get(&self, node: NodeId, request: GetRequest) -> felix_anycast::Result<()> {
        self.check(node)?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.stream.process_request(request)
    }

    fn cancel(
        &self,
        node: NodeId,
        requester: RequesterId,
        tick: Tick,
    ) -> felix_anycast::Result<()> {
        self.check(node)?;
        self.stream.cancel_request(requester, tick);
        Ok(())
    }

    fn accept(
        &self,
        node: NodeId,
        requester: RequesterId,
        ticks: &[Tick],
    ) -> felix_anycast::Result<()> {
        self.check(node)?;
        self.stream.accept(requester, ticks)
    }

    fn reject(
        &self,
        node: NodeId,
        requester: RequesterId,
        ticks: &[Tick],
    ) -> felix_anycast::Result<()> {
        self.check(node)?;
        self.stream.reject(requester, ticks)
    }
}

#[derive(Debug)]
struct Subscription {
    definition: SubscriptionDefinition,
    attached: bool,
}

/// Home node for durable subscriptions. Answers each control request
/// synchronously, except for requests it has been told to drop.
#[derive(Default)]
pub struct SubscriptionHome {
    subscriptions: Mutex<HashMap<String, Subscription, ahash::RandomState>>,
    denied: Mutex<HashSet<String>>,
    client: OnceLock<Weak<DurableSubscriptionClient>>,
    drop_next: AtomicUsize,
    received: AtomicUsize,
}

impl SubscriptionHome {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Builds the client that talks to this home and wires its replies back.
    pub fn client(self: &Arc<Self>, config: &DispatchConfig) -> Arc<DurableSubscriptionClient> {
        let client = Arc::new(DurableSubscriptionClient::new(
            self.clone(),
            NodeId::new(),
            config,
        ));
        let _ = self.client.set(Arc::downgrade(&client));
        client
    }

    pub fn deny(&self, subscription: &str) {
        self.denied.lock().insert(subscription.to_string());
    }

    /// Loses the next `count` requests without replying.
    pub fn drop_next(&self, count: usize) {
        self.drop_next.store(count, Ordering::SeqCst);
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub fn contains(&self, subscription: &str) -> bool {
        self.subscriptions.lock().contains_key(subscription)
    }

    /// Ends the consumer attached to `subscription`.
    pub fn detach(&self, subscription: &str) {
        if let Some(entry) = self.subscriptions.lock().get_mut(subscription) {
            entry.attached = false;
        }
    }

    fn answer(&self, request: &ControlRequest) -> ControlReply {
        if self.denied.lock().contains(&request.subscription) {
            return ControlReply::NotAuthorized;
        }
        let name = &request.subscription;
        let mut subscriptions = self.subscriptions.lock();
        let current = subscriptions
            .get(name)
            .map(|entry| (entry.attached, entry.definition.clone()));
        match (&request.kind, current) {
            (ControlKind::Create(_), Some(_)) => ControlReply::Exists,
            (ControlKind::Create(definition), None) => {
                subscriptions.insert(
                    name.clone(),
                    Subscription {
                        definition: definition.clone(),
                        attached: false,
                    },
                );
                ControlReply::Ok
            }
            (ControlKind::Delete | ControlKind::Attach(_), None) => ControlReply::NotFound,
            (ControlKind::Delete, Some((true, _))) => ControlReply::InUse,
            (ControlKind::Delete, Some(_)) => {
                subscriptions.remove(name);
                ControlReply::Ok
            }
            (ControlKind::Attach(definition), Some((_, existing))) if *definition != existing => {
                ControlReply::Mismatch
            }
            (ControlKind::Attach(_), Some((true, _))) => ControlReply::InUse,
            (ControlKind::Attach(_), Some(_)) => {
                if let Some(entry) = subscriptions.get_mut(name) {
                    entry.attached = true;
                }
                ControlReply::Ok
            }
        }
    }
}

impl ControlTransport for SubscriptionHome {
    fn send(&self, _node: NodeId, request: ControlRequest) -> felix_anycast::Result<()> {
        self.received.fetch_add(1, Ordering::SeqCst);
        let dropped = self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if dropped {
            tracing::debug!(tick = %request.tick, "dropping control request");
            return Ok(());
        }
        let reply = self.answer(&request);
        if let Some(client) = self.client.get().and_then(Weak::upgrade) {
            client.handle_reply(request.tick, reply);
        }
        Ok(())
    }
}

/// Listener that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<LockedMessage>>,
    detached: Mutex<Vec<DetachReason>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<LockedMessage> {
        self.messages.lock().clone()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.messages.lock().iter().map(|message| message.id().0).collect()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.messages
            .lock()
            .iter()
            .map(|message| message.message().payload().clone())
            .collect()
    }

    pub fn detached(&self) -> Vec<DetachReason> {
        self.detached.lock().clone()
    }
}

impl MessageListener for RecordingListener {
    fn on_message(&self, message: LockedMessage) {
        self.messages.lock().push(message);
    }

    fn on_detached(&self, reason: DetachReason) {
        self.detached.lock().push(reason);
    }
}
