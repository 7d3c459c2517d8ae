// Requesting-side consumer key for a queue point hosted on another node.
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use felix_common::DispatchConfig;
use felix_common::ids::{ConnectionId, NodeId};
use felix_dispatch::{
    ConsumableKey, ConsumerPointHandle, ConsumerSet, DetachReason, DispatchError, Discriminator,
    Selector,
};
use felix_storage::{LockId, LockedMessage, MessageId, StorageError, StoredMessage};

use crate::AnycastError;
use crate::prefetch::PrefetchController;
use crate::tick::{Tick, TickGenerator};
use crate::transport::{GetRequest, RemoteTransport, RequesterId};

/// Where a remote key draws from and how it asks.
#[derive(Clone)]
pub struct RemoteKeyOptions {
    pub node: NodeId,
    pub requester: RequesterId,
    pub connection: ConnectionId,
    pub selector: Option<Selector>,
    pub discriminator: Option<Discriminator>,
    pub consumer_set: Option<Arc<ConsumerSet>>,
    /// Draw through a single refill request instead of prefetching.
    pub gathering: bool,
}

impl RemoteKeyOptions {
    pub fn new(node: NodeId, requester: RequesterId, connection: ConnectionId) -> Self {
        Self {
            node,
            requester,
            connection,
            selector: None,
            discriminator: None,
            consumer_set: None,
            gathering: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Prefetch,
    Timed,
    Refill,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    kind: RequestKind,
    issued: Instant,
}

#[derive(Debug)]
struct Buffered {
    tick: Tick,
    message: Arc<StoredMessage>,
    prefetched: bool,
}

struct KeyState {
    ready: bool,
    detached: bool,
    point: Option<Weak<dyn ConsumerPointHandle>>,
    // Received from the serving node, not yet locked by the consumer.
    buffer: VecDeque<Buffered>,
    // Locked by the consumer, awaiting accept or reject.
    locked: HashMap<MessageId, Tick, ahash::RandomState>,
    outstanding: HashMap<Tick, Outstanding, ahash::RandomState>,
    refill: Option<Tick>,
    // Longest wait asked for while a refill was in flight. Inner None is forever.
    deferred_refill: Option<Option<Duration>>,
    prefetch: PrefetchController,
}

// Transport calls gathered under the key lock, sent after it is released.
#[derive(Default)]
struct Sends {
    gets: Vec<GetRequest>,
    cancels: Vec<Tick>,
    rejects: Vec<Tick>,
}

/// Consumer key for a queue point on another node.
///
/// Messages arrive asynchronously through [`RemoteQueueKey::message_received`]
/// and wait in a local buffer until the consumer point locks them. Accepting
/// or rejecting a locked message is forwarded to the serving node.
pub struct RemoteQueueKey {
    options: RemoteKeyOptions,
    transport: Arc<dyn RemoteTransport>,
    ticks: TickGenerator,
    lock_id: LockId,
    state: Mutex<KeyState>,
}

impl RemoteQueueKey {
    pub fn new(
        options: RemoteKeyOptions,
        transport: Arc<dyn RemoteTransport>,
        config: &DispatchConfig,
    ) -> Arc<Self> {
        let lock_id = LockId(options.requester.consumer);
        Arc::new(Self {
            options,
            transport,
            ticks: TickGenerator::new(),
            lock_id,
            state: Mutex::new(KeyState {
                ready: false,
                detached: false,
                point: None,
                buffer: VecDeque::new(),
                locked: HashMap::default(),
                outstanding: HashMap::default(),
                refill: None,
                deferred_refill: None,
                prefetch: PrefetchController::new(config),
            }),
        })
    }

    pub fn node(&self) -> NodeId {
        self.options.node
    }

    pub fn requester(&self) -> RequesterId {
        self.options.requester
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub fn outstanding_requests(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn prefetch_window(&self) -> u32 {
        self.state.lock().prefetch.window()
    }

    pub fn refill_in_flight(&self) -> bool {
        self.state.lock().refill.is_some()
    }

    /// The serving node satisfied `tick` with `message`.
    pub fn message_received(&self, tick: Tick, message: Arc<StoredMessage>) {
        let mut sends = Sends::default();
        let point = {
            let mut state = self.state.lock();
            let request = state.outstanding.remove(&tick);
            match request {
                Some(request) if !state.detached => {
                    state
                        .prefetch
                        .record_rtt(request.issued.elapsed());
                    let prefetched = request.kind == RequestKind::Prefetch;
                    match request.kind {
                        RequestKind::Prefetch => state.prefetch.message_received(),
                        RequestKind::Refill => self.refill_resolved(&mut state, &mut sends),
                        RequestKind::Timed => {}
                    }
                    state.buffer.push_back(Buffered {
                        tick,
                        message,
                        prefetched,
                    });
                    state.point.as_ref().and_then(Weak::upgrade)
                }
                _ => {
                    tracing::debug!(
                        %tick,
                        message_id = %message.id(),
                        "rejecting message for unknown or detached request",
                    );
                    sends.rejects.push(tick);
                    None
                }
            }
        };
        self.send(sends);
        if let Some(point) = point {
            point.messages_available();
        }
    }

    /// The serving node completed `tick` without a message.
    pub fn completed_received(&self, tick: Tick) {
        let mut sends = Sends::default();
        {
            let mut state = self.state.lock();
            let Some(request) = state.outstanding.remove(&tick) else {
                return;
            };
            match request.kind {
                RequestKind::Prefetch => state.prefetch.request_resolved(),
                RequestKind::Refill => self.refill_resolved(&mut state, &mut sends),
                RequestKind::Timed => {}
            }
        }
        self.send(sends);
    }

    // Caller holds the key lock.
    fn refill_resolved(&self, state: &mut KeyState, sends: &mut Sends) {
        state.refill = None;
        if let Some(timeout) = state.deferred_refill.take() {
            self.issue(state, RequestKind::Refill, timeout, sends);
        }
    }

    // Caller holds the key lock.
    fn issue(
        &self,
        state: &mut KeyState,
        kind: RequestKind,
        timeout: Option<Duration>,
        sends: &mut Sends,
    ) {
        let tick = self.ticks.next();
        state.outstanding.insert(
            tick,
            Outstanding {
                kind,
                issued: Instant::now(),
            },
        );
        match kind {
            RequestKind::Prefetch => state.prefetch.request_issued(),
            RequestKind::Refill => state.refill = Some(tick),
            RequestKind::Timed => {}
        }
        sends.gets.push(GetRequest {
            requester: self.options.requester,
            connection: self.options.connection,
            selector: self.options.selector.clone(),
            discriminator: self.options.discriminator.clone(),
            tick,
            timeout,
            refill: kind == RequestKind::Refill,
        });
    }

    fn send(&self, sends: Sends) {
        let node = self.options.node;
        let requester = self.options.requester;
        for request in sends.gets {
            let tick = request.tick;
            if let Err(err) = self.transport.get(node, request) {
                tracing::warn!(%node, %tick, error = %err, "remote get failed");
                self.completed_received(tick);
            }
        }
        for tick in sends.cancels {
            if let Err(err) = self.transport.cancel(node, requester, tick) {
                tracing::debug!(%node, %tick, error = %err, "remote cancel failed");
            }
        }
        if !sends.rejects.is_empty()
            && let Err(err) = self.transport.reject(node, requester, &sends.rejects)
        {
            tracing::warn!(
                %node,
                count = sends.rejects.len(),
                error = %err,
                "remote reject failed",
            );
        }
    }

    // Reachability is checked before every request; an unreachable node
    // detaches the key at once.
    fn check_reachable(&self) -> bool {
        if self.transport.is_reachable(self.options.node) {
            return true;
        }
        let point = {
            let mut state = self.state.lock();
            if state.detached {
                return false;
            }
            state.detached = true;
            state.ready = false;
            state.outstanding.clear();
            state.buffer.clear();
            state.refill = None;
            state.deferred_refill = None;
            state.prefetch.reset();
            state.point.as_ref().and_then(Weak::upgrade)
        };
        tracing::warn!(
            node = %self.options.node,
            requester = %self.options.requester,
            "remote node unreachable; detaching consumer",
        );
        if let Some(point) = point {
            point.notify_closed(DetachReason::Unreachable);
        }
        false
    }
}

impl ConsumableKey for RemoteQueueKey {
    fn connection_id(&self) -> ConnectionId {
        self.options.connection
    }

    fn consumer_set(&self) -> Option<Arc<ConsumerSet>> {
        self.options.consumer_set.clone()
    }

    fn bind_point(&self, point: Weak<dyn ConsumerPointHandle>) {
        self.state.lock().point = Some(point);
    }

    fn ready(&self) -> bool {
        if self
            .options
            .consumer_set
            .as_ref()
            .is_some_and(|set| set.is_consumer_set_suspended())
        {
            return false;
        }
        if !self.check_reachable() {
            return false;
        }
        let mut sends = Sends::default();
        {
            let mut state = self.state.lock();
            if state.detached {
                return false;
            }
            if !state.ready {
                state.ready = true;
                state.prefetch.ready(Instant::now());
            }
            if self.options.gathering {
                // A gathering key draws through one open-ended refill at a time.
                if state.refill.is_none() && state.buffer.is_empty() {
                    self.issue(&mut state, RequestKind::Refill, None, &mut sends);
                }
            } else if state.refill.is_none() {
                for _ in 0..state.prefetch.requests_to_issue() {
                    self.issue(&mut state, RequestKind::Prefetch, None, &mut sends);
                }
            }
        }
        self.send(sends);
        true
    }

    fn not_ready(&self) {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.ready) {
            state.prefetch.not_ready(Instant::now());
        }
    }

    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn get_next_message(&self) -> felix_dispatch::Result<Option<LockedMessage>> {
        let mut state = self.state.lock();
        if state.detached {
            return Ok(None);
        }
        let Some(buffered) = state.buffer.pop_front() else {
            return Ok(None);
        };
        if buffered.prefetched {
            state.prefetch.message_locked();
        }
        state.locked.insert(buffered.message.id(), buffered.tick);
        Ok(Some(LockedMessage::new(buffered.message, self.lock_id)))
    }

    // Remote keys are never on a local ready-list.
    fn try_lock(
        &self,
        _message: &Arc<StoredMessage>,
    ) -> felix_dispatch::Result<Option<LockedMessage>> {
        Ok(None)
    }

    fn release(&self, message: &LockedMessage, consumed: bool) -> felix_dispatch::Result<()> {
        let tick = self.state.lock().locked.remove(&message.id()).ok_or_else(|| {
            DispatchError::Usage(format!(
                "message {} is not locked by this remote consumer",
                message.id()
            ))
        })?;
        let node = self.options.node;
        let requester = self.options.requester;
        let sent = if consumed {
            self.transport.accept(node, requester, &[tick])
        } else {
            self.transport.reject(node, requester, &[tick])
        };
        sent.map_err(|err| match err {
            AnycastError::Dispatch(err) => err,
            AnycastError::Storage(err) => DispatchError::Storage(err),
            other => DispatchError::Storage(StorageError::Unavailable(other.to_string())),
        })
    }

    fn waiting(&self, timeout: Option<Duration>, refill: bool) {
        if !self.check_reachable() {
            return;
        }
        let mut sends = Sends::default();
        {
            let mut state = self.state.lock();
            if state.detached {
                return;
            }
            if refill || self.options.gathering {
                if state.refill.is_some() {
                    let deferred = match state.deferred_refill {
                        None => timeout,
                        Some(previous) => longest(previous, timeout),
                    };
                    state.deferred_refill = Some(deferred);
                } else {
                    self.issue(&mut state, RequestKind::Refill, timeout, &mut sends);
                }
            } else {
                self.issue(&mut state, RequestKind::Timed, timeout, &mut sends);
            }
        }
        self.send(sends);
    }

    fn detach(&self, reason: DetachReason) {
        let mut sends = Sends::default();
        {
            let mut state = self.state.lock();
            if std::mem::replace(&mut state.detached, true) {
                return;
            }
            state.ready = false;
            sends.cancels = state.outstanding.drain().map(|(tick, _)| tick).collect();
            sends.rejects = state.buffer.drain(..).map(|buffered| buffered.tick).collect();
            state.refill = None;
            state.deferred_refill = None;
            state.prefetch.reset();
        }
        tracing::debug!(
            requester = %self.options.requester,
            reason = ?reason,
            cancelled = sends.cancels.len(),
            rejected = sends.rejects.len(),
            "remote key detached",
        );
        sends.cancels.sort();
        self.send(sends);
    }
}

// None waits forever and so outlasts any finite wait.
fn longest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

impl fmt::Debug for RemoteQueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RemoteQueueKey")
            .field("node", &self.options.node)
            .field("requester", &self.options.requester)
            .field("ready", &state.ready)
            .field("detached", &state.detached)
            .field("buffered", &state.buffer.len())
            .field("outstanding", &state.outstanding.len())
            .finish_non_exhaustive()
    }
}
