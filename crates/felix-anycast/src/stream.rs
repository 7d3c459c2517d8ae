// Serving-side stream: remote consumer points for one destination.
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use felix_common::DispatchConfig;
use felix_dispatch::{
    AlarmService, ConsumableKey, ConsumerKey, ConsumerOptions, Destination, DetachReason,
};
use felix_storage::LockedMessage;

use crate::remote_point::{RemoteConsumerPoint, RemotePointParent};
use crate::tick::Tick;
use crate::transport::{GetRequest, ReplySink, RequesterId};
use crate::{AnycastError, Result};

// A message handed to a remote consumer, awaiting its accept or reject.
struct Delivered {
    message: LockedMessage,
    key: Arc<ConsumerKey>,
}

#[derive(Default)]
struct StreamState {
    points: HashMap<RequesterId, Arc<RemoteConsumerPoint>, ahash::RandomState>,
    delivered: HashMap<(RequesterId, Tick), Delivered, ahash::RandomState>,
    closed: bool,
}

/// Serves get requests from consumers on other nodes out of one local
/// destination. Replies go out through the `ReplySink` with no lock held.
pub struct AnycastStream {
    destination: Arc<Destination>,
    sink: Arc<dyn ReplySink>,
    alarms: AlarmService,
    idle_timeout: Duration,
    state: Mutex<StreamState>,
    self_ref: Weak<AnycastStream>,
}

impl AnycastStream {
    pub fn new(
        destination: Arc<Destination>,
        sink: Arc<dyn ReplySink>,
        alarms: AlarmService,
        config: &DispatchConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            destination,
            sink,
            alarms,
            idle_timeout: config.remote_idle_timeout(),
            state: Mutex::new(StreamState::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn destination(&self) -> &Arc<Destination> {
        &self.destination
    }

    pub fn point_count(&self) -> usize {
        self.state.lock().points.len()
    }

    pub fn point(&self, requester: RequesterId) -> Option<Arc<RemoteConsumerPoint>> {
        self.state.lock().points.get(&requester).cloned()
    }

    /// Messages delivered to remote consumers and not yet accepted or rejected.
    pub fn unresolved_count(&self) -> usize {
        self.state.lock().delivered.len()
    }

    /// Routes a get request to the requester's point, creating it on first need.
    pub fn process_request(&self, request: GetRequest) -> Result<()> {
        // A point may close on idle between lookup and use; retry once with a fresh one.
        for _ in 0..2 {
            let point = self.point_for(&request)?;
            match point.new_request(request.tick, request.timeout) {
                Err(AnycastError::Closed) => self.forget(request.requester, &point),
                outcome => return outcome,
            }
        }
        Err(AnycastError::Closed)
    }

    /// Returns false if the tick was unknown or already resolved.
    pub fn cancel_request(&self, requester: RequesterId, tick: Tick) -> bool {
        self.point(requester).is_some_and(|point| point.cancel(tick))
    }

    /// Consumes the messages delivered for `ticks`.
    pub fn accept(&self, requester: RequesterId, ticks: &[Tick]) -> Result<()> {
        self.resolve_delivered(requester, ticks, true)
    }

    /// Unlocks the messages delivered for `ticks` for redelivery.
    pub fn reject(&self, requester: RequesterId, ticks: &[Tick]) -> Result<()> {
        self.resolve_delivered(requester, ticks, false)
    }

    /// Closes every point and unlocks messages still awaiting a verdict.
    pub fn close(&self) {
        let (points, delivered): (Vec<Arc<RemoteConsumerPoint>>, Vec<Delivered>) = {
            let mut state = self.state.lock();
            state.closed = true;
            (
                state.points.drain().map(|(_, point)| point).collect(),
                state.delivered.drain().map(|(_, delivered)| delivered).collect(),
            )
        };
        for point in points {
            point.close(DetachReason::ApplicationClose);
        }
        for delivered in delivered {
            if let Err(err) = delivered.key.release(&delivered.message, false) {
                tracing::warn!(
                    message_id = %delivered.message.id(),
                    error = %err,
                    "unlocking unresolved delivery on close failed",
                );
            }
        }
    }

    fn point_for(&self, request: &GetRequest) -> Result<Arc<RemoteConsumerPoint>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AnycastError::Closed);
        }
        if let Some(point) = state.points.get(&request.requester) {
            return Ok(Arc::clone(point));
        }
        let mut options = ConsumerOptions::new(request.connection);
        options.selector = request.selector.clone();
        options.discriminator = request.discriminator.clone();
        let key = self.destination.attach(&options)?;
        let parent: Weak<dyn RemotePointParent> = self.self_ref.clone();
        let point = RemoteConsumerPoint::new(
            request.requester,
            key,
            parent,
            self.alarms.clone(),
            self.idle_timeout,
        );
        tracing::debug!(
            requester = %request.requester,
            destination = %self.destination.name(),
            "remote consumer point created",
        );
        state.points.insert(request.requester, Arc::clone(&point));
        Ok(point)
    }

    fn forget(&self, requester: RequesterId, point: &Arc<RemoteConsumerPoint>) {
        let mut state = self.state.lock();
        if state
            .points
            .get(&requester)
            .is_some_and(|existing| Arc::ptr_eq(existing, point))
        {
            state.points.remove(&requester);
        }
    }

    fn resolve_delivered(
        &self,
        requester: RequesterId,
        ticks: &[Tick],
        consumed: bool,
    ) -> Result<()> {
        let resolved: Vec<Delivered> = {
            let mut state = self.state.lock();
            ticks
                .iter()
                .filter_map(|tick| state.delivered.remove(&(requester, *tick)))
                .collect()
        };
        if resolved.len() != ticks.len() {
            tracing::debug!(
                %requester,
                requested = ticks.len(),
                found = resolved.len(),
                "some ticks had no delivered message",
            );
        }
        let mut first_error = None;
        for delivered in resolved {
            if let Err(err) = delivered.key.release(&delivered.message, consumed) {
                tracing::warn!(
                    message_id = %delivered.message.id(),
                    error = %err,
                    "resolving remote delivery failed",
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl RemotePointParent for AnycastStream {
    fn request_satisfied(
        &self,
        requester: RequesterId,
        tick: Tick,
        message: LockedMessage,
        key: &Arc<ConsumerKey>,
    ) {
        let payload = Arc::clone(message.message());
        let delivered = Delivered {
            message,
            key: Arc::clone(key),
        };
        self.state.lock().delivered.insert((requester, tick), delivered);
        self.sink.satisfied(requester, tick, payload);
    }

    fn request_expired(&self, requester: RequesterId, tick: Tick) {
        self.sink.expired(requester, tick);
    }

    fn point_closed(&self, requester: RequesterId, reason: DetachReason) {
        let mut state = self.state.lock();
        if state
            .points
            .get(&requester)
            .is_some_and(|point| point.is_closed())
        {
            state.points.remove(&requester);
        }
        tracing::debug!(%requester, reason = ?reason, "remote consumer point removed");
    }
}

impl fmt::Debug for AnycastStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AnycastStream")
            .field("destination", &self.destination.name())
            .field("points", &state.points.len())
            .field("delivered", &state.delivered.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use felix_common::ids::{ConnectionId, NodeId};
    use felix_dispatch::{DestinationOptions, Selector};
    use felix_storage::{ItemStream, Message, MessageStore, StoredMessage};

    #[derive(Default)]
    struct Sink {
        satisfied: Mutex<Vec<(RequesterId, Tick, Arc<StoredMessage>)>>,
        expired: Mutex<Vec<(RequesterId, Tick)>>,
    }

    impl ReplySink for Sink {
        fn satisfied(&self, requester: RequesterId, tick: Tick, message: Arc<StoredMessage>) {
            self.satisfied.lock().push((requester, tick, message));
        }

        fn expired(&self, requester: RequesterId, tick: Tick) {
            self.expired.lock().push((requester, tick));
        }
    }

    fn serving() -> (Arc<AnycastStream>, Arc<ItemStream>, Arc<Sink>) {
        let store = Arc::new(ItemStream::new());
        let destination = Destination::new("q", store.clone(), DestinationOptions::default());
        let sink = Arc::new(Sink::default());
        let config = DispatchConfig {
            remote_idle_timeout_ms: 200,
            ..DispatchConfig::default()
        };
        let stream = AnycastStream::new(
            destination,
            sink.clone(),
            AlarmService::current().expect("runtime"),
            &config,
        );
        (stream, store, sink)
    }

    fn get(requester: RequesterId, tick: u64) -> GetRequest {
        GetRequest {
            requester,
            connection: ConnectionId::new(),
            selector: None,
            discriminator: None,
            tick: Tick(tick),
            timeout: None,
            refill: false,
        }
    }

    fn requester(consumer: u64) -> RequesterId {
        RequesterId {
            node: NodeId::new(),
            consumer,
        }
    }

    fn msg() -> Message {
        Message::new(Bytes::from_static(b"m"))
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_delivery_is_consumed_and_rejected_is_redelivered() {
        let (stream, store, sink) = serving();
        let a = requester(1);
        let b = requester(2);
        stream.process_request(get(a, 1)).expect("request");
        stream.destination().put(msg()).expect("put");
        assert_eq!(sink.satisfied.lock().len(), 1);
        assert_eq!(stream.unresolved_count(), 1);

        stream.process_request(get(b, 1)).expect("request");
        stream.reject(a, &[Tick(1)]).expect("reject");
        {
            let satisfied = sink.satisfied.lock();
            assert_eq!(satisfied.len(), 2);
            assert_eq!(satisfied[1].0, b);
        }
        stream.accept(b, &[Tick(1)]).expect("accept");
        assert!(store.is_empty());
        assert_eq!(stream.unresolved_count(), 0);
        assert_eq!(stream.point_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn selector_travels_with_the_request() {
        let (stream, store, sink) = serving();
        let a = requester(1);
        let mut request = get(a, 1);
        request.selector = Some(Selector::equals("region", "eu"));
        stream.destination().put(msg().with_property("region", "us")).expect("put");
        stream.process_request(request).expect("request");
        assert!(sink.satisfied.lock().is_empty());
        stream
            .destination()
            .put(msg().with_property("region", "eu"))
            .expect("put");
        assert_eq!(sink.satisfied.lock()[0].2.id().0, 1);
        assert_eq!(store.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_points_are_forgotten_and_recreated() {
        let (stream, _store, sink) = serving();
        let a = requester(1);
        stream.process_request(get(a, 1)).expect("request");
        assert!(stream.cancel_request(a, Tick(1)));
        assert_eq!(*sink.expired.lock(), vec![(a, Tick(1))]);
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert_eq!(stream.point_count(), 0);
        assert_eq!(stream.destination().consumer_count(), 0);

        stream.process_request(get(a, 2)).expect("request");
        assert_eq!(stream.point_count(), 1);
        assert_eq!(stream.destination().consumer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_refuses_requests() {
        let (stream, _store, sink) = serving();
        let a = requester(1);
        stream.process_request(get(a, 1)).expect("request");
        stream.close();
        assert_eq!(*sink.expired.lock(), vec![(a, Tick(1))]);
        assert!(matches!(
            stream.process_request(get(a, 2)),
            Err(AnycastError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_unlocks_unresolved_deliveries() {
        let (stream, store, sink) = serving();
        let a = requester(1);
        stream.process_request(get(a, 1)).expect("request");
        stream.destination().put(msg()).expect("put");
        assert_eq!(sink.satisfied.lock().len(), 1);
        assert_eq!(store.available(), 0);

        stream.close();
        assert_eq!(stream.unresolved_count(), 0);
        assert_eq!(store.available(), 1);
        assert!(stream.accept(a, &[Tick(1)]).is_ok());
        assert_eq!(store.available(), 1);
    }
}
