//! Per-entity sync queue.
//!
//! Operations are grouped into lanes, one per entity key. Each lane is
//! drained by a single tokio task, so at most one operation per entity is
//! in flight and callbacks for an entity fire in submission order. Lanes for
//! different entities run concurrently, bounded by a semaphore sized from
//! [`SyncConfig::max_concurrency`]. A lane gives its permit back while it
//! waits out a retry delay.
//!
//! An operation moves through `Pending → InFlight → {Succeeded,
//! RetryScheduled → InFlight, Failed}` (or `Pending → Cancelled`). Every
//! transition is published on a broadcast channel; every operation's
//! completion is invoked exactly once.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stowage_core::{CoreError, EntityKey, ObjectStore, StoreEvent, StoreObserver};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::operation::{
    Completion, OperationId, OperationKind, OperationState, PendingOperation, SaveReceipt,
    Transition,
};
use crate::remote::RemoteEndpoint;

/// Counters for queue activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Operations accepted by `enqueue`.
    pub enqueued: u64,
    /// Operations that succeeded.
    pub succeeded: u64,
    /// Operations that failed permanently.
    pub failed: u64,
    /// Operations cancelled while pending.
    pub cancelled: u64,
    /// Retries scheduled after transient failures.
    pub retries: u64,
}

#[derive(Default)]
struct Lane {
    pending: VecDeque<PendingOperation>,
    in_flight: Option<OperationId>,
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<EntityKey, Lane>,
    operations: HashMap<OperationId, (EntityKey, OperationState)>,
    closed: bool,
}

/// Tracks which entities have unsaved changes, fed by the object store.
#[derive(Default)]
struct DirtyTracker {
    keys: Mutex<HashSet<EntityKey>>,
}

impl StoreObserver for DirtyTracker {
    fn on_event(&self, event: &StoreEvent) {
        let mut keys = self.keys.lock();
        match event {
            StoreEvent::Dirtied { key, .. } => {
                keys.insert(*key);
            }
            StoreEvent::Cleaned { key, .. } | StoreEvent::Removed { key } => {
                keys.remove(key);
            }
        }
    }
}

struct Inner<R: RemoteEndpoint> {
    config: SyncConfig,
    store: Arc<ObjectStore>,
    remote: Arc<R>,
    permits: Semaphore,
    state: Mutex<QueueState>,
    stats: Mutex<QueueStats>,
    events: broadcast::Sender<Transition>,
    idle: Notify,
    dirty: Arc<DirtyTracker>,
    next_id: AtomicU64,
}

/// Queue of saves and sign-ups, drained against a remote endpoint.
pub struct SyncQueue<R: RemoteEndpoint> {
    inner: Arc<Inner<R>>,
}

impl<R: RemoteEndpoint> Clone for SyncQueue<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteEndpoint> SyncQueue<R> {
    /// Creates a queue over the store and registers for its dirty
    /// notifications.
    pub fn new(config: SyncConfig, store: Arc<ObjectStore>, remote: Arc<R>) -> Self {
        let dirty = Arc::new(DirtyTracker::default());
        store.subscribe(dirty.clone());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(config.max_concurrency.max(1)),
                config,
                store,
                remote,
                state: Mutex::new(QueueState::default()),
                stats: Mutex::new(QueueStats::default()),
                events,
                idle: Notify::new(),
                dirty,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The store the queue saves from.
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.inner.store
    }

    /// Subscribes to operation state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.inner.events.subscribe()
    }

    /// Appends an operation to the entity's lane.
    ///
    /// If nothing is running for the entity, dispatch starts immediately on
    /// a new task. Errors detected here (unknown entity, invalid sign-up,
    /// closed queue, no runtime) are returned directly and the completion
    /// is dropped without being called.
    pub fn enqueue(
        &self,
        key: EntityKey,
        kind: OperationKind,
        completion: Completion,
    ) -> SyncResult<OperationId> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let entity = self.inner.store.get(key)?;
        if kind == OperationKind::SignUp {
            entity.validate_for_sign_up()?;
        }

        let id = OperationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let start_lane = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(SyncError::QueueClosed);
            }
            state.operations.insert(id, (key, OperationState::Pending));
            let start_lane = !state.lanes.contains_key(&key);
            state
                .lanes
                .entry(key)
                .or_default()
                .pending
                .push_back(PendingOperation::new(id, key, kind, completion));
            start_lane
        };
        self.inner.stats.lock().enqueued += 1;
        debug!(operation = %id, %key, %kind, "operation enqueued");

        if start_lane {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move { inner.drain_lane(key).await });
        }
        Ok(id)
    }

    /// Cancels an operation that has not been dispatched yet.
    ///
    /// The operation's completion is invoked with [`SyncError::Cancelled`].
    pub fn cancel(&self, id: OperationId) -> SyncResult<()> {
        let operation = {
            let mut state = self.inner.state.lock();
            let (key, current) = *state
                .operations
                .get(&id)
                .ok_or(SyncError::OperationNotFound(id))?;
            if current != OperationState::Pending {
                return Err(SyncError::NotCancellable(id));
            }
            let lane = state
                .lanes
                .get_mut(&key)
                .ok_or(SyncError::OperationNotFound(id))?;
            let position = lane
                .pending
                .iter()
                .position(|op| op.id == id)
                .ok_or(SyncError::OperationNotFound(id))?;
            let operation = lane
                .pending
                .remove(position)
                .ok_or(SyncError::OperationNotFound(id))?;
            state.operations.remove(&id);
            operation
        };

        self.inner.stats.lock().cancelled += 1;
        self.inner.publish(
            id,
            operation.key,
            OperationState::Pending,
            OperationState::Cancelled,
        );
        info!(operation = %id, key = %operation.key, "operation cancelled");
        operation.complete(Err(SyncError::Cancelled));
        Ok(())
    }

    /// Current state of a live operation; `None` once it has terminated.
    pub fn state_of(&self, id: OperationId) -> Option<OperationState> {
        self.inner
            .state
            .lock()
            .operations
            .get(&id)
            .map(|(_, state)| *state)
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner
            .state
            .lock()
            .lanes
            .values()
            .filter(|lane| lane.in_flight.is_some())
            .count()
    }

    /// Number of operations waiting to be dispatched.
    pub fn pending(&self) -> usize {
        self.inner
            .state
            .lock()
            .lanes
            .values()
            .map(|lane| lane.pending.len())
            .sum()
    }

    /// Returns true if the entity has queued or running operations.
    pub fn is_queued(&self, key: EntityKey) -> bool {
        self.inner.state.lock().lanes.contains_key(&key)
    }

    /// Entities the store has reported as dirty and not since cleaned.
    pub fn dirty_keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<_> = self.inner.dirty.keys.lock().iter().copied().collect();
        keys.sort();
        keys
    }

    /// Activity counters.
    pub fn stats(&self) -> QueueStats {
        self.inner.stats.lock().clone()
    }

    /// Waits until every lane has drained.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().lanes.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting operations and waits for queued ones to finish.
    pub async fn shutdown(&self) {
        self.inner.state.lock().closed = true;
        info!("sync queue closing");
        self.wait_idle().await;
    }
}

impl<R: RemoteEndpoint> Inner<R> {
    /// Runs the operations of one lane, in order, until it is empty.
    async fn drain_lane(self: Arc<Self>, key: EntityKey) {
        loop {
            let permit = self.acquire().await;
            let Some(mut operation) = self.next_operation(key) else {
                return;
            };

            let outcome = match permit {
                Ok(permit) => self.execute(&mut operation, permit).await,
                Err(err) => self.fail(&operation, err, 0),
            };

            {
                let mut state = self.state.lock();
                state.operations.remove(&operation.id);
                if let Some(lane) = state.lanes.get_mut(&key) {
                    lane.in_flight = None;
                }
            }
            operation.complete(outcome);
        }
    }

    /// Pops the next operation and marks it in flight, or retires the lane.
    fn next_operation(&self, key: EntityKey) -> Option<PendingOperation> {
        let operation = {
            let mut state = self.state.lock();
            let next = state
                .lanes
                .get_mut(&key)
                .and_then(|lane| lane.pending.pop_front());
            match next {
                Some(operation) => {
                    if let Some(lane) = state.lanes.get_mut(&key) {
                        lane.in_flight = Some(operation.id);
                    }
                    state
                        .operations
                        .insert(operation.id, (key, OperationState::InFlight));
                    operation
                }
                None => {
                    state.lanes.remove(&key);
                    if state.lanes.is_empty() {
                        self.idle.notify_waiters();
                    }
                    return None;
                }
            }
        };
        self.publish(
            operation.id,
            key,
            OperationState::Pending,
            OperationState::InFlight,
        );
        Some(operation)
    }

    /// The semaphore is never closed, so this only fails if that changes.
    async fn acquire(&self) -> SyncResult<SemaphorePermit<'_>> {
        self.permits.acquire().await.map_err(|_| SyncError::QueueClosed)
    }

    /// Sends the operation until it succeeds, fails permanently or runs out
    /// of attempts. The permit is released during retry delays.
    async fn execute(
        &self,
        operation: &mut PendingOperation,
        permit: SemaphorePermit<'_>,
    ) -> SyncResult<SaveReceipt> {
        let retry = &self.config.retry;
        let mut permit = Some(permit);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let sent = self
                .attempt(operation.id, operation.key, operation.kind, attempt)
                .await;
            match sent {
                Ok(receipt) => {
                    self.finish(operation, OperationState::Succeeded);
                    self.stats.lock().succeeded += 1;
                    info!(
                        operation = %operation.id,
                        key = %operation.key,
                        object_id = %receipt.object_id,
                        attempts = attempt,
                        "operation succeeded"
                    );
                    return Ok(receipt);
                }
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    operation.retries += 1;
                    self.stats.lock().retries += 1;
                    self.finish(operation, OperationState::RetryScheduled);

                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        operation = %operation.id,
                        key = %operation.key,
                        attempt,
                        ?delay,
                        error = %err,
                        "transient failure, retrying"
                    );
                    drop(permit.take());
                    tokio::time::sleep(delay).await;
                    let reacquired = self.acquire().await;

                    self.set_state(operation, OperationState::InFlight);
                    self.publish(
                        operation.id,
                        operation.key,
                        OperationState::RetryScheduled,
                        OperationState::InFlight,
                    );
                    match reacquired {
                        Ok(next) => permit = Some(next),
                        Err(err) => return self.fail(operation, err, attempt),
                    }
                }
                Err(err) => return self.fail(operation, err.exhausted(attempt), attempt),
            }
        }
    }

    /// Moves an in-flight operation to `Failed`.
    fn fail(
        &self,
        operation: &PendingOperation,
        err: SyncError,
        attempts: u32,
    ) -> SyncResult<SaveReceipt> {
        self.finish(operation, OperationState::Failed);
        self.stats.lock().failed += 1;
        warn!(
            operation = %operation.id,
            key = %operation.key,
            attempts,
            error = %err,
            "operation failed"
        );
        Err(err)
    }

    /// One round trip to the remote.
    async fn attempt(
        &self,
        id: OperationId,
        key: EntityKey,
        requested: OperationKind,
        attempt: u32,
    ) -> SyncResult<SaveReceipt> {
        let entity = self.store.get(key)?;
        let kind = requested.resolve(&entity);
        if kind == OperationKind::SignUp {
            entity.validate_for_sign_up()?;
        }
        let version = entity.version();
        debug!(operation = %id, %key, %kind, version, attempt, "dispatching");

        let object_id = self.remote.save(kind, &entity).await?;

        match self.store.assign_object_id(key, object_id.clone()) {
            Ok(()) | Err(CoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        let marked_clean = match self.store.mark_clean(key, version) {
            Ok(()) => true,
            Err(CoreError::VersionConflict { actual, .. }) => {
                debug!(
                    operation = %id,
                    %key,
                    saved = version,
                    current = actual,
                    "entity changed during save, left dirty"
                );
                false
            }
            Err(CoreError::NotFound { .. }) => false,
            Err(err) => return Err(err.into()),
        };

        Ok(SaveReceipt {
            operation: id,
            key,
            kind,
            object_id,
            version,
            attempts: attempt,
            marked_clean,
        })
    }

    /// Moves an in-flight operation to `to` and publishes the transition.
    fn finish(&self, operation: &PendingOperation, to: OperationState) {
        self.set_state(operation, to);
        self.publish(operation.id, operation.key, OperationState::InFlight, to);
    }

    fn set_state(&self, operation: &PendingOperation, to: OperationState) {
        if let Some(entry) = self.state.lock().operations.get_mut(&operation.id) {
            entry.1 = to;
        }
    }

    fn publish(&self, operation: OperationId, key: EntityKey, from: OperationState, to: OperationState) {
        debug_assert!(from.can_transition_to(to), "{from:?} -> {to:?}");
        // No subscribers is fine
        let _ = self.events.send(Transition {
            operation,
            key,
            from,
            to,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::memory::MemoryEndpoint;
    use crate::operation::OperationHandle;
    use std::time::Duration;
    use stowage_core::Entity;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false)
    }

    fn setup(config: SyncConfig) -> (Arc<ObjectStore>, Arc<MemoryEndpoint>, SyncQueue<MemoryEndpoint>) {
        let store = Arc::new(ObjectStore::new());
        let remote = Arc::new(MemoryEndpoint::new());
        let queue = SyncQueue::new(config, Arc::clone(&store), Arc::clone(&remote));
        (store, remote, queue)
    }

    fn put_food(store: &ObjectStore, name: &str) -> EntityKey {
        let mut food = Entity::new("Food").unwrap();
        food.set("name", name).unwrap();
        let key = food.key();
        store.put(food).unwrap();
        key
    }

    fn save(queue: &SyncQueue<MemoryEndpoint>, key: EntityKey) -> OperationHandle {
        let (completion, receiver) = OperationHandle::channel();
        let id = queue.enqueue(key, OperationKind::Create, completion).unwrap();
        OperationHandle::new(id, receiver)
    }

    fn drain(rx: &mut broadcast::Receiver<Transition>) -> Vec<Transition> {
        let mut transitions = Vec::new();
        while let Ok(transition) = rx.try_recv() {
            transitions.push(transition);
        }
        transitions
    }

    #[tokio::test]
    async fn successful_save_cleans_entity() {
        let (store, remote, queue) = setup(SyncConfig::new());
        let key = put_food(&store, "taco");

        let receipt = save(&queue, key).wait().await.unwrap();
        assert_eq!(receipt.kind, OperationKind::Create);
        assert_eq!(receipt.attempts, 1);
        assert!(receipt.marked_clean);

        let stored = store.get(key).unwrap();
        assert!(!stored.is_dirty());
        assert_eq!(stored.object_id(), Some(&receipt.object_id));
        assert_eq!(remote.object_count("Food"), 1);
        assert!(queue.dirty_keys().is_empty());
    }

    #[tokio::test]
    async fn enqueue_unknown_entity_is_not_found() {
        let (_store, _remote, queue) = setup(SyncConfig::new());
        let key = EntityKey::new();
        let (completion, _receiver) = OperationHandle::channel();

        let err = queue
            .enqueue(key, OperationKind::Create, completion)
            .unwrap_err();
        assert_eq!(err, SyncError::Core(CoreError::NotFound { key }));
        assert_eq!(queue.stats().enqueued, 0);
    }

    #[test]
    fn enqueue_without_runtime_fails() {
        let (store, _remote, queue) = setup(SyncConfig::new());
        let key = put_food(&store, "taco");
        let (completion, _receiver) = OperationHandle::channel();
        assert_eq!(
            queue.enqueue(key, OperationKind::Create, completion),
            Err(SyncError::NoRuntime)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds() {
        let config = SyncConfig::new().with_retry(fast_retry(5));
        let (store, remote, queue) = setup(config);
        let key = put_food(&store, "taco");
        remote.fail_next(2);

        let mut rx = queue.subscribe();
        let receipt = save(&queue, key).wait().await.unwrap();
        assert_eq!(receipt.attempts, 3);

        use OperationState::*;
        let path: Vec<_> = drain(&mut rx).into_iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![
                (Pending, InFlight),
                (InFlight, RetryScheduled),
                (RetryScheduled, InFlight),
                (InFlight, RetryScheduled),
                (RetryScheduled, InFlight),
                (InFlight, Succeeded),
            ]
        );
        assert_eq!(queue.stats().retries, 2);
        assert!(!store.get(key).unwrap().is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_terminally() {
        let config = SyncConfig::new().with_retry(fast_retry(3));
        let (store, remote, queue) = setup(config);
        let key = put_food(&store, "taco");
        remote.fail_next(10);

        let mut rx = queue.subscribe();
        let err = save(&queue, key).wait().await.unwrap_err();
        assert!(matches!(err, SyncError::TerminalRemote { attempts: 3, .. }));

        let transitions = drain(&mut rx);
        let retries = transitions
            .iter()
            .filter(|t| t.to == OperationState::RetryScheduled)
            .count();
        assert_eq!(retries, 2);
        assert_eq!(transitions.last().unwrap().to, OperationState::Failed);
        assert!(store.get(key).unwrap().is_dirty());
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let config = SyncConfig::new().with_retry(fast_retry(5));
        let (store, remote, queue) = setup(config);
        let key = put_food(&store, "taco");
        remote.reject_next("quota exceeded");

        let err = save(&queue, key).wait().await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
        assert_eq!(queue.stats().retries, 0);
        assert_eq!(remote.save_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_during_flight_keeps_entity_dirty() {
        let (store, remote, queue) = setup(SyncConfig::new());
        remote.set_latency(Duration::from_millis(50));
        let key = put_food(&store, "taco");

        let mut rx = queue.subscribe();
        let handle = save(&queue, key);
        loop {
            let transition = rx.recv().await.unwrap();
            if transition.to == OperationState::InFlight {
                break;
            }
        }
        let v2 = store.update(key, |e| e.set("spicy", true)).unwrap();

        let receipt = handle.wait().await.unwrap();
        assert_eq!(receipt.version, 1);
        assert!(!receipt.marked_clean);

        let stored = store.get(key).unwrap();
        assert!(stored.is_dirty());
        assert_eq!(stored.version(), v2);
        assert!(stored.is_saved());
        assert_eq!(queue.dirty_keys(), vec![key]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_entity_callbacks_fire_in_order() {
        let config = SyncConfig::new().with_max_concurrency(8);
        let (store, remote, queue) = setup(config);
        remote.set_latency(Duration::from_millis(5));
        let key = put_food(&store, "taco");

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut expected = Vec::new();
        for _ in 0..10 {
            let order = Arc::clone(&order);
            let id = queue
                .enqueue(
                    key,
                    OperationKind::Create,
                    Box::new(move |outcome| {
                        order.lock().push(outcome.unwrap().operation);
                    }),
                )
                .unwrap();
            expected.push(id);
        }

        queue.wait_idle().await;
        assert_eq!(*order.lock(), expected);
        assert_eq!(remote.peak_concurrent_saves(key), 1);
        // Only the first save created the object
        assert_eq!(remote.object_count("Food"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_only_while_pending() {
        let config = SyncConfig::new().with_max_concurrency(1);
        let (store, remote, queue) = setup(config);
        remote.set_latency(Duration::from_millis(20));
        let first = put_food(&store, "taco");
        let second = put_food(&store, "burrito");

        let mut rx = queue.subscribe();
        let running = save(&queue, first);
        let waiting = save(&queue, second);
        loop {
            let transition = rx.recv().await.unwrap();
            if transition.to == OperationState::InFlight {
                break;
            }
        }

        assert_eq!(queue.state_of(waiting.id()), Some(OperationState::Pending));
        assert_eq!(
            queue.cancel(running.id()),
            Err(SyncError::NotCancellable(running.id()))
        );
        queue.cancel(waiting.id()).unwrap();
        assert_eq!(
            queue.cancel(waiting.id()),
            Err(SyncError::OperationNotFound(waiting.id()))
        );

        assert_eq!(waiting.wait().await, Err(SyncError::Cancelled));
        assert!(running.wait().await.is_ok());
        assert!(store.get(second).unwrap().is_dirty());
        assert_eq!(queue.stats().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_is_respected() {
        let config = SyncConfig::new().with_max_concurrency(2);
        let (store, remote, queue) = setup(config);
        remote.set_latency(Duration::from_millis(10));

        let handles: Vec<_> = (0..6)
            .map(|i| save(&queue, put_food(&store, &format!("dish{i}"))))
            .collect();
        tokio::task::yield_now().await;
        assert!(queue.in_flight() <= 2);

        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert!(remote.peak_total_saves() <= 2);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_releases_the_concurrency_permit() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_jitter(false);
        let config = SyncConfig::new().with_max_concurrency(1).with_retry(retry);
        let (store, remote, queue) = setup(config);
        let failing = put_food(&store, "taco");
        let other = put_food(&store, "burrito");
        remote.fail_next(1);

        let mut rx = queue.subscribe();
        let retried = save(&queue, failing);
        loop {
            if rx.recv().await.unwrap().to == OperationState::RetryScheduled {
                break;
            }
        }

        let started = tokio::time::Instant::now();
        let receipt = save(&queue, other).wait().await.unwrap();
        assert_eq!(receipt.attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            queue.state_of(retried.id()),
            Some(OperationState::RetryScheduled)
        );

        assert_eq!(retried.wait().await.unwrap().attempts, 2);
        assert_eq!(remote.peak_total_saves(), 1);
    }

    /// Holds the store lock for a while on every clean.
    struct SlowCleaned {
        started: Mutex<std::sync::mpsc::Sender<()>>,
    }

    impl StoreObserver for SlowCleaned {
        fn on_event(&self, event: &StoreEvent) {
            if matches!(event, StoreEvent::Cleaned { .. }) {
                let _ = self.started.lock().send(());
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    #[test]
    fn dirty_tracking_survives_racing_clean() {
        let store = Arc::new(ObjectStore::new());
        let (started, cleaning) = std::sync::mpsc::channel();
        store.subscribe(Arc::new(SlowCleaned {
            started: Mutex::new(started),
        }));
        let queue = SyncQueue::new(
            SyncConfig::new(),
            Arc::clone(&store),
            Arc::new(MemoryEndpoint::new()),
        );
        let key = put_food(&store, "taco");

        let cleaner = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.mark_clean(key, 1))
        };
        cleaning.recv().unwrap();
        store.update(key, |e| e.set("spicy", true)).unwrap();
        cleaner.join().unwrap().unwrap();

        assert_eq!(queue.dirty_keys(), vec![key]);
        assert_eq!(queue.dirty_keys(), store.dirty_keys());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_operations() {
        let (store, _remote, queue) = setup(SyncConfig::new());
        let key = put_food(&store, "taco");
        save(&queue, key).wait().await.unwrap();

        queue.shutdown().await;
        let (completion, _receiver) = OperationHandle::channel();
        assert_eq!(
            queue.enqueue(key, OperationKind::Update, completion),
            Err(SyncError::QueueClosed)
        );
    }
}
