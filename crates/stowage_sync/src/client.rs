//! Caller-facing API.
//!
//! [`Client`] ties an [`ObjectStore`] to a [`SyncQueue`] and a
//! [`RemoteEndpoint`]. Saving copies the caller's entity into the store and
//! queues an operation for it; the returned [`OperationHandle`] (or the
//! callback) reports the outcome.
//!
//! ```no_run
//! # async fn tutorial() -> stowage_sync::SyncResult<()> {
//! use stowage_sync::{Client, MemoryEndpoint, SyncConfig};
//!
//! let client = Client::new(SyncConfig::default(), MemoryEndpoint::new());
//! let mut taco = client.create_entity("Food")?;
//! taco.set("name", "taco")?;
//! let receipt = client.save(&taco)?.wait().await?;
//! println!("saved {}", receipt.object_id);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use stowage_core::{CoreError, CoreResult, Entity, EntityKey, ObjectStore, Query, USER_CLASS};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::operation::{Completion, OperationHandle, OperationId, OperationKind, SaveReceipt};
use crate::queue::SyncQueue;
use crate::remote::RemoteEndpoint;

/// Entry point for creating, saving and querying entities.
pub struct Client<R: RemoteEndpoint> {
    store: Arc<ObjectStore>,
    remote: Arc<R>,
    queue: SyncQueue<R>,
}

impl<R: RemoteEndpoint> Clone for Client<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            remote: Arc::clone(&self.remote),
            queue: self.queue.clone(),
        }
    }
}

impl<R: RemoteEndpoint> Client<R> {
    /// Creates a client with a fresh store.
    pub fn new(config: SyncConfig, remote: R) -> Self {
        Self::with_store(config, Arc::new(ObjectStore::new()), Arc::new(remote))
    }

    /// Creates a client over an existing store and shared endpoint.
    pub fn with_store(config: SyncConfig, store: Arc<ObjectStore>, remote: Arc<R>) -> Self {
        let queue = SyncQueue::new(config, Arc::clone(&store), Arc::clone(&remote));
        Self {
            store,
            remote,
            queue,
        }
    }

    /// Creates an unsaved entity of the given class.
    pub fn create_entity(&self, class_name: &str) -> CoreResult<Entity> {
        Entity::new(class_name)
    }

    /// Creates an unsaved user with the given credentials.
    pub fn create_user(&self, username: &str, password: &str) -> CoreResult<Entity> {
        Entity::new_user(username, password)
    }

    /// Stores the entity and queues a save for it.
    ///
    /// The store keeps its own copy; later changes to `entity` are not seen
    /// until it is saved again. Users must [`sign_up`](Self::sign_up)
    /// before they can be saved.
    pub fn save(&self, entity: &Entity) -> SyncResult<OperationHandle> {
        let (completion, receiver) = OperationHandle::channel();
        let id = self.save_with_callback(entity, completion)?;
        Ok(OperationHandle::new(id, receiver))
    }

    /// Like [`save`](Self::save), reporting the outcome to `callback`.
    pub fn save_with_callback<F>(&self, entity: &Entity, callback: F) -> SyncResult<OperationId>
    where
        F: FnOnce(SyncResult<SaveReceipt>) + Send + 'static,
    {
        if entity.is_user() && !entity.is_saved() {
            return Err(CoreError::validation(
                "className",
                format!("{USER_CLASS} entities must sign up before they are saved"),
            )
            .into());
        }
        self.store.put(entity.clone())?;
        self.enqueue_save(entity.key(), Box::new(callback))
    }

    /// Queues a save of an entity already in the store.
    pub fn save_by_key(&self, key: EntityKey) -> SyncResult<OperationHandle> {
        let (completion, receiver) = OperationHandle::channel();
        let id = self.enqueue_save(key, completion)?;
        Ok(OperationHandle::new(id, receiver))
    }

    fn enqueue_save(&self, key: EntityKey, completion: Completion) -> SyncResult<OperationId> {
        let stored = self.store.get(key)?;
        self.queue
            .enqueue(key, OperationKind::for_save(&stored), completion)
    }

    /// Stores the user and queues its registration.
    pub fn sign_up(&self, user: &Entity) -> SyncResult<OperationHandle> {
        let (completion, receiver) = OperationHandle::channel();
        let id = self.sign_up_with_callback(user, completion)?;
        Ok(OperationHandle::new(id, receiver))
    }

    /// Like [`sign_up`](Self::sign_up), reporting the outcome to `callback`.
    pub fn sign_up_with_callback<F>(&self, user: &Entity, callback: F) -> SyncResult<OperationId>
    where
        F: FnOnce(SyncResult<SaveReceipt>) + Send + 'static,
    {
        user.validate_for_sign_up()?;
        if user.is_saved() {
            return Err(CoreError::validation("objectId", "user has already signed up").into());
        }
        self.store.put(user.clone())?;
        self.queue
            .enqueue(user.key(), OperationKind::SignUp, Box::new(callback))
    }

    /// Runs a query against the remote, retrying transient failures.
    ///
    /// Results are returned to the caller only; the store is not touched.
    pub async fn query(&self, query: &Query) -> SyncResult<Vec<Entity>> {
        run_query(self.remote.as_ref(), &self.queue.config().retry, query).await
    }

    /// Runs a query on a new task and passes the outcome to `callback`.
    pub fn query_with_callback<F>(&self, query: Query, callback: F) -> SyncResult<()>
    where
        F: FnOnce(SyncResult<Vec<Entity>>) + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let remote = Arc::clone(&self.remote);
        let retry = self.queue.config().retry.clone();
        runtime.spawn(async move {
            let outcome = run_query(remote.as_ref(), &retry, &query).await;
            callback(outcome);
        });
        Ok(())
    }

    /// Queues saves for every dirty entity that has nothing queued.
    ///
    /// Users that have not signed up are skipped.
    pub fn flush(&self) -> SyncResult<Vec<OperationHandle>> {
        let mut handles = Vec::new();
        for key in self.store.dirty_keys() {
            if self.queue.is_queued(key) {
                continue;
            }
            let entity = match self.store.get(key) {
                Ok(entity) => entity,
                Err(CoreError::NotFound { .. }) => continue,
                Err(err) => return Err(err.into()),
            };
            if entity.is_user() && !entity.is_saved() {
                debug!(%key, "skipping user that has not signed up");
                continue;
            }
            handles.push(self.save_by_key(key)?);
        }
        Ok(handles)
    }

    /// Cancels an operation that has not been dispatched.
    pub fn cancel(&self, id: OperationId) -> SyncResult<()> {
        self.queue.cancel(id)
    }

    /// Stops accepting saves and waits for queued ones to finish.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// The local store.
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// The sync queue.
    pub fn queue(&self) -> &SyncQueue<R> {
        &self.queue
    }

    /// The remote endpoint.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }
}

async fn run_query<R: RemoteEndpoint + ?Sized>(
    remote: &R,
    retry: &RetryConfig,
    query: &Query,
) -> SyncResult<Vec<Entity>> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match remote.query(query).await {
            Ok(results) => {
                debug!(class = query.class_name(), results = results.len(), attempt, "query done");
                return Ok(results);
            }
            Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(class = query.class_name(), attempt, ?delay, error = %err, "query failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err.exhausted(attempt)),
        }
    }
}
