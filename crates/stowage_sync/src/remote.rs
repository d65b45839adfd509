//! Remote endpoint abstraction.

use async_trait::async_trait;
use std::sync::Arc;
use stowage_core::{Entity, ObjectId, Query};

use crate::error::SyncResult;
use crate::operation::OperationKind;

/// The persistence and query service the sync queue talks to.
///
/// The queue assumes at-least-once semantics: a save that fails with a
/// retryable error may have been applied and will be sent again.
/// Implementations report failures that might succeed on a later attempt
/// as [`SyncError::TransientRemote`](crate::SyncError::TransientRemote) or
/// [`SyncError::Timeout`](crate::SyncError::Timeout); anything else fails
/// the operation immediately.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync + 'static {
    /// Persists the entity and returns its remote id.
    ///
    /// For `Create` and `SignUp` the remote assigns a new id; for `Update`
    /// it must return the entity's existing id.
    async fn save(&self, kind: OperationKind, entity: &Entity) -> SyncResult<ObjectId>;

    /// Runs a query and returns matching entities, clean and carrying
    /// their remote ids.
    async fn query(&self, query: &Query) -> SyncResult<Vec<Entity>>;
}

#[async_trait]
impl<R: RemoteEndpoint + ?Sized> RemoteEndpoint for Arc<R> {
    async fn save(&self, kind: OperationKind, entity: &Entity) -> SyncResult<ObjectId> {
        (**self).save(kind, entity).await
    }

    async fn query(&self, query: &Query) -> SyncResult<Vec<Entity>> {
        (**self).query(query).await
    }
}
