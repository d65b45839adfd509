//! Pending operations and their state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use stowage_core::{Entity, EntityKey, ObjectId};
use tokio::sync::oneshot;

use crate::error::{SyncError, SyncResult};

/// Identifier of a queued operation, unique within one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(pub(crate) u64);

impl OperationId {
    /// The numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// What an operation asks the remote to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// First save of an entity; the remote assigns its id.
    Create,
    /// Save of an entity that already has a remote id.
    Update,
    /// Registration of a user entity.
    SignUp,
}

impl OperationKind {
    /// The kind for saving `entity` as it is now.
    pub fn for_save(entity: &Entity) -> Self {
        if entity.is_saved() {
            OperationKind::Update
        } else {
            OperationKind::Create
        }
    }

    /// Resolves the kind at dispatch time.
    ///
    /// A `Create` queued behind another save of the same entity is sent as
    /// an `Update` once the earlier save has assigned the id.
    pub fn resolve(self, entity: &Entity) -> Self {
        match self {
            OperationKind::Create if entity.is_saved() => OperationKind::Update,
            kind => kind,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::SignUp => "sign-up",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of an operation.
///
/// ```text
/// Pending ──> InFlight ──> Succeeded
///    │           │  ▲
///    │           │  └── RetryScheduled <─┐
///    │           ├───────────────────────┘
///    │           └──> Failed
///    └──> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Queued, not yet dispatched.
    Pending,
    /// Waiting on the remote.
    InFlight,
    /// A transient failure occurred; waiting out the backoff delay.
    RetryScheduled,
    /// The remote accepted the operation.
    Succeeded,
    /// The operation failed permanently.
    Failed,
    /// The operation was cancelled while pending.
    Cancelled,
}

impl OperationState {
    /// Returns true for states an operation never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Cancelled)
                | (InFlight, Succeeded)
                | (InFlight, RetryScheduled)
                | (InFlight, Failed)
                | (RetryScheduled, InFlight)
        )
    }
}

/// A state change, published on the queue's transition channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// The operation.
    pub operation: OperationId,
    /// The entity it targets.
    pub key: EntityKey,
    /// Previous state.
    pub from: OperationState,
    /// New state.
    pub to: OperationState,
}

/// What a successful save reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    /// The operation.
    pub operation: OperationId,
    /// The entity that was saved.
    pub key: EntityKey,
    /// Kind sent to the remote.
    pub kind: OperationKind,
    /// Remote id of the entity.
    pub object_id: ObjectId,
    /// Version of the entity that was sent.
    pub version: u64,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Whether the entity was marked clean. False when it was changed (or
    /// removed) while the save was in flight.
    pub marked_clean: bool,
}

/// Callback invoked exactly once when an operation terminates.
pub type Completion = Box<dyn FnOnce(SyncResult<SaveReceipt>) + Send + 'static>;

/// A queued save or sign-up.
///
/// The operation refers to its entity by key; the object store owns the
/// entity and the operation snapshots it when it is dispatched.
pub struct PendingOperation {
    pub(crate) id: OperationId,
    pub(crate) key: EntityKey,
    pub(crate) kind: OperationKind,
    pub(crate) retries: u32,
    pub(crate) completion: Completion,
}

impl PendingOperation {
    pub(crate) fn new(
        id: OperationId,
        key: EntityKey,
        kind: OperationKind,
        completion: Completion,
    ) -> Self {
        Self {
            id,
            key,
            kind,
            retries: 0,
            completion,
        }
    }

    /// The operation id.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// The target entity.
    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// The requested kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Consumes the operation and reports its outcome.
    pub(crate) fn complete(self, outcome: SyncResult<SaveReceipt>) {
        (self.completion)(outcome);
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

/// Future-style access to an operation's outcome.
#[derive(Debug)]
pub struct OperationHandle {
    id: OperationId,
    receiver: oneshot::Receiver<SyncResult<SaveReceipt>>,
}

impl OperationHandle {
    /// Creates a handle and the completion that resolves it.
    pub(crate) fn channel() -> (Completion, oneshot::Receiver<SyncResult<SaveReceipt>>) {
        let (sender, receiver) = oneshot::channel();
        let completion: Completion = Box::new(move |outcome| {
            // The caller may have dropped the handle
            let _ = sender.send(outcome);
        });
        (completion, receiver)
    }

    pub(crate) fn new(
        id: OperationId,
        receiver: oneshot::Receiver<SyncResult<SaveReceipt>>,
    ) -> Self {
        Self { id, receiver }
    }

    /// The operation id, for cancellation.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Waits for the operation to terminate.
    pub async fn wait(self) -> SyncResult<SaveReceipt> {
        self.receiver.await.unwrap_or(Err(SyncError::QueueClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        use OperationState::*;

        assert!(Pending.can_transition_to(InFlight));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(InFlight.can_transition_to(RetryScheduled));
        assert!(RetryScheduled.can_transition_to(InFlight));
        assert!(InFlight.can_transition_to(Succeeded));
        assert!(InFlight.can_transition_to(Failed));

        assert!(!InFlight.can_transition_to(Cancelled));
        assert!(!RetryScheduled.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(InFlight));
        assert!(!Failed.can_transition_to(RetryScheduled));
    }

    #[test]
    fn terminal_states() {
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(OperationState::Cancelled.is_terminal());
        assert!(!OperationState::Pending.is_terminal());
        assert!(!OperationState::RetryScheduled.is_terminal());
    }

    #[test]
    fn kind_resolution() {
        let mut entity = Entity::new("Food").unwrap();
        assert_eq!(OperationKind::for_save(&entity), OperationKind::Create);
        assert_eq!(OperationKind::Create.resolve(&entity), OperationKind::Create);

        entity = Entity::from_remote(
            "Food",
            ObjectId::parse("abc").unwrap(),
            Default::default(),
        )
        .unwrap();
        assert_eq!(OperationKind::for_save(&entity), OperationKind::Update);
        assert_eq!(OperationKind::Create.resolve(&entity), OperationKind::Update);
        assert_eq!(OperationKind::SignUp.resolve(&entity), OperationKind::SignUp);
    }

    #[test]
    fn operation_id_display() {
        assert_eq!(OperationId(7).to_string(), "op-7");
    }

    #[tokio::test]
    async fn dropped_completion_reports_closed() {
        let (completion, receiver) = OperationHandle::channel();
        let handle = OperationHandle::new(OperationId(1), receiver);
        drop(completion);
        assert_eq!(handle.wait().await, Err(SyncError::QueueClosed));
    }
}
