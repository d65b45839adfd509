//! # Stowage Sync
//!
//! Remote persistence for Stowage entities.
//!
//! This crate provides:
//! - [`SyncQueue`]: per-entity FIFO lanes drained against a remote, with a
//!   global concurrency limit
//! - Retry with exponential backoff and a terminal error once attempts run
//!   out
//! - [`RemoteEndpoint`]: the save/query capability the queue depends on
//! - [`HttpEndpoint`]: a CBOR wire client over an abstract [`HttpClient`]
//! - [`MemoryEndpoint`]: an in-process backend with fault injection
//! - [`Client`]: the caller-facing save, sign-up and query API
//!
//! ## Key Invariants
//!
//! - At most one operation per entity is in flight
//! - Completions for one entity fire in submission order, exactly once
//! - Only `Pending` operations can be cancelled
//! - A save clears the dirty flag only if the entity was not changed while
//!   the save was in flight

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod http;
mod memory;
mod operation;
mod queue;
mod remote;
pub mod wire;

pub use client::Client;
pub use config::{EndpointConfig, RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpEndpoint, HttpRequest, LoopbackClient, LoopbackServer};
pub use memory::MemoryEndpoint;
pub use operation::{
    Completion, OperationHandle, OperationId, OperationKind, OperationState, PendingOperation,
    SaveReceipt, Transition,
};
pub use queue::{QueueStats, SyncQueue};
pub use remote::RemoteEndpoint;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
