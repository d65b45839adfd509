//! # Stowage Core
//!
//! Local object model for Stowage.
//!
//! This crate provides:
//! - A dynamically typed [`Value`] (text, numbers, arrays, references, files)
//! - [`Entity`]: a record of a named class with a local key and an optional
//!   remote id
//! - [`ObjectStore`]: keyed, versioned storage with dirty tracking and
//!   version-checked `mark_clean`
//! - [`Query`]: immutable filter/sort specifications
//!
//! ## Key Invariants
//!
//! - Every mutation bumps the entity version and marks it dirty
//! - `mark_clean` never clears a flag set by a newer mutation
//! - A remote object id never changes once assigned
//! - Entities leave the store only through an explicit `remove`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod id;
mod query;
mod store;
mod value;

pub use entity::{
    validate_class_name, validate_field_name, Entity, PASSWORD_FIELD, RESERVED_FIELDS,
    USERNAME_FIELD, USER_CLASS,
};
pub use error::{CoreError, CoreResult};
pub use id::{EntityKey, ObjectId, OBJECT_ID_LEN};
pub use query::{Comparator, Predicate, Query, SortDirection, SortOrder};
pub use store::{ObjectStore, StoreEvent, StoreObserver};
pub use value::{EntityRef, FileValue, Value};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
