//! Wire format shared by [`HttpEndpoint`](crate::HttpEndpoint) and servers
//! that speak to it.
//!
//! Request and response bodies are CBOR. Saves send a [`WireObject`];
//! queries send the [`Query`](stowage_core::Query) itself. Every response is
//! a [`WireResponse`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stowage_core::{Entity, ObjectId, Value};

use crate::error::{SyncError, SyncResult};

/// Header carrying the application id.
pub const APPLICATION_ID_HEADER: &str = "X-Application-Id";

/// Header carrying the client key.
pub const CLIENT_KEY_HEADER: &str = "X-Client-Key";

/// Content type of request and response bodies.
pub const CONTENT_TYPE: &str = "application/cbor";

/// Error codes carried in [`WireError`].
pub mod codes {
    /// The request body or route was malformed.
    pub const INVALID_REQUEST: u16 = 107;
    /// An update named an object the server does not have.
    pub const OBJECT_NOT_FOUND: u16 = 101;
    /// A field or class failed server-side validation.
    pub const VALIDATION_FAILED: u16 = 142;
    /// Sign-up with a username that is already registered.
    pub const USERNAME_TAKEN: u16 = 202;
    /// Missing or wrong credentials.
    pub const UNAUTHORIZED: u16 = 401;
    /// Unknown route.
    pub const NOT_FOUND: u16 = 404;
    /// The server is temporarily unable to handle the request.
    pub const UNAVAILABLE: u16 = 503;
}

/// An entity as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireObject {
    /// Class name.
    pub class_name: String,
    /// Remote id, absent for creates and sign-ups.
    pub object_id: Option<ObjectId>,
    /// Field values.
    pub fields: BTreeMap<String, Value>,
}

impl WireObject {
    /// Captures the fields and id of an entity.
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            class_name: entity.class_name().to_string(),
            object_id: entity.object_id().cloned(),
            fields: entity.fields().clone(),
        }
    }

    /// Rebuilds a clean entity; the object must carry an id.
    pub fn into_entity(self) -> SyncResult<Entity> {
        let object_id = self
            .object_id
            .ok_or_else(|| SyncError::Codec(format!("{} object without id", self.class_name)))?;
        Ok(Entity::from_remote(self.class_name, object_id, self.fields)?)
    }
}

/// An error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// One of [`codes`].
    pub code: u16,
    /// Human-readable message.
    pub message: String,
    /// Whether the client may retry.
    pub retryable: bool,
}

impl WireError {
    /// A permanent error.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    /// A temporary error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            code: codes::UNAVAILABLE,
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<WireError> for SyncError {
    fn from(err: WireError) -> Self {
        if err.retryable {
            SyncError::TransientRemote(format!("{} ({})", err.message, err.code))
        } else if err.code == codes::UNAUTHORIZED {
            SyncError::Unauthorized(err.message)
        } else {
            SyncError::Rejected(format!("{} ({})", err.message, err.code))
        }
    }
}

/// Body of every server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireResponse {
    /// A save succeeded.
    Saved {
        /// Id of the saved object.
        object_id: ObjectId,
    },
    /// Query results.
    Objects(Vec<WireObject>),
    /// The request failed.
    Error(WireError),
}

/// Encodes a value as CBOR.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> SyncResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| SyncError::Codec(format!("failed to encode: {e}")))?;
    Ok(bytes)
}

/// Decodes a value from CBOR.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::Codec(format!("failed to decode: {e}")))
}
