//! Entities: versioned records of a named class.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::id::{EntityKey, ObjectId};
use crate::value::{EntityRef, Value};

/// Class name used for user accounts.
pub const USER_CLASS: &str = "_User";

/// Field holding a user's login name.
pub const USERNAME_FIELD: &str = "username";

/// Field holding a user's password.
pub const PASSWORD_FIELD: &str = "password";

/// Field names managed by the remote endpoint.
pub const RESERVED_FIELDS: [&str; 3] = ["objectId", "createdAt", "updatedAt"];

/// A locally held record destined for remote persistence.
///
/// An entity belongs to a class (`Food`, `Furniture`, `_User`, ...) and
/// holds dynamically typed fields. The object store tracks its version and
/// dirty flag; a freshly created entity is version 0 and clean until it is
/// put into a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    key: EntityKey,
    class_name: String,
    object_id: Option<ObjectId>,
    fields: BTreeMap<String, Value>,
    version: u64,
    dirty: bool,
}

impl Entity {
    /// Creates an empty entity of the given class.
    pub fn new(class_name: impl Into<String>) -> CoreResult<Self> {
        let class_name = class_name.into();
        validate_class_name(&class_name)?;
        Ok(Self {
            key: EntityKey::new(),
            class_name,
            object_id: None,
            fields: BTreeMap::new(),
            version: 0,
            dirty: false,
        })
    }

    /// Creates a user entity with the given credentials.
    pub fn new_user(username: impl Into<String>, password: impl Into<String>) -> CoreResult<Self> {
        let mut user = Self::new(USER_CLASS)?;
        user.set(USERNAME_FIELD, username.into())?;
        user.set(PASSWORD_FIELD, password.into())?;
        Ok(user)
    }

    /// Rebuilds an entity that was returned by the remote endpoint.
    ///
    /// The result is clean and carries its remote id.
    pub fn from_remote(
        class_name: impl Into<String>,
        object_id: ObjectId,
        fields: BTreeMap<String, Value>,
    ) -> CoreResult<Self> {
        let mut entity = Self::new(class_name)?;
        for (name, value) in fields {
            entity.set(name, value)?;
        }
        entity.object_id = Some(object_id);
        Ok(entity)
    }

    /// The local key.
    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// The class this entity belongs to.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The remote id, once assigned.
    pub fn object_id(&self) -> Option<&ObjectId> {
        self.object_id.as_ref()
    }

    /// The identifier to show for this entity: the remote id once it is
    /// assigned, a `local:` placeholder before that.
    pub fn id(&self) -> String {
        match &self.object_id {
            Some(id) => id.to_string(),
            None => self.key.placeholder(),
        }
    }

    /// Returns true once the remote endpoint has assigned an id.
    pub fn is_saved(&self) -> bool {
        self.object_id.is_some()
    }

    /// Returns true for entities of the user class.
    pub fn is_user(&self) -> bool {
        self.class_name == USER_CLASS
    }

    /// The version assigned by the object store.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether the entity has local changes not yet confirmed persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Reads a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Reads a text field.
    pub fn get_text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_text)
    }

    /// Sets a field after validating its name and value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> CoreResult<()> {
        let field = field.into();
        validate_field_name(&field)?;
        let value = value.into();
        value.validate(&field)?;
        self.fields.insert(field, value);
        Ok(())
    }

    /// Removes a field, returning its previous value.
    pub fn unset(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// All fields, ordered by name.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Builds a reference to this entity for use in another entity's field.
    ///
    /// Only saved entities can be referenced.
    pub fn to_reference(&self) -> CoreResult<EntityRef> {
        match &self.object_id {
            Some(object_id) => Ok(EntityRef {
                class_name: self.class_name.clone(),
                object_id: object_id.clone(),
            }),
            None => Err(CoreError::validation(
                "reference",
                format!("{} {} has not been saved", self.class_name, self.id()),
            )),
        }
    }

    /// Checks the user-specific requirements for signing up.
    pub fn validate_for_sign_up(&self) -> CoreResult<()> {
        if !self.is_user() {
            return Err(CoreError::validation(
                "className",
                format!("only {USER_CLASS} entities can sign up, got {}", self.class_name),
            ));
        }
        for field in [USERNAME_FIELD, PASSWORD_FIELD] {
            match self.get_text(field) {
                Some(text) if !text.is_empty() => {}
                Some(_) => return Err(CoreError::validation(field, "must not be empty")),
                None => return Err(CoreError::validation(field, "is required")),
            }
        }
        Ok(())
    }

    pub(crate) fn set_object_id(&mut self, object_id: ObjectId) {
        self.object_id = Some(object_id);
    }

    pub(crate) fn set_state(&mut self, version: u64, dirty: bool) {
        self.version = version;
        self.dirty = dirty;
    }
}

/// Checks a class name.
///
/// Class names start with an ASCII letter (or the underscore of the
/// built-in `_User` class) and contain only letters, digits and
/// underscores.
pub fn validate_class_name(name: &str) -> CoreResult<()> {
    if name == USER_CLASS {
        return Ok(());
    }
    let mut chars = name.chars();
    match chars.next() {
        None => Err(CoreError::validation("className", "must not be empty")),
        Some(first) if !first.is_ascii_alphabetic() => Err(CoreError::validation(
            "className",
            format!("{name:?} must start with a letter"),
        )),
        Some(_) if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') => Err(
            CoreError::validation("className", format!("{name:?} has invalid characters")),
        ),
        Some(_) => Ok(()),
    }
}

/// Checks a field name.
pub fn validate_field_name(name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::validation("field", "name must not be empty"));
    }
    if name.starts_with('_') {
        return Err(CoreError::validation(
            name,
            "names starting with '_' are reserved",
        ));
    }
    if RESERVED_FIELDS.contains(&name) {
        return Err(CoreError::validation(name, "is managed by the remote"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CoreError::validation(name, "has invalid characters"));
    }
    Ok(())
}
