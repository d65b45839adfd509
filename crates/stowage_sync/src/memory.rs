//! In-memory remote endpoint.
//!
//! [`MemoryEndpoint`] keeps objects in per-class maps and answers saves,
//! sign-ups and queries the way a hosted backend would. It can be used
//! directly as a [`RemoteEndpoint`] or served over the wire format through
//! [`LoopbackServer`], and it can inject faults and latency for tests.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use stowage_core::{
    validate_class_name, Entity, EntityKey, ObjectId, Query, Value, PASSWORD_FIELD,
    USERNAME_FIELD, USER_CLASS,
};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::http::{HttpRequest, LoopbackServer};
use crate::operation::OperationKind;
use crate::remote::RemoteEndpoint;
use crate::wire::{
    self, codes, WireError, WireObject, WireResponse, APPLICATION_ID_HEADER, CLIENT_KEY_HEADER,
};

type Fields = BTreeMap<String, Value>;

enum Fault {
    Transient,
    Reject(String),
}

#[derive(Default)]
struct Concurrency {
    /// Saves running per entity; entries are dropped at zero.
    running: HashMap<EntityKey, usize>,
    /// Peak per entity, one entry for every entity ever saved.
    peaks: HashMap<EntityKey, usize>,
    total: usize,
    peak_total: usize,
}

/// A remote endpoint backed by memory.
#[derive(Default)]
pub struct MemoryEndpoint {
    classes: RwLock<HashMap<String, BTreeMap<ObjectId, Fields>>>,
    credentials: Option<(String, String)>,
    faults: Mutex<VecDeque<Fault>>,
    latency: Mutex<Duration>,
    concurrency: Mutex<Concurrency>,
    save_calls: AtomicU64,
    query_calls: AtomicU64,
}

impl MemoryEndpoint {
    /// Creates an empty endpoint that accepts any credentials.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires these credentials on wire requests.
    pub fn with_credentials(
        mut self,
        application_id: impl Into<String>,
        client_key: impl Into<String>,
    ) -> Self {
        self.credentials = Some((application_id.into(), client_key.into()));
        self
    }

    /// Fails the next `count` saves or queries with a transient error.
    pub fn fail_next(&self, count: u32) {
        let mut faults = self.faults.lock();
        for _ in 0..count {
            faults.push_back(Fault::Transient);
        }
    }

    /// Rejects the next save or query with a permanent error.
    pub fn reject_next(&self, message: impl Into<String>) {
        self.faults.lock().push_back(Fault::Reject(message.into()));
    }

    /// Delays every direct save and query.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of stored objects of a class.
    pub fn object_count(&self, class_name: &str) -> usize {
        self.classes
            .read()
            .get(class_name)
            .map_or(0, BTreeMap::len)
    }

    /// Fields of a stored object.
    pub fn get_object(&self, class_name: &str, object_id: &ObjectId) -> Option<Fields> {
        self.classes
            .read()
            .get(class_name)
            .and_then(|objects| objects.get(object_id))
            .cloned()
    }

    /// Saves received, including failed ones.
    pub fn save_calls(&self) -> u64 {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Queries received.
    pub fn query_calls(&self) -> u64 {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Highest number of saves of one entity seen running at once.
    ///
    /// Peaks are kept for every entity this endpoint has seen, so the
    /// record grows with the number of distinct entities saved.
    pub fn peak_concurrent_saves(&self, key: EntityKey) -> usize {
        self.concurrency.lock().peaks.get(&key).copied().unwrap_or(0)
    }

    /// Highest number of saves seen running at once.
    pub fn peak_total_saves(&self) -> usize {
        self.concurrency.lock().peak_total
    }

    fn take_fault(&self) -> Option<WireError> {
        self.faults.lock().pop_front().map(|fault| match fault {
            Fault::Transient => WireError::unavailable("injected failure"),
            Fault::Reject(message) => WireError::new(codes::VALIDATION_FAILED, message),
        })
    }

    fn begin_save(&self, key: EntityKey) -> SaveGuard<'_> {
        let mut concurrency = self.concurrency.lock();
        let running = {
            let running = concurrency.running.entry(key).or_default();
            *running += 1;
            *running
        };
        let peak = concurrency.peaks.entry(key).or_default();
        *peak = (*peak).max(running);
        concurrency.total += 1;
        concurrency.peak_total = concurrency.peak_total.max(concurrency.total);
        SaveGuard {
            endpoint: self,
            key,
        }
    }

    /// Applies a save and returns the object's id.
    fn apply_save(&self, kind: OperationKind, object: WireObject) -> Result<ObjectId, WireError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        validate_class_name(&object.class_name)
            .map_err(|e| WireError::new(codes::VALIDATION_FAILED, e.to_string()))?;
        for (field, value) in &object.fields {
            value
                .validate(field)
                .map_err(|e| WireError::new(codes::VALIDATION_FAILED, e.to_string()))?;
        }

        let mut classes = self.classes.write();
        match kind {
            OperationKind::Create => {
                if is_user_class(&object.class_name) {
                    return Err(WireError::new(
                        codes::INVALID_REQUEST,
                        "users are created by signing up",
                    ));
                }
                let objects = classes.entry(object.class_name).or_default();
                let id = unused_id(objects);
                objects.insert(id.clone(), object.fields);
                debug!(object_id = %id, "object created");
                Ok(id)
            }
            OperationKind::Update => {
                let id = object
                    .object_id
                    .ok_or_else(|| WireError::new(codes::INVALID_REQUEST, "update without id"))?;
                let objects = classes.entry(object.class_name.clone()).or_default();
                if !objects.contains_key(&id) {
                    return Err(WireError::new(
                        codes::OBJECT_NOT_FOUND,
                        format!("no {} object {id}", object.class_name),
                    ));
                }
                if is_user_class(&object.class_name) {
                    check_username_free(objects, &object.fields, Some(&id))?;
                }
                objects.insert(id.clone(), object.fields);
                debug!(object_id = %id, "object updated");
                Ok(id)
            }
            OperationKind::SignUp => {
                if !is_user_class(&object.class_name) {
                    return Err(WireError::new(
                        codes::INVALID_REQUEST,
                        format!("cannot sign up a {} object", object.class_name),
                    ));
                }
                for field in [USERNAME_FIELD, PASSWORD_FIELD] {
                    let present = object
                        .fields
                        .get(field)
                        .and_then(Value::as_text)
                        .is_some_and(|text| !text.is_empty());
                    if !present {
                        return Err(WireError::new(
                            codes::VALIDATION_FAILED,
                            format!("{field} is required"),
                        ));
                    }
                }
                let users = classes.entry(USER_CLASS.to_string()).or_default();
                check_username_free(users, &object.fields, None)?;
                let id = unused_id(users);
                users.insert(id.clone(), object.fields);
                debug!(object_id = %id, "user signed up");
                Ok(id)
            }
        }
    }

    /// Runs a query against the stored objects. Passwords are never
    /// returned.
    fn run_query(&self, query: &Query) -> Result<Vec<Entity>, WireError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let candidates = {
            let classes = self.classes.read();
            let Some(objects) = classes.get(query.class_name()) else {
                return Ok(Vec::new());
            };
            objects
                .iter()
                .map(|(id, fields)| {
                    let mut fields = fields.clone();
                    fields.remove(PASSWORD_FIELD);
                    Entity::from_remote(query.class_name(), id.clone(), fields)
                        .map_err(|e| WireError::new(codes::VALIDATION_FAILED, e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(query.evaluate(candidates))
    }

    fn authorize(&self, request: &HttpRequest) -> Result<(), WireError> {
        let Some((application_id, client_key)) = &self.credentials else {
            return Ok(());
        };
        let accepted = request.header(APPLICATION_ID_HEADER) == Some(application_id.as_str())
            && request.header(CLIENT_KEY_HEADER) == Some(client_key.as_str());
        if accepted {
            Ok(())
        } else {
            Err(WireError::new(codes::UNAUTHORIZED, "invalid application credentials"))
        }
    }

    fn route(&self, path: &str, request: &HttpRequest) -> Result<WireResponse, WireError> {
        self.authorize(request)?;
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [.., "classes", class_name, object_id] => {
                let mut object = decode_object(&request.body, class_name)?;
                let id = ObjectId::parse(*object_id)
                    .map_err(|e| WireError::new(codes::INVALID_REQUEST, e.to_string()))?;
                if object.object_id.as_ref().is_some_and(|body_id| *body_id != id) {
                    return Err(WireError::new(
                        codes::INVALID_REQUEST,
                        "object id in body does not match route",
                    ));
                }
                object.object_id = Some(id);
                let object_id = self.apply_save(OperationKind::Update, object)?;
                Ok(WireResponse::Saved { object_id })
            }
            [.., "classes", class_name] => {
                let object = decode_object(&request.body, class_name)?;
                let object_id = self.apply_save(OperationKind::Create, object)?;
                Ok(WireResponse::Saved { object_id })
            }
            [.., "users"] => {
                let object = decode_object(&request.body, USER_CLASS)?;
                let object_id = self.apply_save(OperationKind::SignUp, object)?;
                Ok(WireResponse::Saved { object_id })
            }
            [.., "query", class_name] => {
                let query: Query = wire::decode(&request.body)
                    .map_err(|e| WireError::new(codes::INVALID_REQUEST, e.to_string()))?;
                if query.class_name() != *class_name {
                    return Err(WireError::new(
                        codes::INVALID_REQUEST,
                        "query class does not match route",
                    ));
                }
                let objects = self
                    .run_query(&query)?
                    .iter()
                    .map(WireObject::from_entity)
                    .collect();
                Ok(WireResponse::Objects(objects))
            }
            _ => Err(WireError::new(codes::NOT_FOUND, format!("no route for {path}"))),
        }
    }
}

struct SaveGuard<'a> {
    endpoint: &'a MemoryEndpoint,
    key: EntityKey,
}

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        let mut concurrency = self.endpoint.concurrency.lock();
        if let Some(running) = concurrency.running.get_mut(&self.key) {
            *running = running.saturating_sub(1);
            if *running == 0 {
                concurrency.running.remove(&self.key);
            }
        }
        concurrency.total = concurrency.total.saturating_sub(1);
    }
}

fn is_user_class(class_name: &str) -> bool {
    class_name == USER_CLASS
}

fn unused_id(objects: &BTreeMap<ObjectId, Fields>) -> ObjectId {
    let mut rng = rand::thread_rng();
    loop {
        let id = ObjectId::generate(&mut rng);
        if !objects.contains_key(&id) {
            return id;
        }
    }
}

fn check_username_free(
    users: &BTreeMap<ObjectId, Fields>,
    fields: &Fields,
    except: Option<&ObjectId>,
) -> Result<(), WireError> {
    let Some(username) = fields.get(USERNAME_FIELD).and_then(Value::as_text) else {
        return Ok(());
    };
    let taken = users.iter().any(|(id, other)| {
        Some(id) != except && other.get(USERNAME_FIELD).and_then(Value::as_text) == Some(username)
    });
    if taken {
        Err(WireError::new(
            codes::USERNAME_TAKEN,
            format!("username {username} already taken"),
        ))
    } else {
        Ok(())
    }
}

fn decode_object(body: &[u8], class_name: &str) -> Result<WireObject, WireError> {
    let object: WireObject =
        wire::decode(body).map_err(|e| WireError::new(codes::INVALID_REQUEST, e.to_string()))?;
    if object.class_name != class_name {
        return Err(WireError::new(
            codes::INVALID_REQUEST,
            format!("{} object sent to {class_name} route", object.class_name),
        ));
    }
    Ok(object)
}

#[async_trait]
impl RemoteEndpoint for MemoryEndpoint {
    async fn save(&self, kind: OperationKind, entity: &Entity) -> SyncResult<ObjectId> {
        let _guard = self.begin_save(entity.key());
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.apply_save(kind, WireObject::from_entity(entity))
            .map_err(SyncError::from)
    }

    async fn query(&self, query: &Query) -> SyncResult<Vec<Entity>> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.run_query(query).map_err(SyncError::from)
    }
}

impl LoopbackServer for MemoryEndpoint {
    fn handle_post(&self, path: &str, request: &HttpRequest) -> Result<Vec<u8>, String> {
        let response = self.route(path, request).unwrap_or_else(|err| {
            debug!(path, code = err.code, message = %err.message, "request failed");
            WireResponse::Error(err)
        });
        wire::encode(&response).map_err(|e| e.to_string())
    }
}
