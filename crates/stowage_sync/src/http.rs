//! HTTP endpoint implementation.
//!
//! [`HttpEndpoint`] speaks the CBOR wire format over an abstract
//! [`HttpClient`], so any HTTP library (or a non-HTTP transport) can carry
//! the requests. [`LoopbackClient`] routes requests to an in-process server
//! for tests and demos.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use stowage_core::{Entity, ObjectId, Query};
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::error::{SyncError, SyncResult};
use crate::operation::OperationKind;
use crate::remote::RemoteEndpoint;
use crate::wire::{
    self, WireObject, WireResponse, APPLICATION_ID_HEADER, CLIENT_KEY_HEADER, CONTENT_TYPE,
};

/// An outgoing POST request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The path component of the URL, e.g. `/classes/Food`.
    pub fn path(&self) -> &str {
        let rest = match self.url.find("://") {
            Some(i) => &self.url[i + 3..],
            None => &self.url,
        };
        match rest.find('/') {
            Some(i) => &rest[i..],
            None => "/",
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err` is a
/// transport failure (connection refused, reset, ...) and is retried by the
/// sync queue; server-side errors arrive as a successful response carrying
/// a [`WireResponse::Error`].
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Sends a POST request and returns the response body.
    async fn post(&self, request: HttpRequest) -> Result<Vec<u8>, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Remote endpoint reached over HTTP.
///
/// Routes:
/// - `POST /classes/{class}`: create
/// - `POST /classes/{class}/{objectId}`: update
/// - `POST /users`: sign-up
/// - `POST /query/{class}`: query
pub struct HttpEndpoint<C: HttpClient> {
    config: EndpointConfig,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpEndpoint<C> {
    /// Creates an endpoint using the given configuration and client.
    pub fn new(config: EndpointConfig, client: C) -> Self {
        Self {
            config,
            client,
            last_error: RwLock::new(None),
        }
    }

    /// The endpoint configuration.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    async fn post_cbor<T>(&self, path: &str, body: &T) -> SyncResult<WireResponse>
    where
        T: serde::Serialize + Sync + ?Sized,
    {
        if !self.client.is_healthy() {
            return Err(SyncError::TransientRemote("http client unhealthy".into()));
        }

        let request = HttpRequest {
            url: self.config.url(path),
            headers: vec![
                (
                    APPLICATION_ID_HEADER.to_string(),
                    self.config.application_id.clone(),
                ),
                (CLIENT_KEY_HEADER.to_string(), self.config.client_key.clone()),
                ("Content-Type".to_string(), CONTENT_TYPE.to_string()),
            ],
            body: wire::encode(body)?,
        };
        debug!(url = %request.url, bytes = request.body.len(), "POST");

        let response = match tokio::time::timeout(self.config.timeout, self.client.post(request))
            .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                warn!(path, error = %err, "transport error");
                self.set_error(&err);
                return Err(SyncError::TransientRemote(err));
            }
            Err(_) => {
                warn!(path, timeout = ?self.config.timeout, "request timed out");
                self.set_error("request timed out");
                return Err(SyncError::Timeout);
            }
        };

        self.clear_error();
        wire::decode(&response)
    }
}

/// Route for saving an object of the given kind.
pub(crate) fn save_path(kind: OperationKind, object: &WireObject) -> SyncResult<String> {
    match (kind, &object.object_id) {
        (OperationKind::SignUp, _) => Ok("/users".to_string()),
        (OperationKind::Create, _) => Ok(format!("/classes/{}", object.class_name)),
        (OperationKind::Update, Some(id)) => Ok(format!("/classes/{}/{id}", object.class_name)),
        (OperationKind::Update, None) => Err(SyncError::Rejected(format!(
            "cannot update unsaved {} object",
            object.class_name
        ))),
    }
}

#[async_trait]
impl<C: HttpClient> RemoteEndpoint for HttpEndpoint<C> {
    async fn save(&self, kind: OperationKind, entity: &Entity) -> SyncResult<ObjectId> {
        let object = WireObject::from_entity(entity);
        let path = save_path(kind, &object)?;
        match self.post_cbor(&path, &object).await? {
            WireResponse::Saved { object_id } => Ok(object_id),
            WireResponse::Error(err) => Err(err.into()),
            WireResponse::Objects(_) => Err(SyncError::Codec(format!(
                "unexpected query response to {path}"
            ))),
        }
    }

    async fn query(&self, query: &Query) -> SyncResult<Vec<Entity>> {
        let path = format!("/query/{}", query.class_name());
        match self.post_cbor(&path, query).await? {
            WireResponse::Objects(objects) => {
                objects.into_iter().map(WireObject::into_entity).collect()
            }
            WireResponse::Error(err) => Err(err.into()),
            WireResponse::Saved { .. } => Err(SyncError::Codec(format!(
                "unexpected save response to {path}"
            ))),
        }
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the encoded [`WireResponse`].
    ///
    /// `Err` means the server could not produce any response.
    fn handle_post(&self, path: &str, request: &HttpRequest) -> Result<Vec<u8>, String>;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle_post(&self, path: &str, request: &HttpRequest) -> Result<Vec<u8>, String> {
        (**self).handle_post(path, request)
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead. Connection drops
/// can be simulated with [`LoopbackClient::drop_next`].
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    drops: AtomicU32,
}

impl<S: LoopbackServer + 'static> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            drops: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` requests fail before reaching the server.
    pub fn drop_next(&self, count: u32) {
        self.drops.fetch_add(count, Ordering::SeqCst);
    }

    /// The server requests are routed to.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer + 'static> HttpClient for LoopbackClient<S> {
    async fn post(&self, request: HttpRequest) -> Result<Vec<u8>, String> {
        let dropped = self
            .drops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return Err("connection reset by peer".into());
        }
        self.server.handle_post(request.path(), &request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{codes, WireError};
    use std::time::Duration;

    struct TestClient {
        response: RwLock<Option<Vec<u8>>>,
        requests: RwLock<Vec<HttpRequest>>,
        delay: Duration,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: RwLock::new(None),
                requests: RwLock::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn respond_with(&self, response: &WireResponse) {
            *self.response.write() = Some(wire::encode(response).unwrap());
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn post(&self, request: HttpRequest) -> Result<Vec<u8>, String> {
            self.requests.write().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response
                .read()
                .clone()
                .ok_or_else(|| "No response set".into())
        }
    }

    fn endpoint(client: TestClient) -> HttpEndpoint<TestClient> {
        let config = EndpointConfig::new("https://api.example.com/1", "app-id", "client-key")
            .with_timeout(Duration::from_secs(1));
        HttpEndpoint::new(config, client)
    }

    fn taco() -> Entity {
        let mut taco = Entity::new("Food").unwrap();
        taco.set("name", "taco").unwrap();
        taco
    }

    #[test]
    fn request_path_and_headers() {
        let request = HttpRequest {
            url: "https://api.example.com/1/classes/Food".into(),
            headers: vec![("x-application-id".into(), "app".into())],
            body: vec![],
        };
        assert_eq!(request.path(), "/1/classes/Food");
        assert_eq!(request.header(APPLICATION_ID_HEADER), Some("app"));
        assert_eq!(request.header(CLIENT_KEY_HEADER), None);

        let bare = HttpRequest {
            url: "memory://local".into(),
            headers: vec![],
            body: vec![],
        };
        assert_eq!(bare.path(), "/");
    }

    #[tokio::test]
    async fn create_posts_to_class_route() {
        let client = TestClient::new();
        let id = ObjectId::parse("NewId12345").unwrap();
        client.respond_with(&WireResponse::Saved {
            object_id: id.clone(),
        });
        let endpoint = endpoint(client);

        let saved = endpoint.save(OperationKind::Create, &taco()).await.unwrap();
        assert_eq!(saved, id);

        let requests = endpoint.client().requests.read();
        assert_eq!(requests[0].url, "https://api.example.com/1/classes/Food");
        assert_eq!(requests[0].header(APPLICATION_ID_HEADER), Some("app-id"));
        assert_eq!(requests[0].header(CLIENT_KEY_HEADER), Some("client-key"));
        let sent: WireObject = wire::decode(&requests[0].body).unwrap();
        assert_eq!(sent.fields.get("name").and_then(|v| v.as_text()), Some("taco"));
    }

    #[test]
    fn save_routes() {
        let mut object = WireObject::from_entity(&taco());
        assert_eq!(
            save_path(OperationKind::Create, &object).unwrap(),
            "/classes/Food"
        );
        assert!(save_path(OperationKind::Update, &object).is_err());

        object.object_id = Some(ObjectId::parse("abc").unwrap());
        assert_eq!(
            save_path(OperationKind::Update, &object).unwrap(),
            "/classes/Food/abc"
        );
        assert_eq!(save_path(OperationKind::SignUp, &object).unwrap(), "/users");
    }

    #[tokio::test]
    async fn server_errors_are_mapped() {
        let client = TestClient::new();
        client.respond_with(&WireResponse::Error(WireError::new(
            codes::USERNAME_TAKEN,
            "username Jeremy already taken",
        )));
        let endpoint = endpoint(client);

        let user = Entity::new_user("Jeremy", "password").unwrap();
        let err = endpoint.save(OperationKind::SignUp, &user).await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn transport_errors_are_transient() {
        let endpoint = endpoint(TestClient::new());
        let err = endpoint.save(OperationKind::Create, &taco()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(endpoint.last_error().as_deref(), Some("No response set"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_responses_time_out() {
        let mut client = TestClient::new();
        client.delay = Duration::from_secs(5);
        client.respond_with(&WireResponse::Objects(vec![]));
        let endpoint = endpoint(client);

        let query = Query::new("Food").unwrap();
        assert_eq!(endpoint.query(&query).await, Err(SyncError::Timeout));
    }

    #[tokio::test]
    async fn query_decodes_objects() {
        let client = TestClient::new();
        let mut object = WireObject::from_entity(&taco());
        object.object_id = Some(ObjectId::parse("taco1").unwrap());
        client.respond_with(&WireResponse::Objects(vec![object]));
        let endpoint = endpoint(client);

        let query = Query::new("Food").unwrap().where_equal_to("name", "taco");
        let results = endpoint.query(&query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].object_id().unwrap().as_str(), "taco1");
        assert!(!results[0].is_dirty());

        let requests = endpoint.client().requests.read();
        assert!(requests[0].url.ends_with("/query/Food"));
    }
}
