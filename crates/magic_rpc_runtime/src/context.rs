//! Request-scoped context.
//!
//! Every call gets a [`Context`]: the request's loaders plus a [`TypedContext`]
//! of caller-supplied data (headers, authenticated user, request id). Handlers
//! and resolvers of one request share it; nothing in it outlives the request.

use crate::dataloader::{LoaderSet, ValueLoader};
use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::resolver::ResolverError;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-keyed storage for caller-supplied request data.
///
/// ```
/// use magic_rpc_runtime::context::{data::CurrentUserId, TypedContext};
///
/// let ctx = TypedContext::new()
///     .with(CurrentUserId::new("1"))
///     .with_header("x-tenant", "acme");
///
/// assert_eq!(ctx.get::<CurrentUserId>().unwrap().as_str(), "1");
/// assert_eq!(ctx.header("x-tenant"), Some("acme"));
/// ```
#[derive(Default)]
pub struct TypedContext {
    data: FxHashMap<TypeId, Box<dyn Any + Send + Sync>>,
    headers: HashMap<String, String>,
}

impl TypedContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.data
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast().ok().map(|b| *b))
    }

    /// Stores a value and returns self.
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Gets a value by type.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.data
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Removes a value by type.
    pub fn remove<T: 'static>(&mut self) -> Option<T> {
        self.data
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast().ok().map(|b| *b))
    }

    /// Returns true if a value of the given type is stored.
    pub fn contains<T: 'static>(&self) -> bool {
        self.data.contains_key(&TypeId::of::<T>())
    }

    /// Sets a header. Header names are stored lowercase.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers
            .insert(key.into().to_ascii_lowercase(), value.into());
    }

    /// Sets a header and returns self.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }

    /// Gets a header, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns all headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

impl fmt::Debug for TypedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedContext")
            .field("data_count", &self.data.len())
            .field("headers", &self.headers)
            .finish()
    }
}

/// A shareable request data container.
pub type SharedContext = Arc<TypedContext>;

/// Common request data types.
pub mod data {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    /// Id of the authenticated caller.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct CurrentUserId(pub String);

    impl CurrentUserId {
        pub fn new(id: impl Into<String>) -> Self {
            Self(id.into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    /// Request id attached to log spans.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct RequestId(pub String);

    impl RequestId {
        pub fn new(id: impl Into<String>) -> Self {
            Self(id.into())
        }

        /// Generates a process-unique id.
        pub fn generate() -> Self {
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
            Self(format!("req_{millis:x}_{seq:x}"))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    /// When the request started.
    #[derive(Debug, Clone, Copy)]
    pub struct RequestStartTime(pub Instant);

    impl Default for RequestStartTime {
        fn default() -> Self {
            Self(Instant::now())
        }
    }

    impl RequestStartTime {
        pub fn elapsed(&self) -> std::time::Duration {
            self.0.elapsed()
        }
    }
}

/// Context passed to handlers and resolvers.
#[derive(Clone)]
pub struct Context {
    loaders: Arc<LoaderSet>,
    data: SharedContext,
}

impl Context {
    /// Creates a context from a loader set and request data.
    pub fn new(loaders: LoaderSet, data: SharedContext) -> Self {
        Self {
            loaders: Arc::new(loaders),
            data,
        }
    }

    /// Creates a context without loaders or data.
    pub fn empty() -> Self {
        Self::new(LoaderSet::new(), Arc::new(TypedContext::new()))
    }

    /// Returns the loader set.
    pub fn loaders(&self) -> &LoaderSet {
        &self.loaders
    }

    /// Gets a loader by name.
    pub fn loader(&self, name: &str) -> RpcResult<&ValueLoader> {
        self.loaders.get(name).ok_or_else(|| {
            RpcError::new(
                ErrorCode::LoaderNotFound,
                format!("no loader registered under '{name}'"),
            )
            .with_data("loader", name)
        })
    }

    /// Loads one value through a named loader. Missing keys load as null.
    pub async fn load(&self, loader: &str, key: impl Into<String>) -> Result<Value, ResolverError> {
        let loader = self
            .loaders
            .get(loader)
            .ok_or_else(|| ResolverError::LoaderNotFound(loader.to_string()))?;
        let value = loader.load(key.into()).await?;
        Ok(value.unwrap_or(Value::Null))
    }

    /// Gets caller-supplied data by type.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.get::<T>()
    }

    /// Returns the caller-supplied data.
    pub fn typed(&self) -> &TypedContext {
        &self.data
    }

    /// Returns the shared caller-supplied data.
    pub fn shared(&self) -> SharedContext {
        Arc::clone(&self.data)
    }

    /// Gets a request header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.data.header(key)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("loaders", &self.loaders.names().collect::<Vec<_>>())
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::data::*;
    use super::*;
    use crate::dataloader::create_loader;
    use serde_json::json;

    #[test]
    fn test_typed_context_replace_and_remove() {
        let mut ctx = TypedContext::new();
        ctx.insert(CurrentUserId::new("1"));
        let old = ctx.insert(CurrentUserId::new("2"));

        assert_eq!(old.unwrap().as_str(), "1");
        assert_eq!(ctx.get::<CurrentUserId>().unwrap().as_str(), "2");
        assert!(ctx.remove::<CurrentUserId>().is_some());
        assert!(!ctx.contains::<CurrentUserId>());
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let ctx = TypedContext::new().with_header("Authorization", "Bearer t");
        assert_eq!(ctx.header("authorization"), Some("Bearer t"));
        assert_eq!(ctx.header("AUTHORIZATION"), Some("Bearer t"));
    }

    #[test]
    fn test_request_id_generate() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("req_"));
    }

    #[tokio::test]
    async fn test_context_load() {
        let users = create_loader(|keys: Vec<String>| async move {
            Ok(keys
                .into_iter()
                .filter(|k| k == "1")
                .map(|k| (k, json!({"id": "1", "name": "Alice"})))
                .collect())
        });
        let ctx = Context::new(
            LoaderSet::new().with("User", users),
            Arc::new(TypedContext::new().with(CurrentUserId::new("1"))),
        );

        assert_eq!(ctx.load("User", "1").await.unwrap()["name"], "Alice");
        assert_eq!(ctx.load("User", "9").await.unwrap(), Value::Null);
        assert!(matches!(
            ctx.load("Team", "1").await,
            Err(ResolverError::LoaderNotFound(_))
        ));
        assert_eq!(ctx.loader("Team").unwrap_err().code, ErrorCode::LoaderNotFound);
        assert_eq!(ctx.data::<CurrentUserId>().unwrap().as_str(), "1");
    }
}
