//! Relation resolvers.
//!
//! A resolver computes one relation field of one named type, usually by
//! loading a related entity through the request's loaders. Resolvers are
//! registered in a [`ResolverTable`] together with the shape of the value they
//! produce, so the data resolver knows how to expand the result further.

use crate::context::Context;
use crate::dataloader::LoadError;
use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::schema::{Shape, TypeRegistry};
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Result type for resolvers.
pub type ResolverResult = Result<Value, ResolverError>;

/// Future type for async resolvers.
pub type ResolverFuture<'a> = Pin<Box<dyn Future<Output = ResolverResult> + Send + 'a>>;

/// Error from a resolver.
#[derive(Debug, Clone, Error)]
pub enum ResolverError {
    /// The related entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// No loader is registered under this name.
    #[error("no loader registered under '{0}'")]
    LoaderNotFound(String),

    /// A batch function failed.
    #[error("loader failed: {0}")]
    Load(#[from] LoadError),

    /// A key field holds a value that cannot be used as a loader key.
    #[error("field '{0}' cannot be used as a loader key")]
    InvalidKey(String),

    /// Custom error.
    #[error("{0}")]
    Custom(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ResolverError> for RpcError {
    fn from(error: ResolverError) -> Self {
        let code = match &error {
            ResolverError::NotFound(_) => ErrorCode::NotFound,
            ResolverError::LoaderNotFound(_) => ErrorCode::LoaderNotFound,
            ResolverError::Load(_) => ErrorCode::LoaderError,
            ResolverError::InvalidKey(_) | ResolverError::Custom(_) => ErrorCode::ResolverError,
            ResolverError::Internal(_) => ErrorCode::InternalError,
        };
        RpcError::new(code, error.to_string())
    }
}

/// Trait for relation field resolvers.
pub trait FieldResolver: Send + Sync {
    /// Computes the field for one entity.
    fn resolve<'a>(&'a self, entity: &'a Value, ctx: &'a Context) -> ResolverFuture<'a>;
}

/// A sync resolver function.
pub type SyncResolverFn = Arc<dyn Fn(&Value, &Context) -> ResolverResult + Send + Sync>;

/// A wrapper for sync resolver functions.
pub struct FnResolver {
    func: SyncResolverFn,
}

impl FnResolver {
    /// Creates a new function resolver.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &Context) -> ResolverResult + Send + Sync + 'static,
    {
        Self { func: Arc::new(f) }
    }
}

impl FieldResolver for FnResolver {
    fn resolve<'a>(&'a self, entity: &'a Value, ctx: &'a Context) -> ResolverFuture<'a> {
        let result = (self.func)(entity, ctx);
        Box::pin(async move { result })
    }
}

/// An async resolver function type.
pub type AsyncResolverFn =
    Arc<dyn Fn(Value, Context) -> ResolverFuture<'static> + Send + Sync>;

/// A wrapper for async resolver functions. The entity and context are cloned
/// into the returned future.
pub struct AsyncFnResolver {
    func: AsyncResolverFn,
}

impl AsyncFnResolver {
    /// Creates a new async function resolver.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |entity, ctx| Box::pin(f(entity, ctx))),
        }
    }
}

impl FieldResolver for AsyncFnResolver {
    fn resolve<'a>(&'a self, entity: &'a Value, ctx: &'a Context) -> ResolverFuture<'a> {
        let func = Arc::clone(&self.func);
        let entity = entity.clone();
        let ctx = ctx.clone();
        Box::pin(async move { func(entity, ctx).await })
    }
}

/// Resolves a field by feeding one of the entity's own fields to a loader.
///
/// A null or absent key, or a key the loader does not know, resolves to the
/// fallback value, `null` unless set with [`LoaderResolver::or`].
pub struct LoaderResolver {
    loader: String,
    key_field: String,
    fallback: Value,
}

impl LoaderResolver {
    /// Loads through `loader` with the value of `key_field`.
    pub fn new(loader: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            loader: loader.into(),
            key_field: key_field.into(),
            fallback: Value::Null,
        }
    }

    /// Sets the value used when nothing is loaded.
    pub fn or(mut self, fallback: Value) -> Self {
        self.fallback = fallback;
        self
    }

    fn key(&self, entity: &Value) -> Result<Option<String>, ResolverError> {
        match entity.get(&self.key_field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(ResolverError::InvalidKey(self.key_field.clone())),
        }
    }
}

impl FieldResolver for LoaderResolver {
    fn resolve<'a>(&'a self, entity: &'a Value, ctx: &'a Context) -> ResolverFuture<'a> {
        Box::pin(async move {
            let Some(key) = self.key(entity)? else {
                return Ok(self.fallback.clone());
            };
            match ctx.load(&self.loader, key).await? {
                Value::Null => Ok(self.fallback.clone()),
                value => Ok(value),
            }
        })
    }
}

/// A registered relation field.
pub struct FieldEntry {
    output: Shape,
    resolver: Arc<dyn FieldResolver>,
}

impl FieldEntry {
    /// Shape of the value the resolver produces.
    pub fn output(&self) -> &Shape {
        &self.output
    }

    /// The resolver.
    pub fn resolver(&self) -> &dyn FieldResolver {
        self.resolver.as_ref()
    }
}

/// Resolvers organized by type and field.
#[derive(Default)]
pub struct ResolverTable {
    types: IndexMap<String, IndexMap<String, FieldEntry>>,
    duplicates: Vec<(String, String)>,
}

impl ResolverTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver for a type and field.
    pub fn register<R: FieldResolver + 'static>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        output: Shape,
        resolver: R,
    ) {
        let type_name = type_name.into();
        let field_name = field_name.into();
        let fields = self.types.entry(type_name.clone()).or_default();
        let entry = FieldEntry {
            output,
            resolver: Arc::new(resolver),
        };
        if fields.insert(field_name.clone(), entry).is_some() {
            self.duplicates.push((type_name, field_name));
        }
    }

    /// Registers a resolver and returns self.
    pub fn field<R: FieldResolver + 'static>(
        mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        output: Shape,
        resolver: R,
    ) -> Self {
        self.register(type_name, field_name, output, resolver);
        self
    }

    /// Registers a sync function as a resolver.
    pub fn field_fn<F>(
        self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        output: Shape,
        f: F,
    ) -> Self
    where
        F: Fn(&Value, &Context) -> ResolverResult + Send + Sync + 'static,
    {
        self.field(type_name, field_name, output, FnResolver::new(f))
    }

    /// Registers an async function as a resolver.
    pub fn field_async<F, Fut>(
        self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        output: Shape,
        f: F,
    ) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        self.field(type_name, field_name, output, AsyncFnResolver::new(f))
    }

    /// Adds an entry without relations for a type.
    pub fn declare(mut self, type_name: impl Into<String>) -> Self {
        self.types.entry(type_name.into()).or_default();
        self
    }

    /// Returns the relation fields of a type, if the type has an entry.
    pub fn type_resolvers(&self, type_name: &str) -> Option<&IndexMap<String, FieldEntry>> {
        self.types.get(type_name)
    }

    /// Gets the entry for a type and field.
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&FieldEntry> {
        self.types.get(type_name)?.get(field_name)
    }

    /// Iterates over `(type, field, output shape)` of every relation.
    pub fn relations(&self) -> impl Iterator<Item = (&str, &str, &Shape)> {
        self.types.iter().flat_map(|(type_name, fields)| {
            fields
                .iter()
                .map(move |(field, entry)| (type_name.as_str(), field.as_str(), &entry.output))
        })
    }

    /// Returns the names of the types with an entry.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Checks the table against the registered types.
    pub fn validate(&self, types: &TypeRegistry) -> RpcResult<()> {
        if let Some((type_name, field)) = self.duplicates.first() {
            return Err(RpcError::new(
                ErrorCode::InvalidRegistration,
                format!("resolver for '{type_name}.{field}' registered more than once"),
            ));
        }
        for (type_name, field, output) in self.relations() {
            if !types.contains(type_name) {
                return Err(RpcError::new(
                    ErrorCode::InvalidRegistration,
                    format!("resolver '{type_name}.{field}' is registered for unknown type '{type_name}'"),
                )
                .with_data("type", type_name));
            }
            types.check_shape(output, &format!("resolver '{type_name}.{field}'"))?;
        }
        for type_name in self.type_names() {
            if !types.contains(type_name) {
                return Err(RpcError::new(
                    ErrorCode::InvalidRegistration,
                    format!("resolvers declared for unknown type '{type_name}'"),
                )
                .with_data("type", type_name));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ResolverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverTable")
            .field(
                "relations",
                &self
                    .relations()
                    .map(|(t, field, _)| format!("{t}.{field}"))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
