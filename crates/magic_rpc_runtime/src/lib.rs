//! Runtime for Magic RPC.
//!
//! This crate provides the engine behind a Magic RPC handler:
//! - `schema`: Shapes and the registry of named entity types
//! - `selection`: Client field selection trees
//! - `validation`: Shape validation, coercion and output masking
//! - `dataloader`: Per-request batching and caching for N+1 prevention
//! - `context`: Request-scoped context passed to handlers and resolvers
//! - `resolver`: Relation field resolvers and the resolver table
//! - `data_resolver`: Selection-driven expansion of handler results
//! - `error`: Typed error codes shared by every layer

pub mod context;
pub mod data_resolver;
pub mod dataloader;
pub mod error;
pub mod resolver;
pub mod schema;
pub mod selection;
pub mod validation;

pub use context::{Context, SharedContext, TypedContext};
pub use data_resolver::DataResolver;
pub use dataloader::{
    create_loader, BatchWindow, DataLoader, LoadError, LoaderSet, ValueBatchFn, ValueLoader,
};
pub use error::{ErrorCode, ErrorKind, ResultExt, RpcError, RpcResult};
pub use resolver::{
    AsyncFnResolver, FieldResolver, FnResolver, LoaderResolver, ResolverError, ResolverResult,
    ResolverTable,
};
pub use schema::{Shape, TypeDescriptor, TypeRegistry};
pub use selection::{FieldSelection, Selection};
pub use validation::{
    ShapeValidator, ValidateOptions, ValidationError, ValidationErrors, Validator,
};
