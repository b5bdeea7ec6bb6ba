//! Magic RPC SDK
//!
//! Builds a JSON RPC endpoint whose callers choose which relation fields of a
//! result get expanded. Handlers return plain entities; relations are filled
//! in afterwards by registered resolvers, batched per request.
//!
//! ```ignore
//! use magic_rpc_sdk::{LoaderResolver, ResolverTable, RpcHandler, RpcServer, Shape, TypeDescriptor};
//!
//! let handler = RpcHandler::builder()
//!     .type_def(TypeDescriptor::new("User").field("id", Shape::String).field("teamId", Shape::String))
//!     .type_def(TypeDescriptor::new("Team").field("id", Shape::String))
//!     .type_loader("Team", |ids| async move { teams_by_id(ids).await })
//!     .resolvers(
//!         ResolverTable::new()
//!             .field("User", "team", Shape::named("Team"), LoaderResolver::new("Team", "teamId"))
//!             .declare("Team"),
//!     )
//!     .method("getUser", Shape::object([("id", Shape::String)]), Shape::named("User"), |params, _ctx| async move {
//!         user_by_id(params.input["id"].as_str()).await
//!     })
//!     .build()?;
//!
//! // {"method": "getUser", "input": {"id": "1"}, "selection": {"team": 1}}
//! RpcServer::new(handler).listen().await?;
//! ```

pub mod client;
pub mod handler;
pub(crate) mod http;
pub mod protocol;
pub mod server;

pub use client::{ClientConfig, RpcClient};
pub use handler::{HandlerConfig, MethodContract, MethodParams, RpcHandler, RpcHandlerBuilder};
pub use protocol::{RpcPayload, RpcRequest, RpcResponse};
pub use server::{RpcServer, ServerConfig};

// Re-export runtime types that are commonly needed
pub use magic_rpc_runtime::context::data;
pub use magic_rpc_runtime::{
    create_loader, AsyncFnResolver, BatchWindow, Context, DataLoader, ErrorCode, ErrorKind,
    FieldResolver, FieldSelection, FnResolver, LoadError, LoaderResolver, LoaderSet,
    ResolverError, ResolverResult, ResolverTable, ResultExt, RpcError, RpcResult, Selection,
    Shape, ShapeValidator, SharedContext, TypeDescriptor, TypeRegistry, TypedContext,
    ValidateOptions, Validator, ValueLoader,
};
