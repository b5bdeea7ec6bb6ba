//! Types and method contracts.

use magic_rpc_sdk::{RpcHandlerBuilder, Shape, TypeDescriptor};

pub fn user() -> TypeDescriptor {
    TypeDescriptor::new("User")
        .field("id", Shape::String)
        .field("name", Shape::String)
        .field("teamId", Shape::optional(Shape::String))
        .field("createdAt", Shape::DateTime)
}

pub fn team() -> TypeDescriptor {
    TypeDescriptor::new("Team")
        .field("id", Shape::String)
        .field("name", Shape::String)
        .field("leaderId", Shape::String)
        .field("createdAt", Shape::DateTime)
}

fn by_id() -> Shape {
    Shape::object([("id", Shape::String)])
}

/// Registers the types and declares every method.
pub fn declare(builder: RpcHandlerBuilder) -> RpcHandlerBuilder {
    builder
        .type_def(user())
        .type_def(team())
        .contract("getUser", by_id(), Shape::named("User"))
        .contract("getUsers", Shape::empty_object(), Shape::array(Shape::named("User")))
        .contract("getTeam", by_id(), Shape::named("Team"))
}
