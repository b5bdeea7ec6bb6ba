//! Loaders, relation resolvers and method handlers.

use crate::data::Store;
use crate::schema;
use magic_rpc_sdk::{
    create_loader, ErrorCode, LoadError, LoaderResolver, LoaderSet, ResolverTable, ResultExt,
    RpcError, RpcHandler, RpcHandlerBuilder, RpcResult, Shape,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct ById {
    id: String,
}

fn keyed<T: Serialize>(
    items: impl IntoIterator<Item = (String, T)>,
) -> Result<HashMap<String, Value>, LoadError> {
    items
        .into_iter()
        .map(|(key, item)| {
            serde_json::to_value(item)
                .map(|value| (key, value))
                .map_err(|e| LoadError::new(e.to_string()))
        })
        .collect()
}

/// `User.team`, `Team.leader` and `Team.members`.
pub fn relations() -> ResolverTable {
    ResolverTable::new()
        .field(
            "User",
            "team",
            Shape::named("Team"),
            LoaderResolver::new("Team", "teamId"),
        )
        .field(
            "Team",
            "leader",
            Shape::named("User"),
            LoaderResolver::new("User", "leaderId"),
        )
        .field(
            "Team",
            "members",
            Shape::array(Shape::named("User")),
            LoaderResolver::new("TeamMembers", "id").or(json!([])),
        )
}

fn loaders(builder: RpcHandlerBuilder, store: &Arc<Store>) -> RpcHandlerBuilder {
    let users = Arc::clone(store);
    let teams = Arc::clone(store);
    let members = Arc::clone(store);

    builder
        .type_loader("User", move |ids: Vec<String>| {
            let store = Arc::clone(&users);
            async move {
                info!(?ids, "User loader");
                let found = store.users_by_ids(&ids).await;
                keyed(found.into_iter().map(|user| (user.id.clone(), user)))
            }
        })
        .type_loader("Team", move |ids: Vec<String>| {
            let store = Arc::clone(&teams);
            async move {
                info!(?ids, "Team loader");
                let found = store.teams_by_ids(&ids).await;
                keyed(found.into_iter().map(|team| (team.id.clone(), team)))
            }
        })
        .create_loaders(move |_data| {
            let store = Arc::clone(&members);
            let loader = create_loader(move |team_ids: Vec<String>| {
                let store = Arc::clone(&store);
                async move {
                    info!(?team_ids, "TeamMembers loader");
                    keyed(store.members_by_team_ids(&team_ids).await)
                }
            });
            LoaderSet::new().with("TeamMembers", loader)
        })
}

fn handlers(builder: RpcHandlerBuilder, store: &Arc<Store>) -> RpcHandlerBuilder {
    let all = Arc::clone(store);

    builder
        .handler("getUser", |params, ctx| async move {
            let ById { id } = params.input_as()?;
            match ctx.load("User", id).await? {
                Value::Null => Err(RpcError::not_found("User")),
                user => Ok(user),
            }
        })
        .handler("getUsers", move |_params, _ctx| {
            let store = Arc::clone(&all);
            async move {
                serde_json::to_value(store.users().await).map_rpc_err(ErrorCode::InternalError)
            }
        })
        .handler("getTeam", |params, ctx| async move {
            let ById { id } = params.input_as()?;
            match ctx.load("Team", id).await? {
                Value::Null => Err(RpcError::not_found("Team")),
                team => Ok(team),
            }
        })
}

/// Builds the handler over `store`.
pub fn build_handler(store: Arc<Store>) -> RpcResult<RpcHandler> {
    let builder = schema::declare(RpcHandler::builder()).resolvers(relations());
    let builder = loaders(builder, &store);
    handlers(builder, &store).build()
}
