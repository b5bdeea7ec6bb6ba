//! Selection-driven data resolution.
//!
//! [`DataResolver`] walks a handler result alongside its declared output
//! shape and a client selection. Every selected relation field of a named
//! type is computed by its registered resolver and injected into the entity;
//! the injected value is then resolved again against the resolver's declared
//! output shape with the nested selection.
//!
//! Sibling fields and array elements are resolved concurrently inside one
//! task, so every loader call of one recursion level lands in the same
//! batching window.

use crate::context::Context;
use crate::error::{ErrorCode, RpcError, RpcResult};
use crate::resolver::ResolverTable;
use crate::schema::{Shape, TypeRegistry};
use crate::selection::Selection;
use crate::validation::kind_of;
use futures::future::try_join_all;
use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::trace;

/// Future returned by the recursive resolve step.
pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = RpcResult<()>> + Send + 'a>>;

/// Expands relation fields of handler results.
#[derive(Debug, Clone)]
pub struct DataResolver {
    types: Arc<TypeRegistry>,
    resolvers: Arc<ResolverTable>,
}

impl DataResolver {
    /// Creates a data resolver over a type registry and resolver table.
    pub fn new(types: Arc<TypeRegistry>, resolvers: Arc<ResolverTable>) -> Self {
        Self { types, resolvers }
    }

    /// Returns the type registry.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Returns the resolver table.
    pub fn resolvers(&self) -> &ResolverTable {
        &self.resolvers
    }

    /// Resolves `selection` on `value`, which has the given shape, in place.
    ///
    /// Null values and empty selections are left untouched.
    pub fn resolve<'a>(
        &'a self,
        value: &'a mut Value,
        shape: &'a Shape,
        selection: &'a Selection,
        ctx: &'a Context,
    ) -> ResolveFuture<'a> {
        Box::pin(async move {
            if value.is_null() || selection.is_empty() {
                return Ok(());
            }

            match shape {
                Shape::Named(name) => {
                    let descriptor = self
                        .types
                        .get(name)
                        .ok_or_else(|| RpcError::type_not_found(name))?;
                    self.resolve_one(value, name, selection, ctx).await?;
                    self.resolve_fields(value, Some(name), &descriptor.fields, selection, ctx)
                        .await
                }
                Shape::Object(fields) => {
                    self.resolve_fields(value, None, fields, selection, ctx).await
                }
                Shape::Array(inner) => self.resolve_items(value, inner, selection, ctx).await,
                Shape::Optional(inner) => self.resolve(value, inner, selection, ctx).await,
                _ => Ok(()),
            }
        })
    }

    /// Runs the relation resolvers of `type_name` for every selected relation
    /// field of `item`, one field after another.
    pub async fn resolve_one(
        &self,
        item: &mut Value,
        type_name: &str,
        selection: &Selection,
        ctx: &Context,
    ) -> RpcResult<()> {
        if item.is_null() || selection.is_empty() {
            return Ok(());
        }

        let descriptor = self
            .types
            .get(type_name)
            .ok_or_else(|| RpcError::type_not_found(type_name))?;
        let relations = self
            .resolvers
            .type_resolvers(type_name)
            .ok_or_else(|| RpcError::resolvers_not_found(type_name))?;

        for (field, sub) in selection.iter() {
            let Some(entry) = relations.get(field) else {
                if descriptor.declares(field) {
                    continue;
                }
                return Err(RpcError::invalid_field(field, Some(type_name)));
            };

            trace!(type_name, field, "resolving relation");
            let resolved = entry
                .resolver()
                .resolve(item, ctx)
                .await
                .map_err(|e| {
                    RpcError::from(e)
                        .with_data("type", type_name)
                        .with_data("field", field)
                })?;

            let slot = object_mut(item, type_name)?
                .entry(field.to_string())
                .or_insert(Value::Null);
            *slot = resolved;
            self.resolve(slot, entry.output(), sub.children(), ctx)
                .await?;
        }

        Ok(())
    }

    /// Resolves `selection` on every element of an array concurrently.
    pub async fn resolve_items(
        &self,
        value: &mut Value,
        element: &Shape,
        selection: &Selection,
        ctx: &Context,
    ) -> RpcResult<()> {
        let Value::Array(items) = value else {
            return Err(shape_mismatch("an array", element.describe(), value));
        };

        try_join_all(
            items
                .iter_mut()
                .map(|item| self.resolve(item, element, selection, ctx)),
        )
        .await?;
        Ok(())
    }

    async fn resolve_fields(
        &self,
        value: &mut Value,
        type_name: Option<&str>,
        fields: &IndexMap<String, Shape>,
        selection: &Selection,
        ctx: &Context,
    ) -> RpcResult<()> {
        let relations = type_name.and_then(|name| self.resolvers.type_resolvers(name));
        let is_relation = |field: &str| relations.is_some_and(|r| r.contains_key(field));

        for (field, sub) in selection.iter() {
            if is_relation(field) {
                continue;
            }
            match fields.get(field) {
                None => return Err(RpcError::invalid_field(field, type_name)),
                Some(shape) if is_leaf(shape) && !sub.children().is_empty() => {
                    return Err(RpcError::invalid_field(field, type_name)
                        .with_data("reason", "scalar fields take no nested selection"));
                }
                Some(_) => {}
            }
        }

        let map = object_mut(value, type_name.unwrap_or("object"))?;
        let pending = map.iter_mut().filter_map(|(key, child)| {
            let sub = selection.get(key)?;
            if is_relation(key) {
                return None;
            }
            let shape = fields.get(key).filter(|shape| !shape.is_scalar())?;
            Some(self.resolve(child, shape, sub.children(), ctx))
        });

        try_join_all(pending).await?;
        Ok(())
    }
}

fn object_mut<'v>(
    value: &'v mut Value,
    expected: &str,
) -> RpcResult<&'v mut serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(shape_mismatch("an object", expected.to_string(), other)),
    }
}

/// Scalar shapes, possibly wrapped. `Any` may hold structure and is not a leaf.
fn is_leaf(shape: &Shape) -> bool {
    match shape {
        Shape::Optional(inner) | Shape::Array(inner) => is_leaf(inner),
        Shape::Any => false,
        other => other.is_scalar(),
    }
}

fn shape_mismatch(kind: &str, shape: String, value: &Value) -> RpcError {
    RpcError::new(
        ErrorCode::InvalidOutput,
        format!("expected {kind} for {shape}, got {}", kind_of(value)),
    )
}
