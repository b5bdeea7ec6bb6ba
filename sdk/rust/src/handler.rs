//! Method dispatch.
//!
//! [`RpcHandler`] owns the method contracts, their handlers and everything the
//! data resolver needs. Each call gets a fresh [`Context`] with its own
//! loaders, so loader caches never leak between requests.

use crate::protocol::RpcPayload;
use futures::future::{join_all, FutureExt};
use indexmap::IndexMap;
use magic_rpc_runtime::dataloader::{BatchResult, BatchWindow, DataLoader, ValueBatchFn};
use magic_rpc_runtime::{
    Context, DataResolver, ErrorCode, LoaderSet, ResolverTable, RpcError, RpcResult, Selection,
    SharedContext, Shape, ShapeValidator, TypeDescriptor, TypeRegistry, TypedContext,
    ValidateOptions, Validator,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, debug_span, error, Instrument};

/// Future returned by a method handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = RpcResult<Value>> + Send>>;

/// A type-erased method handler.
pub type HandlerFn = Arc<dyn Fn(MethodParams, Context) -> HandlerFuture + Send + Sync>;

/// Builds loaders from the caller-supplied request data.
pub type LoaderFactory = Arc<dyn Fn(&TypedContext) -> LoaderSet + Send + Sync>;

/// Builds loaders that may wrap the loaders built before them.
pub type CustomLoaderFactory = Arc<dyn Fn(&TypedContext, &LoaderSet) -> LoaderSet + Send + Sync>;

/// Called once for every failed call.
pub type ErrorCallback = Arc<dyn Fn(&RpcError, &RpcPayload, &Context) + Send + Sync>;

/// Parameters passed to a method handler.
#[derive(Debug, Clone)]
pub struct MethodParams {
    /// Validated input.
    pub input: Value,
    /// Selection supplied by the caller.
    pub selection: Option<Selection>,
}

impl MethodParams {
    /// Deserializes the input into a typed value.
    pub fn input_as<T: DeserializeOwned>(&self) -> RpcResult<T> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| RpcError::input(ErrorCode::InvalidInput, format!("Invalid input: {e}")))
    }
}

/// Input and output shapes of a method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodContract {
    /// Method name.
    pub name: String,
    /// Input shape.
    pub input: Shape,
    /// Output shape.
    pub output: Shape,
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Validate input against the method's input shape.
    pub validate_input: bool,
    /// Coerce input while validating.
    pub coerce_input: bool,
    /// Validate output against the method's output shape.
    pub validate_output: bool,
    /// Strip undeclared fields from the output.
    pub mask_output: bool,
    /// Batching window of the per-request type loaders.
    pub batch_window: BatchWindow,
    /// Maximum keys per batch of the per-request type loaders.
    pub max_batch_size: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerConfig {
    /// Creates a config with every check enabled.
    pub fn new() -> Self {
        Self {
            validate_input: true,
            coerce_input: true,
            validate_output: true,
            mask_output: true,
            batch_window: BatchWindow::Yield,
            max_batch_size: 100,
        }
    }

    /// Disables input validation.
    pub fn no_input_validation(mut self) -> Self {
        self.validate_input = false;
        self
    }

    /// Disables input coercion.
    pub fn no_coercion(mut self) -> Self {
        self.coerce_input = false;
        self
    }

    /// Disables output validation.
    pub fn no_output_validation(mut self) -> Self {
        self.validate_output = false;
        self
    }

    /// Disables output masking.
    pub fn no_masking(mut self) -> Self {
        self.mask_output = false;
        self
    }

    /// Sets the loader batching window.
    pub fn batch_window(mut self, window: BatchWindow) -> Self {
        self.batch_window = window;
        self
    }

    /// Sets the loader batch size.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }
}

/// Builder for [`RpcHandler`].
#[derive(Default)]
pub struct RpcHandlerBuilder {
    contracts: IndexMap<String, MethodContract>,
    handlers: IndexMap<String, HandlerFn>,
    types: Option<TypeRegistry>,
    resolvers: Option<ResolverTable>,
    type_loaders: IndexMap<String, ValueBatchFn>,
    create_loaders: Option<LoaderFactory>,
    create_custom_loaders: Option<CustomLoaderFactory>,
    on_error: Option<ErrorCallback>,
    validator: Option<Arc<dyn Validator>>,
    config: HandlerConfig,
}

impl RpcHandlerBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a method contract.
    pub fn contract(mut self, name: impl Into<String>, input: Shape, output: Shape) -> Self {
        let name = name.into();
        self.contracts.insert(
            name.clone(),
            MethodContract {
                name,
                input,
                output,
            },
        );
        self
    }

    /// Binds a handler to a declared method.
    pub fn handler<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(MethodParams, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Value>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Arc::new(move |params, ctx| f(params, ctx).boxed()));
        self
    }

    /// Declares a method and binds its handler.
    pub fn method<F, Fut>(self, name: impl Into<String>, input: Shape, output: Shape, f: F) -> Self
    where
        F: Fn(MethodParams, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Value>> + Send + 'static,
    {
        let name = name.into();
        self.contract(name.clone(), input, output).handler(name, f)
    }

    /// Sets the type registry.
    pub fn types(mut self, types: TypeRegistry) -> Self {
        self.types = Some(types);
        self
    }

    /// Registers one named type.
    pub fn type_def(mut self, descriptor: TypeDescriptor) -> Self {
        self.types
            .get_or_insert_with(TypeRegistry::new)
            .register(descriptor);
        self
    }

    /// Sets the resolver table.
    pub fn resolvers(mut self, resolvers: ResolverTable) -> Self {
        self.resolvers = Some(resolvers);
        self
    }

    /// Registers the batch function of a registered type. Every request gets
    /// its own loader named after the type.
    pub fn type_loader<F, Fut>(mut self, type_name: impl Into<String>, batch_fn: F) -> Self
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult<String, Value>> + Send + 'static,
    {
        self.type_loaders
            .insert(type_name.into(), Arc::new(move |keys| batch_fn(keys).boxed()));
        self
    }

    /// Sets the factory for additional per-request loaders.
    pub fn create_loaders<F>(mut self, f: F) -> Self
    where
        F: Fn(&TypedContext) -> LoaderSet + Send + Sync + 'static,
    {
        self.create_loaders = Some(Arc::new(f));
        self
    }

    /// Sets the factory for loaders built on top of the other loaders.
    pub fn create_custom_loaders<F>(mut self, f: F) -> Self
    where
        F: Fn(&TypedContext, &LoaderSet) -> LoaderSet + Send + Sync + 'static,
    {
        self.create_custom_loaders = Some(Arc::new(f));
        self
    }

    /// Sets the error callback.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&RpcError, &RpcPayload, &Context) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Replaces the default shape validator.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Checks every registration and builds the handler.
    pub fn build(self) -> RpcResult<RpcHandler> {
        let types = self.types.unwrap_or_default();
        types.validate()?;

        if let Some(name) = self
            .handlers
            .keys()
            .find(|name| !self.contracts.contains_key(*name))
        {
            return Err(registration_error(format!(
                "handler registered for unknown method '{name}'"
            )));
        }

        for contract in self.contracts.values() {
            types.check_shape(&contract.input, &format!("input of method '{}'", contract.name))?;
            types.check_shape(&contract.output, &format!("output of method '{}'", contract.name))?;
        }

        if let Some(resolvers) = &self.resolvers {
            resolvers.validate(&types)?;
        }

        if let Some(name) = self.type_loaders.keys().find(|name| !types.contains(name)) {
            return Err(registration_error(format!(
                "loader registered for unknown type '{name}'"
            )));
        }

        let types = Arc::new(types);
        let has_types = !types.is_empty();
        let resolvers = self.resolvers.map(Arc::new);

        let validator = self.validator.unwrap_or_else(|| {
            let validator = ShapeValidator::new(Arc::clone(&types));
            Arc::new(match &resolvers {
                Some(table) => validator.with_relations(table),
                None => validator,
            })
        });

        let data_resolver = resolvers
            .filter(|_| has_types)
            .map(|table| DataResolver::new(Arc::clone(&types), table));

        debug!(
            methods = self.contracts.len(),
            types = types.len(),
            "rpc handler built"
        );

        Ok(RpcHandler {
            contracts: self.contracts,
            handlers: self.handlers,
            types,
            data_resolver,
            type_loaders: self.type_loaders,
            create_loaders: self.create_loaders,
            create_custom_loaders: self.create_custom_loaders,
            on_error: self.on_error,
            validator,
            config: self.config,
        })
    }
}

fn registration_error(message: String) -> RpcError {
    RpcError::new(ErrorCode::InvalidRegistration, message)
}

/// Dispatches payloads to method handlers.
pub struct RpcHandler {
    contracts: IndexMap<String, MethodContract>,
    handlers: IndexMap<String, HandlerFn>,
    types: Arc<TypeRegistry>,
    data_resolver: Option<DataResolver>,
    type_loaders: IndexMap<String, ValueBatchFn>,
    create_loaders: Option<LoaderFactory>,
    create_custom_loaders: Option<CustomLoaderFactory>,
    on_error: Option<ErrorCallback>,
    validator: Arc<dyn Validator>,
    config: HandlerConfig,
}

impl RpcHandler {
    /// Creates a new builder.
    pub fn builder() -> RpcHandlerBuilder {
        RpcHandlerBuilder::new()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Returns the declared method names.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }

    /// Gets the contract of a method.
    pub fn contract(&self, name: &str) -> Option<&MethodContract> {
        self.contracts.get(name)
    }

    /// Returns true if a handler is bound to the method.
    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Handles one payload.
    pub async fn handle(&self, payload: RpcPayload, data: SharedContext) -> RpcResult<Value> {
        let method = payload.method.clone().unwrap_or_default();
        let span = debug_span!("rpc.handle", method = %method);

        let (contract, handler) = match self.lookup(&payload) {
            Ok(found) => found,
            Err(err) => {
                let ctx = Context::new(LoaderSet::new(), data);
                span.in_scope(|| self.report(&err, &payload, &ctx));
                return Err(err);
            }
        };

        let ctx = self.create_context(data);
        let result = self
            .execute(contract, handler, &payload, &ctx)
            .instrument(span.clone())
            .await;

        if let Err(err) = &result {
            span.in_scope(|| self.report(err, &payload, &ctx));
        }
        result
    }

    /// Handles several payloads concurrently. Every payload succeeds or fails
    /// on its own; results are in payload order.
    pub async fn handle_batch(
        &self,
        payloads: Vec<RpcPayload>,
        data: SharedContext,
    ) -> Vec<RpcResult<Value>> {
        debug!(size = payloads.len(), "handling batch");
        join_all(
            payloads
                .into_iter()
                .map(|payload| self.handle(payload, Arc::clone(&data))),
        )
        .await
    }

    /// Describes methods and types as JSON.
    pub fn describe(&self) -> Value {
        let methods: Map<String, Value> = self
            .contracts
            .values()
            .map(|contract| {
                (
                    contract.name.clone(),
                    json!({
                        "input": contract.input,
                        "output": contract.output,
                        "implemented": self.has_handler(&contract.name),
                    }),
                )
            })
            .collect();

        let types: Map<String, Value> = self
            .types
            .iter()
            .map(|descriptor| {
                let relations: Map<String, Value> = self
                    .data_resolver
                    .as_ref()
                    .and_then(|resolver| resolver.resolvers().type_resolvers(&descriptor.name))
                    .into_iter()
                    .flatten()
                    .map(|(field, entry)| (field.clone(), json!(entry.output())))
                    .collect();
                (
                    descriptor.name.clone(),
                    json!({ "fields": descriptor.fields, "relations": relations }),
                )
            })
            .collect();

        json!({ "methods": methods, "types": types })
    }

    fn lookup(&self, payload: &RpcPayload) -> RpcResult<(&MethodContract, &HandlerFn)> {
        let method = payload
            .method
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(RpcError::missing_method)?;
        let contract = self
            .contracts
            .get(method)
            .ok_or_else(|| RpcError::invalid_method(method))?;
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| RpcError::not_implemented(method))?;
        Ok((contract, handler))
    }

    fn create_context(&self, data: SharedContext) -> Context {
        let mut loaders = LoaderSet::new();
        for (name, batch_fn) in &self.type_loaders {
            let loader = DataLoader::from_batch_fn(Arc::clone(batch_fn))
                .batch_size(self.config.max_batch_size)
                .window(self.config.batch_window);
            loaders.insert(name.clone(), loader);
        }
        if let Some(factory) = &self.create_loaders {
            loaders.merge(factory(&data));
        }
        if let Some(factory) = &self.create_custom_loaders {
            let custom = factory(&data, &loaders);
            loaders.merge(custom);
        }
        Context::new(loaders, data)
    }

    async fn execute(
        &self,
        contract: &MethodContract,
        handler: &HandlerFn,
        payload: &RpcPayload,
        ctx: &Context,
    ) -> RpcResult<Value> {
        let selection = payload.parse_selection()?;

        let input = match (&payload.input, &contract.input) {
            (Value::Null, Shape::Object(_)) => Value::Object(Map::new()),
            (input, _) => input.clone(),
        };
        let input = self.check_input(input, &contract.input)?;

        debug!("invoking handler");
        let params = MethodParams {
            input,
            selection: selection.clone(),
        };
        let mut result = handler(params, ctx.clone()).await?;

        if let (Some(selection), Some(resolver)) = (&selection, &self.data_resolver) {
            resolver
                .resolve(&mut result, &contract.output, selection, ctx)
                .await?;
        }

        self.check_output(result, &contract.output)
    }

    fn check_input(&self, input: Value, shape: &Shape) -> RpcResult<Value> {
        if !self.config.validate_input {
            return Ok(input);
        }
        let options = if self.config.coerce_input {
            ValidateOptions::coerce()
        } else {
            ValidateOptions::strict()
        };
        self.validator
            .validate(input, shape, options)
            .map_err(|e| e.into_rpc_error(ErrorCode::InvalidInput, "Input validation error"))
    }

    fn check_output(&self, output: Value, shape: &Shape) -> RpcResult<Value> {
        let output = if self.config.mask_output {
            self.validator.mask(output, shape)
        } else {
            output
        };
        if !self.config.validate_output {
            return Ok(output);
        }
        self.validator
            .validate(output, shape, ValidateOptions::coerce())
            .map_err(|e| e.into_rpc_error(ErrorCode::InvalidOutput, "Output validation error"))
    }

    fn report(&self, err: &RpcError, payload: &RpcPayload, ctx: &Context) {
        if err.is_server_error() {
            error!(code = %err.code, error = %err, "rpc call failed");
        } else {
            debug!(code = %err.code, error = %err, "rpc call rejected");
        }
        if let Some(callback) = &self.on_error {
            callback(err, payload, ctx);
        }
    }
}

impl fmt::Debug for RpcHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHandler")
            .field("methods", &self.contracts.keys().collect::<Vec<_>>())
            .field("types", &self.types.names().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magic_rpc_runtime::{FnResolver, LoaderResolver};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn echo() -> RpcHandler {
        RpcHandler::builder()
            .method(
                "echo",
                Shape::object([("text", Shape::String)]),
                Shape::object([("text", Shape::String)]),
                |params, _ctx| async move { Ok(params.input) },
            )
            .contract("later", Shape::empty_object(), Shape::Any)
            .build()
            .unwrap()
    }

    fn data() -> SharedContext {
        Arc::new(TypedContext::new())
    }

    #[tokio::test]
    async fn test_missing_and_unknown_methods() {
        let handler = echo();

        let err = handler.handle(RpcPayload::default(), data()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPayload);

        let err = handler
            .handle(RpcPayload::new("shout"), data())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidMethod);
        assert!(err.is_input_error());

        let err = handler
            .handle(RpcPayload::new("later"), data())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotImplemented);
        assert!(err.is_server_error());
    }

    #[tokio::test]
    async fn test_input_is_validated_and_coerced() {
        let handler = echo();

        let result = handler
            .handle(RpcPayload::new("echo").input(json!({"text": 42})), data())
            .await
            .unwrap();
        assert_eq!(result, json!({"text": "42"}));

        let err = handler
            .handle(RpcPayload::new("echo").input(json!({"text": "hi", "loud": true})), data())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.starts_with("Input validation error"));
    }

    #[tokio::test]
    async fn test_output_is_masked_and_validated() {
        let handler = RpcHandler::builder()
            .method(
                "me",
                Shape::empty_object(),
                Shape::object([("id", Shape::String)]),
                |_params, _ctx| async move { Ok(json!({"id": "1", "password": "hunter2"})) },
            )
            .method(
                "broken",
                Shape::empty_object(),
                Shape::object([("id", Shape::String)]),
                |_params, _ctx| async move { Ok(json!({"id": ["1"]})) },
            )
            .build()
            .unwrap();

        let me = handler.handle(RpcPayload::new("me"), data()).await.unwrap();
        assert_eq!(me, json!({"id": "1"}));

        let err = handler
            .handle(RpcPayload::new("broken"), data())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOutput);
        assert!(err.is_server_error());
    }

    #[tokio::test]
    async fn test_on_error_called_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let handler = RpcHandler::builder()
            .method("fail", Shape::empty_object(), Shape::Any, |_params, _ctx| async move {
                Err(RpcError::new(ErrorCode::HandlerError, "boom"))
            })
            .on_error(move |err, payload, _ctx| {
                recorded
                    .lock()
                    .unwrap()
                    .push((err.code, payload.method.clone()));
            })
            .build()
            .unwrap();

        let _ = handler.handle(RpcPayload::new("fail"), data()).await;
        let _ = handler.handle(RpcPayload::new("missing"), data()).await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (ErrorCode::HandlerError, Some("fail".to_string())),
                (ErrorCode::InvalidMethod, Some("missing".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_loader_factories_and_request_data() {
        let handler = RpcHandler::builder()
            .type_def(TypeDescriptor::new("Team").field("id", Shape::String))
            .type_loader("Team", |keys: Vec<String>| async move {
                Ok(keys
                    .into_iter()
                    .map(|k| (k.clone(), json!({"id": k})))
                    .collect::<HashMap<_, _>>())
            })
            .create_custom_loaders(|_data, loaders| {
                let teams = loaders.get("Team").cloned();
                let mut custom = LoaderSet::new();
                if let Some(teams) = teams {
                    custom.insert("DefaultTeam", teams);
                }
                custom
            })
            .method("whoami", Shape::empty_object(), Shape::Any, |_params, ctx| async move {
                let team = ctx.load("DefaultTeam", "team1").await?;
                Ok::<_, RpcError>(json!({
                    "tenant": ctx.header("x-tenant"),
                    "team": team,
                    "loaders": ctx.loaders().names().collect::<Vec<_>>(),
                }))
            })
            .build()
            .unwrap();

        let data = Arc::new(TypedContext::new().with_header("X-Tenant", "acme"));
        let result = handler.handle(RpcPayload::new("whoami"), data).await.unwrap();
        assert_eq!(result["tenant"], "acme");
        assert_eq!(result["team"], json!({"id": "team1"}));
        assert_eq!(result["loaders"], json!(["Team", "DefaultTeam"]));
    }

    #[test]
    fn test_build_rejects_bad_registrations() {
        let err = RpcHandler::builder()
            .handler("ghost", |_params, _ctx| async move { Ok(Value::Null) })
            .build()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRegistration);
        assert!(err.message.contains("ghost"));

        let err = RpcHandler::builder()
            .contract("getUser", Shape::empty_object(), Shape::named("User"))
            .build()
            .unwrap_err();
        assert!(err.message.contains("output of method 'getUser'"));

        let err = RpcHandler::builder()
            .type_def(TypeDescriptor::new("User").field("teamId", Shape::String))
            .resolvers(ResolverTable::new().field(
                "Account",
                "owner",
                Shape::named("User"),
                FnResolver::new(|_, _| Ok(Value::Null)),
            ))
            .build()
            .unwrap_err();
        assert!(err.message.contains("unknown type 'Account'"));

        let err = RpcHandler::builder()
            .type_def(TypeDescriptor::new("User"))
            .type_loader("Team", |_keys: Vec<String>| async move { Ok(HashMap::new()) })
            .build()
            .unwrap_err();
        assert!(err.message.contains("loader registered for unknown type 'Team'"));
    }

    #[test]
    fn test_describe() {
        let handler = RpcHandler::builder()
            .type_def(TypeDescriptor::new("User").field("teamId", Shape::String))
            .type_def(TypeDescriptor::new("Team").field("id", Shape::String))
            .resolvers(
                ResolverTable::new()
                    .field("User", "team", Shape::named("Team"), LoaderResolver::new("Team", "teamId"))
                    .declare("Team"),
            )
            .contract("getUser", Shape::empty_object(), Shape::named("User"))
            .build()
            .unwrap();

        let doc = handler.describe();
        assert_eq!(doc["methods"]["getUser"]["implemented"], false);
        assert_eq!(doc["methods"]["getUser"]["output"], json!({"type": "named", "of": "User"}));
        assert_eq!(doc["types"]["User"]["relations"]["team"]["of"], "Team");
        assert_eq!(doc["types"]["Team"]["relations"], json!({}));
        assert_eq!(handler.methods().collect::<Vec<_>>(), vec!["getUser"]);
        assert!(!handler.has_handler("getUser"));
    }
}
