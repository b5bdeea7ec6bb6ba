//! Magic RPC client.
//!
//! Posts payloads to a Magic RPC endpoint and turns `{"error": ..}` envelopes
//! back into [`RpcError`]s. Given a [`Validator`] and the output shape of a
//! method, results of that method are masked and coerced before they are
//! returned.
//!
//! ```ignore
//! use magic_rpc_sdk::{ClientConfig, RpcClient, RpcPayload};
//!
//! let client = RpcClient::new(ClientConfig::new("http://127.0.0.1:3000/json-rpc"));
//! let user = client
//!     .call(RpcPayload::new("getUser").input(json!({"id": "1"})).selection_value(json!({"team": 1})))
//!     .await?;
//! ```

use crate::protocol::RpcPayload;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use magic_rpc_runtime::{
    ErrorCode, ResultExt, RpcError, RpcResult, Shape, ValidateOptions, Validator,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// URL of the RPC endpoint.
    pub url: String,
    /// Timeout for one request, including reading the response body.
    pub timeout: Duration,
    /// Headers sent with every request.
    pub headers: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_millis(5000),
            headers: HashMap::new(),
        }
    }
}

impl ClientConfig {
    /// Creates a new config with a URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Sets the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds a default header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// An HTTP client for a Magic RPC endpoint.
#[derive(Clone)]
pub struct RpcClient {
    config: ClientConfig,
    http: Client<HttpConnector, Full<Bytes>>,
    validator: Option<Arc<dyn Validator>>,
    outputs: HashMap<String, Shape>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Creates a client.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            http: Client::builder(TokioExecutor::new()).build_http(),
            validator: None,
            outputs: HashMap::new(),
        }
    }

    /// Sets the validator used for declared outputs.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Declares the output shape of `method`. Results of the method are masked
    /// and coerced to it when a validator is set.
    pub fn output(mut self, method: impl Into<String>, shape: Shape) -> Self {
        self.outputs.insert(method.into(), shape);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Calls one method.
    pub async fn call(&self, payload: RpcPayload) -> RpcResult<Value> {
        let body = serde_json::to_vec(&payload)
            .map_rpc_err_with(ErrorCode::InvalidPayload, "Failed to encode payload")?;
        let envelope = Envelope::decode(self.post(body).await?)?;
        self.check_output(payload.method.as_deref(), envelope.into_result()?)
    }

    /// Calls one method and decodes its result.
    pub async fn call_as<T: DeserializeOwned>(&self, payload: RpcPayload) -> RpcResult<T> {
        let value = self.call(payload).await?;
        serde_json::from_value(value)
            .map_rpc_err_with(ErrorCode::InvalidResponse, "Failed to decode result")
    }

    /// Sends several calls in one request. Each entry succeeds or fails on its
    /// own; the outer error covers the transport and a rejected request.
    pub async fn batch(&self, payloads: Vec<RpcPayload>) -> RpcResult<Vec<RpcResult<Value>>> {
        let body = serde_json::to_vec(&payloads)
            .map_rpc_err_with(ErrorCode::InvalidPayload, "Failed to encode payload")?;
        let entries = match self.post(body).await? {
            Value::Array(entries) => entries,
            other => {
                return Err(match Envelope::decode(other)?.into_result() {
                    Err(e) => e,
                    Ok(_) => RpcError::new(
                        ErrorCode::InvalidResponse,
                        "Expected an array in response to a batch",
                    ),
                })
            }
        };
        if entries.len() != payloads.len() {
            return Err(RpcError::new(
                ErrorCode::InvalidResponse,
                format!(
                    "Batch of {} answered with {} entries",
                    payloads.len(),
                    entries.len()
                ),
            ));
        }

        Ok(entries
            .into_iter()
            .zip(&payloads)
            .map(|(entry, payload)| {
                let result = Envelope::decode(entry)?.into_result()?;
                self.check_output(payload.method.as_deref(), result)
            })
            .collect())
    }

    async fn post(&self, body: Vec<u8>) -> RpcResult<Value> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.config.url.as_str())
            .header(CONTENT_TYPE, "application/json");
        for (key, value) in &self.config.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        let request = builder
            .body(Full::new(Bytes::from(body)))
            .map_rpc_err_with(ErrorCode::InvalidPayload, "Failed to build request")?;

        let exchange = async {
            let response = self
                .http
                .request(request)
                .await
                .map_rpc_err_with(ErrorCode::ConnectionFailed, "Request failed")?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_rpc_err_with(ErrorCode::ConnectionFailed, "Failed to read response")?
                .to_bytes();
            Ok::<_, RpcError>((status, bytes))
        };
        let (status, bytes) = tokio::time::timeout(self.config.timeout, exchange)
            .await
            .map_err(|_| {
                RpcError::new(
                    ErrorCode::Timeout,
                    format!("Request timed out after {}ms", self.config.timeout.as_millis()),
                )
            })??;

        debug!(url = %self.config.url, %status, bytes = bytes.len(), "rpc response");
        serde_json::from_slice(&bytes).map_err(|e| invalid_status(status, &e))
    }

    fn check_output(&self, method: Option<&str>, result: Value) -> RpcResult<Value> {
        let (Some(validator), Some(shape)) =
            (&self.validator, method.and_then(|m| self.outputs.get(m)))
        else {
            return Ok(result);
        };
        let masked = validator.mask(result, shape);
        validator
            .validate(masked, shape, ValidateOptions::coerce())
            .map_err(|e| e.into_rpc_error(ErrorCode::InvalidResponse, "Response validation error"))
    }
}

fn invalid_status(status: StatusCode, cause: &serde_json::Error) -> RpcError {
    RpcError::new(
        ErrorCode::InvalidResponse,
        format!("HTTP error! status: {}", status.as_u16()),
    )
    .with_data("cause", cause.to_string())
}

/// One `{"result": ..}` or `{"error": ..}` answer.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

/// Keeps an explicit `null` result apart from a missing one.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    fn decode(value: Value) -> RpcResult<Self> {
        serde_json::from_value(value)
            .map_rpc_err_with(ErrorCode::InvalidResponse, "Malformed response")
    }

    fn into_result(self) -> RpcResult<Value> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error.into_rpc_error()),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(RpcError::new(
                ErrorCode::InvalidResponse,
                "Response carries neither result nor error",
            )),
        }
    }
}

impl WireError {
    /// Unknown codes from newer servers read as `INTERNAL_ERROR`.
    fn into_rpc_error(self) -> RpcError {
        let code = self
            .code
            .and_then(|code| serde_json::from_value(code).ok())
            .unwrap_or(ErrorCode::InternalError);
        let mut error = RpcError::new(code, self.message);
        error.data = self.data;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RpcHandler;
    use crate::server::RpcServer;
    use magic_rpc_runtime::{ShapeValidator, TypeRegistry};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn spawn_server() -> (String, oneshot::Sender<()>) {
        let handler = RpcHandler::builder()
            .method("count", Shape::Any, Shape::Any, |_, _| async move {
                Ok(json!({"count": "3", "extra": true}))
            })
            .method("nothing", Shape::Any, Shape::Any, |_, _| async move {
                Ok(Value::Null)
            })
            .method("fail", Shape::Any, Shape::Any, |_, _| async move {
                Err(RpcError::not_found("Widget 9"))
            })
            .method("slow", Shape::Any, Shape::Any, |_, _| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("late"))
            })
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(RpcServer::new(handler).serve(listener, async move {
            let _ = stopped.await;
        }));
        (format!("http://{addr}/json-rpc"), stop)
    }

    #[test]
    fn test_client_config() {
        let config = ClientConfig::new("http://localhost:3000/json-rpc")
            .timeout(Duration::from_secs(1))
            .header("authorization", "Bearer t");

        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.headers["authorization"], "Bearer t");
        assert_eq!(ClientConfig::default().timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_error_envelope_decoding() {
        let envelope = Envelope::decode(json!({
            "error": {"message": "Invalid field 'x'", "code": "INVALID_FIELD", "data": {"field": "x"}}
        }))
        .unwrap();
        let err = envelope.into_result().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidField);
        assert_eq!(err.data.unwrap()["field"], "x");

        let err = Envelope::decode(json!({"error": {"message": "odd", "code": "SOMETHING_NEW"}}))
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert_eq!(err.message, "odd");

        let result = Envelope::decode(json!({"result": null})).unwrap().into_result();
        assert_eq!(result.unwrap(), Value::Null);
        let err = Envelope::decode(json!({})).unwrap().into_result().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidResponse);
    }

    #[tokio::test]
    async fn test_call_and_error_mapping() {
        let (url, _stop) = spawn_server().await;
        let client = RpcClient::new(ClientConfig::new(url));

        let value = client.call(RpcPayload::new("count")).await.unwrap();
        assert_eq!(value, json!({"count": "3", "extra": true}));
        assert_eq!(client.call(RpcPayload::new("nothing")).await.unwrap(), Value::Null);

        let err = client.call(RpcPayload::new("fail")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.is_input_error());

        let err = client.call(RpcPayload::new("missing")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidMethod);
    }

    #[tokio::test]
    async fn test_declared_output_is_masked_and_coerced() {
        let (url, _stop) = spawn_server().await;
        let client = RpcClient::new(ClientConfig::new(url))
            .validator(Arc::new(ShapeValidator::new(Arc::new(TypeRegistry::new()))))
            .output("count", Shape::object([("count", Shape::Integer)]));

        let value = client.call(RpcPayload::new("count")).await.unwrap();
        assert_eq!(value, json!({"count": 3}));

        let count: HashMap<String, i64> = client.call_as(RpcPayload::new("count")).await.unwrap();
        assert_eq!(count["count"], 3);

        let strict = client.clone().output("count", Shape::object([("count", Shape::Boolean)]));
        let err = strict.call(RpcPayload::new("count")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidResponse);
    }

    #[tokio::test]
    async fn test_batch_entries_fail_alone() {
        let (url, _stop) = spawn_server().await;
        let client = RpcClient::new(ClientConfig::new(url))
            .validator(Arc::new(ShapeValidator::new(Arc::new(TypeRegistry::new()))))
            .output("count", Shape::object([("count", Shape::Integer)]));

        let results = client
            .batch(vec![
                RpcPayload::new("count"),
                RpcPayload::new("fail"),
                RpcPayload::new("nothing"),
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &json!({"count": 3}));
        assert_eq!(results[1].as_ref().unwrap_err().code, ErrorCode::NotFound);
        assert_eq!(results[2].as_ref().unwrap(), &Value::Null);
    }

    #[tokio::test]
    async fn test_timeout() {
        let (url, _stop) = spawn_server().await;
        let client = RpcClient::new(ClientConfig::new(url).timeout(Duration::from_millis(50)));

        let err = client.call(RpcPayload::new("slow")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(err.is_server_error());
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RpcClient::new(ClientConfig::new(format!("http://{addr}/json-rpc")));
        let err = client.call(RpcPayload::new("count")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionFailed);
    }
}
