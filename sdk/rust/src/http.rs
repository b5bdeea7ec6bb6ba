//! Built-in HTTP transport.
//!
//! Routes:
//! - `POST {path}`: one payload or a batch of payloads
//! - `OPTIONS {path}`: CORS preflight
//! - `GET /health`: health check
//! - `GET /.well-known/magic-rpc`: method and type description

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use magic_rpc_runtime::context::data::{RequestId, RequestStartTime};
use magic_rpc_runtime::{ErrorCode, RpcError, SharedContext, TypedContext};
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::handler::RpcHandler;
use crate::protocol::{RpcPayload, RpcRequest, RpcResponse};
use crate::server::ServerConfig;

pub(crate) const WELL_KNOWN_PATH: &str = "/.well-known/magic-rpc";
const HEALTH_PATH: &str = "/health";

pub(crate) type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

/// Shared state of a running server.
pub(crate) struct ServerState {
    pub handler: Arc<RpcHandler>,
    pub config: ServerConfig,
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).boxed()
}

fn with_cors(mut response: Response<BoxBody>, cors: bool) -> Response<BoxBody> {
    if cors {
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        );
    }
    response
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_vec(data).unwrap_or_else(|e| {
        json!({"error": {"message": format!("Failed to encode response: {e}"), "code": ErrorCode::InternalError}})
            .to_string()
            .into_bytes()
    });
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(status: StatusCode, error: RpcError) -> Response<BoxBody> {
    json_response(status, &RpcResponse::Error { error })
}

fn health_response() -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

fn request_context<B>(request: &Request<B>) -> TypedContext {
    let mut ctx = TypedContext::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            ctx.set_header(name.as_str(), value);
        }
    }
    let request_id = ctx
        .header("x-request-id")
        .map(RequestId::new)
        .unwrap_or_else(RequestId::generate);
    ctx.insert(request_id);
    ctx.insert(RequestStartTime::default());
    ctx
}

async fn handle_rpc<B>(state: &ServerState, request: Request<B>) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let ctx = Arc::new(request_context(&request));

    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                RpcError::new(ErrorCode::InvalidPayload, format!("Failed to read body: {e}")),
            );
        }
    };

    let rpc_request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                RpcError::new(ErrorCode::InvalidPayload, format!("Invalid JSON: {e}")),
            );
        }
    };

    match rpc_request {
        RpcRequest::Single(payload) => {
            let response = RpcResponse::from(state.handler.handle(payload, ctx).await);
            json_response(StatusCode::OK, &response)
        }
        RpcRequest::Batch(entries) => {
            let responses = handle_entries(state, entries, ctx).await;
            json_response(StatusCode::OK, &responses)
        }
    }
}

/// Runs the decodable entries of a batch through the handler and answers the
/// others with their decode error, keeping request order.
async fn handle_entries(
    state: &ServerState,
    entries: Vec<Value>,
    ctx: SharedContext,
) -> Vec<RpcResponse> {
    let mut rejected = Vec::with_capacity(entries.len());
    let mut payloads = Vec::with_capacity(entries.len());
    for entry in entries {
        match RpcPayload::from_value(entry) {
            Ok(payload) => {
                payloads.push(payload);
                rejected.push(None);
            }
            Err(err) => {
                debug!(error = %err, "rejecting batch entry");
                rejected.push(Some(err));
            }
        }
    }

    let mut handled = state.handler.handle_batch(payloads, ctx).await.into_iter();
    rejected
        .into_iter()
        .map(|slot| match slot {
            Some(err) => RpcResponse::Error { error: err },
            None => handled
                .next()
                .map_or_else(|| RpcResponse::Error { error: missing_result() }, RpcResponse::from),
        })
        .collect()
}

fn missing_result() -> RpcError {
    RpcError::new(ErrorCode::InternalError, "batch entry produced no result")
}

/// Routes one request.
pub(crate) async fn route<B>(state: &ServerState, request: Request<B>) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let config = &state.config;
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    debug!(%method, %path, "http request");

    let response = match (&method, path.as_str()) {
        (&Method::POST, p) if p == config.path => handle_rpc(state, request).await,
        (&Method::OPTIONS, p) if p == config.path && config.cors => {
            let mut response = Response::new(full(""));
            *response.status_mut() = StatusCode::NO_CONTENT;
            response
        }
        (&Method::GET, HEALTH_PATH) => health_response(),
        (&Method::GET, WELL_KNOWN_PATH) if config.introspection => {
            json_response(StatusCode::OK, &state.handler.describe())
        }
        _ => error_response(
            StatusCode::NOT_FOUND,
            RpcError::new(ErrorCode::NotFound, "Not Found").with_data("path", path.as_str()),
        ),
    };

    with_cors(response, config.cors)
}

/// Accepts connections until `shutdown` resolves.
pub(crate) async fn serve<S>(
    state: Arc<ServerState>,
    listener: TcpListener,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(route(&state, request).await) }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magic_rpc_runtime::Shape;

    fn state(config: ServerConfig) -> ServerState {
        let handler = RpcHandler::builder()
            .method(
                "echo",
                Shape::object([("text", Shape::String)]),
                Shape::object([("text", Shape::String), ("requestId", Shape::String)]),
                |params, ctx| async move {
                    let request_id = ctx
                        .data::<RequestId>()
                        .map(|id| id.as_str().to_string())
                        .unwrap_or_default();
                    Ok(json!({"text": params.input["text"], "requestId": request_id}))
                },
            )
            .build()
            .unwrap();
        ServerState {
            handler: Arc::new(handler),
            config,
        }
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .header("x-request-id", "req-test")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<BoxBody>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_single_payload() {
        let state = state(ServerConfig::default());
        let response = route(
            &state,
            request(Method::POST, "/json-rpc", r#"{"method": "echo", "input": {"text": "hi"}}"#),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        assert_eq!(
            body_json(response).await,
            json!({"result": {"text": "hi", "requestId": "req-test"}})
        );
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let state = state(ServerConfig::default());
        let body = r#"[
            {"method": "echo", "input": {"text": "a"}},
            {"method": "nope"},
            {"method": "echo", "input": {"text": "c"}}
        ]"#;
        let response = route(&state, request(Method::POST, "/json-rpc", body)).await;
        let json = body_json(response).await;

        assert_eq!(json[0]["result"]["text"], "a");
        assert_eq!(json[1]["error"]["code"], "INVALID_METHOD");
        assert_eq!(json[2]["result"]["text"], "c");
    }

    #[tokio::test]
    async fn test_malformed_batch_entry_fails_alone() {
        let state = state(ServerConfig::default());
        let body = r#"[
            {"method": "echo", "input": {"text": "a"}},
            {"method": 7},
            "echo",
            {"method": "echo", "input": {"text": "d"}}
        ]"#;
        let response = route(&state, request(Method::POST, "/json-rpc", body)).await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 4);
        assert_eq!(json[0]["result"]["text"], "a");
        assert_eq!(json[1]["error"]["code"], "INVALID_PAYLOAD");
        assert_eq!(json[2]["error"]["code"], "INVALID_PAYLOAD");
        assert_eq!(json[3]["result"]["text"], "d");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let state = state(ServerConfig::default());
        let response = route(&state, request(Method::POST, "/json-rpc", "{not json")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn test_health_and_introspection() {
        let shown = state(ServerConfig::default());

        let health = body_json(route(&shown, request(Method::GET, "/health", "")).await).await;
        assert_eq!(health["status"], "ok");
        assert!(health["timestamp"].as_str().is_some());

        let doc = body_json(route(&shown, request(Method::GET, WELL_KNOWN_PATH, "")).await).await;
        assert!(doc["methods"]["echo"].is_object());

        let hidden = state(ServerConfig::default().no_introspection());
        let response = route(&hidden, request(Method::GET, WELL_KNOWN_PATH, "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preflight_and_custom_path() {
        let state = state(ServerConfig::default().path("/rpc"));

        let preflight = route(&state, request(Method::OPTIONS, "/rpc", "")).await;
        assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
        assert!(preflight
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));

        let old = route(&state, request(Method::POST, "/json-rpc", "{}")).await;
        assert_eq!(old.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_disabled() {
        let state = state(ServerConfig::default().no_cors());
        let response = route(&state, request(Method::GET, "/health", "")).await;
        assert!(!response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }
}
