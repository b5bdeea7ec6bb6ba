//! Magic RPC server.
//!
//! Serves an [`RpcHandler`] over HTTP/1.1:
//! - `POST /json-rpc`: one payload or a batch of payloads
//! - `GET /health`: health check
//! - `GET /.well-known/magic-rpc`: method and type description

use crate::handler::RpcHandler;
use crate::http::{self, ServerState, WELL_KNOWN_PATH};
use magic_rpc_runtime::{ErrorCode, ResultExt, RpcResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Path of the RPC endpoint.
    pub path: String,
    /// Send CORS headers and answer preflight requests.
    pub cors: bool,
    /// Serve the method and type description.
    pub introspection: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            path: "/json-rpc".to_string(),
            cors: true,
            introspection: true,
        }
    }

    /// Sets the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the RPC endpoint path. A missing leading slash is added.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self
    }

    /// Disables CORS.
    pub fn no_cors(mut self) -> Self {
        self.cors = false;
        self
    }

    /// Disables introspection.
    pub fn no_introspection(mut self) -> Self {
        self.introspection = false;
        self
    }

    /// Returns the socket address to bind.
    pub fn addr(&self) -> RpcResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .map_rpc_err_with(ErrorCode::InternalError, "Invalid address")
    }
}

/// An HTTP server for an [`RpcHandler`].
pub struct RpcServer {
    handler: Arc<RpcHandler>,
    config: ServerConfig,
}

impl RpcServer {
    /// Creates a server with the default configuration.
    pub fn new(handler: RpcHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            config: ServerConfig::default(),
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the handler.
    pub fn handler(&self) -> &RpcHandler {
        &self.handler
    }

    /// Returns the configuration.
    pub fn server_config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the configured address and serves until the process exits.
    pub async fn listen(self) -> RpcResult<()> {
        self.listen_with_shutdown(std::future::pending()).await
    }

    /// Binds the configured address and serves until `signal` resolves.
    pub async fn listen_with_shutdown<S>(self, signal: S) -> RpcResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        let addr = self.config.addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_rpc_err_with(ErrorCode::InternalError, "Failed to bind")?;
        self.serve(listener, signal).await
    }

    /// Serves on an already bound listener until `signal` resolves.
    pub async fn serve<S>(self, listener: TcpListener, signal: S) -> RpcResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        let addr = listener
            .local_addr()
            .map_rpc_err_with(ErrorCode::InternalError, "Failed to read local address")?;

        info!("Listening on http://{}{}", addr, self.config.path);
        if self.config.introspection {
            info!("Introspection: http://{}{}", addr, WELL_KNOWN_PATH);
        }

        let state = Arc::new(ServerState {
            handler: self.handler,
            config: self.config,
        });
        http::serve(state, listener, signal).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.path, "/json-rpc");
        assert!(config.cors);
        assert!(config.introspection);
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::new()
            .host("0.0.0.0")
            .port(8080)
            .path("rpc")
            .no_cors();

        assert_eq!(config.path, "/rpc");
        assert!(!config.cors);
        assert_eq!(config.addr().unwrap().port(), 8080);
        assert!(ServerConfig::new().host("not a host").addr().is_err());
    }
}
