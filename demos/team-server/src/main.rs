//! Magic RPC Example Server
//!
//! Users and teams with `team`, `leader` and `members` relations.
//!
//! # Running
//! ```bash
//! cargo run -p magic-rpc-team-server -- --port 3000
//! curl -s localhost:3000/json-rpc \
//!   -d '{"method": "getUsers", "selection": {"team": {"leader": 1, "members": 1}}}'
//! ```

mod data;
mod resolvers;
mod schema;

use clap::Parser;
use data::Store;
use magic_rpc_sdk::{RpcResult, RpcServer, ServerConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "team-server", version, about = "Magic RPC example server")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "MAGIC_RPC_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "MAGIC_RPC_PORT", default_value_t = 3000)]
    port: u16,

    /// Path of the RPC endpoint
    #[arg(long, env = "MAGIC_RPC_PATH", default_value = "/json-rpc")]
    path: String,

    /// Disable the method description endpoint
    #[arg(long)]
    no_introspection: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let config = ServerConfig::new()
            .host(self.host.clone())
            .port(self.port)
            .path(self.path.clone());
        if self.no_introspection {
            config.no_introspection()
        } else {
            config
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("ctrl-c received");
}

#[tokio::main]
async fn main() -> RpcResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "magic_rpc=info,team_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    let args = Args::parse();

    let store = Arc::new(Store::with_seed_data());
    info!("Store initialized");

    let handler = resolvers::build_handler(store)?;

    RpcServer::new(handler)
        .config(args.server_config())
        .listen_with_shutdown(shutdown_signal())
        .await
}
