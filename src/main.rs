//! Gateway binary: initializes the core and serves the MCP status surface.
//!
//! The model request/response pipeline is an external collaborator; it
//! consumes [`ziya::StreamingMiddleware`] directly. This binary exposes the
//! health and MCP management endpoints.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ziya::Core;

#[derive(Parser, Debug)]
#[command(name = "ziya-gateway", about = "Streaming gateway with MCP tool integration")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 6060)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let core = Core::initialize().await;

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/mcp/status", get(mcp_status))
        .route("/api/mcp/tools", get(mcp_tools))
        .with_state(Arc::clone(&core));

    let addr = format!("{}:{}", args.host, args.port);
    info!("ziya-gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    core.shutdown().await;
    Ok(())
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn mcp_status(State(core): State<Arc<Core>>) -> Json<Value> {
    Json(json!({
        "enabled": core.mcp_enabled(),
        "servers": core.server_status(),
    }))
}

async fn mcp_tools(State(core): State<Arc<Core>>) -> Json<Value> {
    let tools: Vec<Value> = core
        .secure_tools()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "server": tool.server_name,
            })
        })
        .collect();
    Json(json!({ "tools": tools }))
}
