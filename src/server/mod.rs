//! Control server: workspace API and the real-time websocket.

pub mod routes;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::model::HubConfig;
use crate::hub::ws::{ws_router, WsState};
use crate::hub::HubHandle;
use crate::orchestrator::Orchestrator;

use routes::ApiState;

pub fn control_app(orchestrator: Arc<Orchestrator>, hub: HubHandle, hub_config: HubConfig) -> Router {
    routes::api_router(ApiState {
        orchestrator,
        hub: hub.clone(),
    })
    .merge(ws_router(WsState {
        hub,
        config: hub_config,
    }))
    .layer(CorsLayer::permissive())
}

/// Serve `app` on an already bound listener until cancelled.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

pub async fn start_control_server(
    bind: &str,
    port: u16,
    app: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding control server on {}", addr))?;
    info!("control server listening on {}", addr);
    serve(listener, app, cancel).await
}
