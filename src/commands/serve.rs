use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config;
use crate::hub::bridge::BusBridge;
use crate::hub::Hub;
use crate::orchestrator::lifecycle::Collaborators;
use crate::orchestrator::Orchestrator;
use crate::router::proxy::serve_proxy;
use crate::router::FingerprintRouter;
use crate::server::{control_app, start_control_server};

/// Run every component in one process until Ctrl-C.
pub async fn run(config_file: Option<&Path>) -> Result<()> {
    let loaded = config::load(config_file)?;
    match &loaded.path {
        Some(path) => info!("using config {}", path.display()),
        None => info!("no config file found, using defaults"),
    }
    let config = loaded.config;

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let collab = Collaborators::in_memory();

    let (hub, hub_handle) = Hub::new(config.hub.send_buffer);
    tracker.spawn(hub.run(cancel.clone()));

    let bridge = BusBridge::new(
        collab.bus.as_ref(),
        collab.logs.clone(),
        hub_handle.clone(),
        config.bus.clone(),
    );
    tracker.spawn(bridge.run(cancel.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        loaded.secrets,
        collab.clone(),
        cancel.clone(),
    ));
    orchestrator.start().await;

    if let Some(reconciler) = orchestrator.reconciler() {
        tracker.spawn(reconciler.run(cancel.clone()));
    }

    let router = Arc::new(FingerprintRouter::new(collab.workspaces.clone()));
    let proxy_config = config.proxy.clone();
    let proxy_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = serve_proxy(&proxy_config, router, proxy_cancel).await {
            error!("proxy stopped: {:#}", e);
        }
    });

    let app = control_app(orchestrator.clone(), hub_handle, config.hub.clone());
    let server = start_control_server(&config.server.bind, config.server.port, app, cancel.clone());

    let result = tokio::select! {
        result = server => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nShutting down...");
            Ok(())
        }
    };

    cancel.cancel();
    orchestrator.shutdown().await;
    tracker.close();
    if tokio::time::timeout(Duration::from_secs(10), tracker.wait()).await.is_err() {
        warn!("some tasks did not stop within 10s");
    }
    result
}
