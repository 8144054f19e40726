//! Maps public hostnames to the forwarded port of the workspace behind them.

pub mod proxy;

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::workspace::store::WorkspaceStore;

static SUBDOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z0-9]+)\.").expect("valid regex"));

/// Leading subdomain label of `host`, ignoring any `:port` suffix.
pub fn fingerprint_of(host: &str) -> Option<&str> {
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    SUBDOMAIN_RE
        .captures(host)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[derive(Clone)]
pub struct FingerprintRouter {
    workspaces: Arc<dyn WorkspaceStore>,
}

impl FingerprintRouter {
    pub fn new(workspaces: Arc<dyn WorkspaceStore>) -> Self {
        Self { workspaces }
    }

    /// External port serving the workspace addressed by `host`.
    pub async fn resolve(&self, host: &str) -> Result<u16> {
        let fingerprint = fingerprint_of(host).ok_or_else(|| {
            OrchestratorError::Routing(format!("host '{}' has no workspace subdomain", host))
        })?;
        let workspace = self.workspaces.get_by_fingerprint(fingerprint).await?;
        let config = self.workspaces.get_config(workspace.id).await?;

        match config.worker_port {
            Some(port) if port != 0 => {
                debug!(workspace_id = workspace.id, fingerprint, port, "route resolved");
                Ok(port)
            }
            _ => Err(OrchestratorError::Routing(format!(
                "workspace {} has no forwarded port (status {})",
                workspace.id, workspace.status
            ))),
        }
    }
}
