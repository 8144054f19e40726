//! Periodic sync of workspace status with what the provisioner reports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workspace::store::WorkspaceStore;
use crate::workspace::WorkspaceStatus;

use super::dispatcher::Dispatcher;
use super::lifecycle::Lifecycle;

pub const DETECTED_RUNNING: &str = "Workspace detected running in provisioner";

/// Workspace ids from `<bin> list` table output.
///
/// Rows look like `| 42 | github.com/acme/api | ... |`; header and separator
/// rows have no numeric first column and are skipped.
pub fn parse_list_output(output: &str) -> Vec<u64> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches('|');
            let first = line.split('|').next()?.trim();
            first.parse().ok()
        })
        .collect()
}

/// Statuses the reconciler may promote to `running`: a start that is in
/// flight from the store's point of view. Settled states are owned by jobs.
fn awaiting_start(status: WorkspaceStatus) -> bool {
    matches!(
        status,
        WorkspaceStatus::Starting
            | WorkspaceStatus::Creating
            | WorkspaceStatus::Restarting
            | WorkspaceStatus::Rebuilding
    )
}

pub struct Reconciler {
    binary: String,
    workspaces: Arc<dyn WorkspaceStore>,
    lifecycle: Arc<Lifecycle>,
    dispatcher: Dispatcher,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        binary: String,
        workspaces: Arc<dyn WorkspaceStore>,
        lifecycle: Arc<Lifecycle>,
        dispatcher: Dispatcher,
        interval: Duration,
    ) -> Self {
        Self {
            binary,
            workspaces,
            lifecycle,
            dispatcher,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!("reconcile failed: {:#}", e);
                    }
                }
            }
        }
        debug!("reconciler stopped");
    }

    /// Promote listed workspaces still waiting on a start to `running`.
    /// Workspaces with a job in flight are left to that job. Returns the ids
    /// that changed.
    pub async fn reconcile_once(&self) -> anyhow::Result<Vec<u64>> {
        let output = Command::new(&self.binary)
            .arg("list")
            .output()
            .await
            .with_context(|| format!("running `{} list`", self.binary))?;
        if !output.status.success() {
            bail!(
                "`{} list` exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mut changed = Vec::new();
        for id in parse_list_output(&String::from_utf8_lossy(&output.stdout)) {
            if self.dispatcher.is_locked(id) {
                debug!(workspace_id = id, "job in flight, skipping");
                continue;
            }
            let workspace = match self.workspaces.get_workspace(id, false).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!(workspace_id = id, "listed workspace not tracked: {}", e);
                    continue;
                }
            };
            if !awaiting_start(workspace.status) {
                continue;
            }
            if let Err(e) = self
                .lifecycle
                .transition(id, WorkspaceStatus::Running, DETECTED_RUNNING)
                .await
            {
                warn!(workspace_id = id, "reconcile transition failed: {}", e);
                continue;
            }
            info!(workspace_id = id, previous = %workspace.status, "reconciled to running");
            changed.push(id);
        }
        Ok(changed)
    }
}
