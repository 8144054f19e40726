pub mod dispatcher;
pub mod lifecycle;
pub mod ports;
pub mod reconcile;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::model::WorkspacedConfig;
use crate::config::secrets::SecretRegistry;
use crate::error::Result;
use crate::hub::EventFrame;
use crate::provisioner::ProvisioningDriver;
use crate::workspace::{NewWorkspace, Workspace, WorkspaceAction, WorkspaceStatus, WorkspaceStatusEvent};

use dispatcher::{Dispatcher, Job, JobHandler};
use lifecycle::{Collaborators, Lifecycle};
use ports::PortAllocator;
use reconcile::Reconciler;

/// Wires the dispatcher, the lifecycle, and the port allocator together.
pub struct Orchestrator {
    collab: Collaborators,
    lifecycle: Arc<Lifecycle>,
    dispatcher: Dispatcher,
    ports: Arc<PortAllocator>,
    driver: ProvisioningDriver,
    config: WorkspacedConfig,
}

impl Orchestrator {
    pub fn new(
        config: WorkspacedConfig,
        secrets: SecretRegistry,
        collab: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        let ports = Arc::new(PortAllocator::new(config.ports.clone()));
        let driver = ProvisioningDriver::new(config.provisioner.clone(), secrets);
        let lifecycle = Arc::new(Lifecycle::new(
            collab.clone(),
            driver.clone(),
            ports.clone(),
            config.bus.clone(),
            config.proxy.base_domain.clone(),
        ));

        let dispatcher = Dispatcher::new(config.queue.clone(), cancel.child_token());
        let handler: Arc<dyn JobHandler> = Arc::new(LifecycleJob {
            lifecycle: lifecycle.clone(),
        });
        for action in WorkspaceAction::ALL {
            dispatcher.register(action.job_kind(), handler.clone());
        }

        Self {
            collab,
            lifecycle,
            dispatcher,
            ports,
            driver,
            config,
        }
    }

    /// Run provisioner setup and start the workers.
    pub async fn start(&self) {
        self.driver.prepare().await;
        self.dispatcher.start();
    }

    /// Reconciler for this orchestrator when enabled in config.
    pub fn reconciler(&self) -> Option<Reconciler> {
        self.config.reconcile.enabled.then(|| {
            Reconciler::new(
                self.config.provisioner.binary.clone(),
                self.collab.workspaces.clone(),
                self.lifecycle.clone(),
                self.dispatcher.clone(),
                self.config.reconcile.interval(),
            )
        })
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Create a `pending` workspace and queue its first start.
    pub async fn create_workspace(&self, new: NewWorkspace) -> Result<(Workspace, Uuid)> {
        let workspace = self.collab.workspaces.create_workspace(new).await?;
        self.collab
            .events
            .create_status_event(WorkspaceStatusEvent {
                workspace_id: workspace.id,
                status: WorkspaceStatus::Pending,
                message: "Workspace created".to_string(),
                created_at: Utc::now(),
            })
            .await?;
        self.lifecycle.publish(&EventFrame::created(&workspace)).await;
        info!(
            workspace_id = workspace.id,
            fingerprint = %workspace.fingerprint,
            "workspace created"
        );

        let job_id = self
            .dispatcher
            .enqueue(WorkspaceAction::Start, workspace.id, workspace.user_id)?;
        Ok((workspace, job_id))
    }

    /// Queue `action` for a live workspace.
    pub async fn request_action(
        &self,
        action: WorkspaceAction,
        workspace_id: u64,
        user_id: u64,
    ) -> Result<Uuid> {
        self.collab.workspaces.get_workspace(workspace_id, false).await?;
        Ok(self.dispatcher.enqueue(action, workspace_id, user_id)?)
    }

    /// Soft-delete the workspace and queue its termination.
    pub async fn delete_workspace(&self, workspace_id: u64, user_id: u64) -> Result<Uuid> {
        self.collab.workspaces.get_workspace(workspace_id, false).await?;
        self.collab.workspaces.soft_delete(workspace_id).await?;
        info!(workspace_id, "workspace deleted");
        Ok(self
            .dispatcher
            .enqueue(WorkspaceAction::Terminate, workspace_id, user_id)?)
    }

    /// Stop the workers and every forwarder.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.ports.shutdown().await;
    }
}

struct LifecycleJob {
    lifecycle: Arc<Lifecycle>,
}

#[async_trait]
impl JobHandler for LifecycleJob {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> anyhow::Result<()> {
        let Some(action) = WorkspaceAction::from_job_kind(&job.kind) else {
            anyhow::bail!("unknown job kind '{}'", job.kind);
        };
        self.lifecycle
            .run_action(action, job.payload.workspace_id, cancel)
            .await?;
        Ok(())
    }
}
