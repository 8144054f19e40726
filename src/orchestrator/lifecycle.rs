//! The workspace state machine and the per-action provisioning flows.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::model::BusConfig;
use crate::error::{OrchestratorError, Result};
use crate::hub::EventFrame;
use crate::provisioner::protocol::{
    extract_machine_name, extract_url, internal_port, is_delete_success, is_stop_success,
    parse_log_line, strip_ansi,
};
use crate::provisioner::{LineEvent, LogType, ProvisionRequest, ProvisionStep, ProvisioningDriver};
use crate::workspace::memory::LoggingDns;
use crate::workspace::store::{DnsProvisioner, LogStore, MessageBus, StatusEventStore, WorkspaceStore};
use crate::workspace::{
    ConfigUpdate, MemoryBus, MemoryStore, Workspace, WorkspaceAction, WorkspaceStatus,
    WorkspaceStatusEvent,
};

use super::dispatcher::panic_message;
use super::ports::PortAllocator;

/// The external services the engine persists and publishes through.
#[derive(Clone)]
pub struct Collaborators {
    pub workspaces: Arc<dyn WorkspaceStore>,
    pub events: Arc<dyn StatusEventStore>,
    pub logs: Arc<dyn LogStore>,
    pub bus: Arc<dyn MessageBus>,
    pub dns: Arc<dyn DnsProvisioner>,
}

impl Collaborators {
    /// Everything backed by process memory.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            workspaces: store.clone(),
            events: store.clone(),
            logs: store,
            bus: Arc::new(MemoryBus::default()),
            dns: Arc::new(LoggingDns::new()),
        }
    }
}

/// Public address of a running workspace.
pub fn public_url(fingerprint: &str, base_domain: &str, workspace_id: u64) -> String {
    format!("{}.{}/?folder=/workspaces/{}", fingerprint, base_domain, workspace_id)
}

/// Which status rules apply to the lines of one provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRules {
    Start,
    Stop,
    Terminate,
    /// First half of a restart or rebuild; only failures change status.
    Transit,
}

/// Provisioning steps an action runs, in order.
pub fn plan(action: WorkspaceAction) -> &'static [(ProvisionStep, PhaseRules)] {
    match action {
        WorkspaceAction::Start => &[(ProvisionStep::Up, PhaseRules::Start)],
        WorkspaceAction::Stop => &[(ProvisionStep::Stop, PhaseRules::Stop)],
        WorkspaceAction::Restart => &[
            (ProvisionStep::Stop, PhaseRules::Transit),
            (ProvisionStep::Up, PhaseRules::Start),
        ],
        WorkspaceAction::Rebuild => &[
            (ProvisionStep::Delete, PhaseRules::Transit),
            (ProvisionStep::Up, PhaseRules::Start),
        ],
        WorkspaceAction::Terminate => &[(ProvisionStep::Delete, PhaseRules::Terminate)],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseOutcome {
    Finished,
    /// A failure line was handled and the workspace is already `failed`.
    Failed,
}

pub struct Lifecycle {
    collab: Collaborators,
    driver: ProvisioningDriver,
    ports: Arc<PortAllocator>,
    bus_config: BusConfig,
    base_domain: String,
}

impl Lifecycle {
    pub fn new(
        collab: Collaborators,
        driver: ProvisioningDriver,
        ports: Arc<PortAllocator>,
        bus_config: BusConfig,
        base_domain: String,
    ) -> Self {
        Self {
            collab,
            driver,
            ports,
            bus_config,
            base_domain,
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Move `workspace_id` to `status`. The only writer of workspace status.
    ///
    /// Leaving `running` clears the public URL. The status frame is published
    /// with the record as re-read after the write, soft-deleted or not.
    pub async fn transition(
        &self,
        workspace_id: u64,
        status: WorkspaceStatus,
        message: &str,
    ) -> Result<Workspace> {
        let workspaces = &self.collab.workspaces;
        workspaces.update_status(workspace_id, status).await?;
        if status != WorkspaceStatus::Running {
            workspaces.update_url(workspace_id, None).await?;
        }
        self.collab
            .events
            .create_status_event(WorkspaceStatusEvent {
                workspace_id,
                status,
                message: message.to_string(),
                created_at: Utc::now(),
            })
            .await?;

        let workspace = workspaces.get_workspace(workspace_id, true).await?;
        info!(workspace_id, status = %status, "{}", message);
        self.publish(&EventFrame::status(
            workspace_id,
            workspace.status,
            workspace.url.as_deref(),
        ))
        .await;
        Ok(workspace)
    }

    /// Publish a frame on the durable bus. Delivery problems are logged only.
    pub async fn publish(&self, frame: &EventFrame) {
        let payload = match serde_json::to_vec(frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %frame.channel, "failed to encode frame: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .collab
            .bus
            .publish(&self.bus_config.exchange, &self.bus_config.routing_key, payload)
            .await
        {
            warn!(channel = %frame.channel, "failed to publish frame: {}", e);
        }
    }

    async fn publish_log(&self, workspace_id: u64, line: &str, log_type: LogType) {
        let now = Utc::now().format("%H:%M:%S").to_string();
        if let Some(parsed) = parse_log_line(line, log_type, &now) {
            self.publish(&EventFrame::log(workspace_id, &parsed)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// Run `action` for `workspace_id` to completion.
    ///
    /// Failures reported by the provisioning CLI end in `failed` and return
    /// `Ok`. Errors from the run itself also end in `failed` but are returned
    /// so the job is nacked.
    pub async fn run_action(
        &self,
        action: WorkspaceAction,
        workspace_id: u64,
        cancel: CancellationToken,
    ) -> Result<()> {
        let workspace = self.collab.workspaces.get_workspace(workspace_id, true).await?;
        self.transition(
            workspace_id,
            action.in_progress_status(),
            &format!("Workspace {} in progress", action),
        )
        .await?;

        for &(step, rules) in plan(action) {
            if step == ProvisionStep::Up {
                if let Err(e) = self.collab.dns.create_record(&workspace.fingerprint).await {
                    return Err(self.fail(workspace_id, e).await);
                }
            }

            match self.run_phase(&workspace, step, rules, cancel.clone()).await {
                Ok(PhaseOutcome::Finished) => {}
                Ok(PhaseOutcome::Failed) => return Ok(()),
                Err(e) => return Err(self.fail(workspace_id, e).await),
            }

            if rules == PhaseRules::Transit {
                self.ports.release(workspace_id).await;
            }
        }
        Ok(())
    }

    /// Record a run error as a log line and a `failed` transition.
    async fn fail(&self, workspace_id: u64, err: OrchestratorError) -> OrchestratorError {
        error!(workspace_id, "provisioning failed: {}", err);
        self.publish_log(workspace_id, &format!("error: {}", err), LogType::Fatal)
            .await;
        if let Err(e) = self
            .transition(workspace_id, WorkspaceStatus::Failed, &err.to_string())
            .await
        {
            warn!(workspace_id, "failed to record failure: {}", e);
        }
        err
    }

    async fn run_phase(
        &self,
        workspace: &Workspace,
        step: ProvisionStep,
        rules: PhaseRules,
        cancel: CancellationToken,
    ) -> Result<PhaseOutcome> {
        let request = ProvisionRequest {
            workspace_id: workspace.id,
            repository_url: workspace.repository_url.clone(),
            access_token: workspace.access_token.clone(),
            machine_type: workspace.machine_type.clone(),
        };
        let mut run = self.driver.run(step, &request, cancel)?;

        let mut outcome = PhaseOutcome::Finished;
        while let Some(event) = run.next_event().await {
            let apply_rules = outcome == PhaseOutcome::Finished;
            let handled = AssertUnwindSafe(self.handle_line(workspace, rules, &event, apply_rules))
                .catch_unwind()
                .await;
            match handled {
                Ok(Ok(PhaseOutcome::Finished)) => {}
                Ok(Ok(PhaseOutcome::Failed)) => outcome = PhaseOutcome::Failed,
                Ok(Err(e)) => warn!(workspace_id = workspace.id, "failed to handle provisioning line: {}", e),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(
                        workspace_id = workspace.id,
                        "provisioning line handler panicked: {}\n{}",
                        message,
                        std::backtrace::Backtrace::force_capture()
                    );
                    if apply_rules {
                        self.transition(
                            workspace.id,
                            WorkspaceStatus::Failed,
                            &format!("line handler panicked: {}", message),
                        )
                        .await?;
                        outcome = PhaseOutcome::Failed;
                    }
                }
            }
        }

        run.finish().await?;
        debug!(workspace_id = workspace.id, %step, ?outcome, "provisioning step finished");
        Ok(outcome)
    }

    /// Log one driver line and apply the phase's status rules to it.
    async fn handle_line(
        &self,
        workspace: &Workspace,
        rules: PhaseRules,
        event: &LineEvent,
        apply_rules: bool,
    ) -> Result<PhaseOutcome> {
        let id = workspace.id;
        self.publish_log(id, event.line(), event.log_type()).await;
        if !apply_rules {
            return Ok(PhaseOutcome::Finished);
        }

        let line = strip_ansi(event.line());
        if event.is_failure() {
            self.transition(id, WorkspaceStatus::Failed, line.trim()).await?;
            return Ok(PhaseOutcome::Failed);
        }

        match rules {
            PhaseRules::Start => {
                if let Some(machine) = extract_machine_name(&line) {
                    debug!(workspace_id = id, machine, "machine handle discovered");
                    self.collab
                        .workspaces
                        .update_config(
                            id,
                            ConfigUpdate {
                                machine_name: Some(machine.to_string()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                if let Some(url) = extract_url(&line) {
                    self.on_workspace_opened(workspace, url).await?;
                }
            }
            PhaseRules::Stop => {
                if is_stop_success(&line) {
                    self.transition(id, WorkspaceStatus::Stopped, "Workspace stopped").await?;
                    self.ports.release(id).await;
                }
            }
            PhaseRules::Terminate => {
                if is_delete_success(&line) {
                    self.transition(id, WorkspaceStatus::Terminated, "Workspace terminated")
                        .await?;
                    self.ports.release(id).await;
                }
            }
            PhaseRules::Transit => {}
        }
        Ok(PhaseOutcome::Finished)
    }

    /// Expose the freshly opened workspace and mark it running.
    async fn on_workspace_opened(&self, workspace: &Workspace, url: &str) -> Result<()> {
        let id = workspace.id;
        let Some(internal) = internal_port(url) else {
            warn!(workspace_id = id, url, "opened URL carries no port, cannot forward");
            return Ok(());
        };

        let external = match self.ports.allocate(id, internal).await {
            Ok(port) => port,
            Err(e) => {
                error!(workspace_id = id, "port allocation failed, workspace not marked running: {}", e);
                return Ok(());
            }
        };

        let public = public_url(&workspace.fingerprint, &self.base_domain, id);
        self.collab.workspaces.update_url(id, Some(public)).await?;
        if let Err(e) = self
            .transition(id, WorkspaceStatus::Running, "Workspace is running")
            .await
        {
            // the URL only lives alongside `running`
            if let Err(clear) = self.collab.workspaces.update_url(id, None).await {
                warn!(workspace_id = id, "failed to clear url: {}", clear);
            }
            return Err(e);
        }
        self.collab
            .workspaces
            .update_config(
                id,
                ConfigUpdate {
                    worker_port: Some(external),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}
