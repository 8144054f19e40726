pub mod memory;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::{MemoryBus, MemoryStore};
pub use store::{DnsProvisioner, LogStore, MessageBus, StatusEventStore, WorkspaceStore};

// ---------------------------------------------------------------------------
// WorkspaceStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Starting,
    Creating,
    Running,
    Stopping,
    Stopped,
    Restarting,
    Rebuilding,
    Terminating,
    Terminated,
    Failed,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Pending => "pending",
            WorkspaceStatus::Starting => "starting",
            WorkspaceStatus::Creating => "creating",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Stopping => "stopping",
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Restarting => "restarting",
            WorkspaceStatus::Rebuilding => "rebuilding",
            WorkspaceStatus::Terminating => "terminating",
            WorkspaceStatus::Terminated => "terminated",
            WorkspaceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkspaceAction
// ---------------------------------------------------------------------------

/// A lifecycle action a user can request for a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceAction {
    Start,
    Stop,
    Restart,
    Rebuild,
    Terminate,
}

impl WorkspaceAction {
    pub const ALL: [WorkspaceAction; 5] = [
        WorkspaceAction::Start,
        WorkspaceAction::Stop,
        WorkspaceAction::Restart,
        WorkspaceAction::Rebuild,
        WorkspaceAction::Terminate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceAction::Start => "start",
            WorkspaceAction::Stop => "stop",
            WorkspaceAction::Restart => "restart",
            WorkspaceAction::Rebuild => "rebuild",
            WorkspaceAction::Terminate => "terminate",
        }
    }

    /// Job kind the dispatcher registers the handler under.
    pub fn job_kind(&self) -> &'static str {
        match self {
            WorkspaceAction::Start => "workspace:start",
            WorkspaceAction::Stop => "workspace:stop",
            WorkspaceAction::Restart => "workspace:restart",
            WorkspaceAction::Rebuild => "workspace:rebuild",
            WorkspaceAction::Terminate => "workspace:terminate",
        }
    }

    pub fn from_job_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.job_kind() == kind)
    }

    /// Status a workspace enters before the provisioning run begins.
    pub fn in_progress_status(&self) -> WorkspaceStatus {
        match self {
            WorkspaceAction::Start => WorkspaceStatus::Starting,
            WorkspaceAction::Stop => WorkspaceStatus::Stopping,
            WorkspaceAction::Restart => WorkspaceStatus::Restarting,
            WorkspaceAction::Rebuild => WorkspaceStatus::Rebuilding,
            WorkspaceAction::Terminate => WorkspaceStatus::Terminating,
        }
    }
}

impl fmt::Display for WorkspaceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown workspace action '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: u64,
    pub title: String,
    pub fingerprint: String,
    pub status: WorkspaceStatus,
    pub url: Option<String>,
    pub user_id: u64,
    pub organization_id: u64,
    pub repository_url: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub machine_type: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Incrementally discovered provisioning facts for one workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceConfig {
    pub workspace_id: u64,
    pub machine_name: Option<String>,
    pub worker_name: Option<String>,
    pub worker_ip: Option<String>,
    pub worker_port: Option<u16>,
}

/// Partial update applied to a [`WorkspaceConfig`]. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub machine_name: Option<String>,
    pub worker_name: Option<String>,
    pub worker_ip: Option<String>,
    pub worker_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceStatusEvent {
    pub workspace_id: u64,
    pub status: WorkspaceStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub workspace_id: u64,
    pub time: String,
    #[serde(rename = "type")]
    pub log_type: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the caller when creating a workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct NewWorkspace {
    pub title: String,
    pub user_id: u64,
    pub organization_id: u64,
    pub repository_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    pub machine_type: String,
}

pub fn logs_channel(workspace_id: u64) -> String {
    format!("workspace_{}_logs", workspace_id)
}

pub fn status_channel(workspace_id: u64) -> String {
    format!("workspace_{}_status", workspace_id)
}
