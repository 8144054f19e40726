//! Contracts for the collaborators the engine persists and publishes through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use super::{
    ConfigUpdate, LogLine, NewWorkspace, Workspace, WorkspaceConfig, WorkspaceStatus,
    WorkspaceStatusEvent,
};
use crate::error::Result;

/// Relational workspace state.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn create_workspace(&self, new: NewWorkspace) -> Result<Workspace>;

    /// Fetch by id. Soft-deleted records are only returned when `include_deleted`.
    async fn get_workspace(&self, id: u64, include_deleted: bool) -> Result<Workspace>;

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Workspace>;

    async fn update_status(&self, id: u64, status: WorkspaceStatus) -> Result<()>;

    async fn update_url(&self, id: u64, url: Option<String>) -> Result<()>;

    async fn get_config(&self, workspace_id: u64) -> Result<WorkspaceConfig>;

    async fn update_config(&self, workspace_id: u64, update: ConfigUpdate) -> Result<()>;

    async fn soft_delete(&self, id: u64) -> Result<()>;
}

/// Append-only audit trail of status transitions.
#[async_trait]
pub trait StatusEventStore: Send + Sync {
    async fn create_status_event(&self, event: WorkspaceStatusEvent) -> Result<()>;

    async fn list_status_events(&self, workspace_id: u64) -> Result<Vec<WorkspaceStatusEvent>>;
}

/// Provisioning log storage, kept apart from relational state.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_log(
        &self,
        workspace_id: u64,
        text: &str,
        log_type: &str,
        time: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()>;

    /// The most recent 200 lines, oldest first.
    async fn latest_logs(&self, workspace_id: u64) -> Result<Vec<LogLine>>;
}

/// A message delivered on the durable bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// Durable message bus used for cross-process status and log delivery.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()>;

    /// Receive every message published after this call.
    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

/// External DNS provisioning for fingerprint subdomains.
#[async_trait]
pub trait DnsProvisioner: Send + Sync {
    async fn create_record(&self, subdomain: &str) -> Result<()>;
}
