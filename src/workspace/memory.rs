//! In-process implementations of the collaborator contracts.
//!
//! They back the single-process `serve` mode and the test suite.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use super::store::{
    BusMessage, DnsProvisioner, LogStore, MessageBus, StatusEventStore, WorkspaceStore,
};
use super::{
    ConfigUpdate, LogLine, NewWorkspace, Workspace, WorkspaceConfig, WorkspaceStatus,
    WorkspaceStatusEvent,
};
use crate::error::{OrchestratorError, Result};
use crate::identity::compute_fingerprint;

/// Number of lines `latest_logs` returns.
pub const LATEST_LOGS_LIMIT: usize = 200;

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    workspaces: BTreeMap<u64, Workspace>,
    configs: HashMap<u64, WorkspaceConfig>,
    events: HashMap<u64, Vec<WorkspaceStatusEvent>>,
    /// Only the most recent [`LATEST_LOGS_LIMIT`] lines per workspace are kept.
    logs: HashMap<u64, VecDeque<LogLine>>,
}

/// Workspace, status-event and log storage held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: u64) -> OrchestratorError {
    OrchestratorError::NotFound(format!("workspace {}", id))
}

#[async_trait]
impl WorkspaceStore for MemoryStore {
    async fn create_workspace(&self, new: NewWorkspace) -> Result<Workspace> {
        let mut tables = self.tables.write().await;
        tables.next_id += 1;
        let id = tables.next_id;
        let created_at = Utc::now();

        let workspace = Workspace {
            id,
            fingerprint: compute_fingerprint(
                &new.title,
                new.user_id,
                new.organization_id,
                created_at,
            ),
            title: new.title,
            status: WorkspaceStatus::Pending,
            url: None,
            user_id: new.user_id,
            organization_id: new.organization_id,
            repository_url: new.repository_url,
            access_token: new.access_token,
            machine_type: new.machine_type,
            created_at,
            deleted_at: None,
        };

        tables.configs.insert(
            id,
            WorkspaceConfig {
                workspace_id: id,
                ..Default::default()
            },
        );
        tables.workspaces.insert(id, workspace.clone());
        Ok(workspace)
    }

    async fn get_workspace(&self, id: u64, include_deleted: bool) -> Result<Workspace> {
        let tables = self.tables.read().await;
        tables
            .workspaces
            .get(&id)
            .filter(|ws| include_deleted || ws.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Workspace> {
        let tables = self.tables.read().await;
        tables
            .workspaces
            .values()
            .find(|ws| ws.fingerprint == fingerprint && ws.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("fingerprint '{}'", fingerprint)))
    }

    async fn update_status(&self, id: u64, status: WorkspaceStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        let ws = tables.workspaces.get_mut(&id).ok_or_else(|| not_found(id))?;
        ws.status = status;
        Ok(())
    }

    async fn update_url(&self, id: u64, url: Option<String>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let ws = tables.workspaces.get_mut(&id).ok_or_else(|| not_found(id))?;
        ws.url = url;
        Ok(())
    }

    async fn get_config(&self, workspace_id: u64) -> Result<WorkspaceConfig> {
        let tables = self.tables.read().await;
        tables
            .configs
            .get(&workspace_id)
            .cloned()
            .ok_or_else(|| not_found(workspace_id))
    }

    async fn update_config(&self, workspace_id: u64, update: ConfigUpdate) -> Result<()> {
        let mut tables = self.tables.write().await;
        let config = tables
            .configs
            .get_mut(&workspace_id)
            .ok_or_else(|| not_found(workspace_id))?;
        if let Some(name) = update.machine_name {
            config.machine_name = Some(name);
        }
        if let Some(name) = update.worker_name {
            config.worker_name = Some(name);
        }
        if let Some(ip) = update.worker_ip {
            config.worker_ip = Some(ip);
        }
        if let Some(port) = update.worker_port {
            config.worker_port = Some(port);
        }
        Ok(())
    }

    async fn soft_delete(&self, id: u64) -> Result<()> {
        let mut tables = self.tables.write().await;
        let ws = tables
            .workspaces
            .get_mut(&id)
            .filter(|ws| ws.deleted_at.is_none())
            .ok_or_else(|| not_found(id))?;
        ws.deleted_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl StatusEventStore for MemoryStore {
    async fn create_status_event(&self, event: WorkspaceStatusEvent) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.events.entry(event.workspace_id).or_default().push(event);
        Ok(())
    }

    async fn list_status_events(&self, workspace_id: u64) -> Result<Vec<WorkspaceStatusEvent>> {
        let tables = self.tables.read().await;
        Ok(tables.events.get(&workspace_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append_log(
        &self,
        workspace_id: u64,
        text: &str,
        log_type: &str,
        time: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let lines = tables.logs.entry(workspace_id).or_default();
        if lines.len() == LATEST_LOGS_LIMIT {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            workspace_id,
            time: time.to_string(),
            log_type: log_type.to_string(),
            text: text.to_string(),
            created_at,
        });
        Ok(())
    }

    async fn latest_logs(&self, workspace_id: u64) -> Result<Vec<LogLine>> {
        let tables = self.tables.read().await;
        Ok(tables
            .logs
            .get(&workspace_id)
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

/// Broadcast-backed stand-in for the durable bus. Messages published with no
/// subscriber attached are dropped.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()> {
        // A send error only means nobody is listening yet.
        let _ = self.tx.send(BusMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// LoggingDns
// ---------------------------------------------------------------------------

/// DNS provisioner that records requested subdomains and logs them.
#[derive(Debug, Default)]
pub struct LoggingDns {
    records: Mutex<Vec<String>>,
}

impl LoggingDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<String> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DnsProvisioner for LoggingDns {
    async fn create_record(&self, subdomain: &str) -> Result<()> {
        info!(subdomain, "DNS record requested");
        if let Ok(mut records) = self.records.lock() {
            records.push(subdomain.to_string());
        }
        Ok(())
    }
}
