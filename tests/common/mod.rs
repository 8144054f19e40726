#![allow(dead_code)]
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use workspaced::config::model::{BusConfig, PortsConfig, ProvisionerConfig};
use workspaced::config::secrets::SecretRegistry;
use workspaced::hub::bridge::BusBridge;
use workspaced::hub::{Hub, HubHandle};
use workspaced::orchestrator::lifecycle::{Collaborators, Lifecycle};
use workspaced::orchestrator::ports::PortAllocator;
use workspaced::provisioner::ProvisioningDriver;
use workspaced::workspace::memory::LoggingDns;
use workspaced::workspace::store::WorkspaceStore;
use workspaced::workspace::{MemoryBus, MemoryStore, NewWorkspace, Workspace, WorkspaceStatus};

pub const BASE_DOMAIN: &str = "ws.example.test";

pub struct TestProject {
    pub dir: TempDir,
    pub config_path: PathBuf,
}

impl TestProject {
    pub fn new(config_toml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("workspaced.toml");
        std::fs::write(&config_path, config_toml).unwrap();
        Self { dir, config_path }
    }
}

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Write an executable stand-in for the provisioning CLI.
///
/// `up`, `stop` and `delete` are the shell bodies run for each step; `$4` is
/// the workspace id during `up`.
#[cfg(unix)]
pub fn fake_provisioner(dir: &TempDir, up: &str, stop: &str, delete: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("fake-devpod");
    let script = format!(
        "#!/bin/sh\ncase \"$1\" in\n  up)\n{up}\n    ;;\n  stop)\n{stop}\n    ;;\n  delete)\n{delete}\n    ;;\nesac\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().to_string()
}

/// A lifecycle wired to in-memory collaborators, a running hub, and the bus
/// bridge, with forwarders that only sleep.
pub struct Harness {
    pub collab: Collaborators,
    pub dns: Arc<LoggingDns>,
    pub ports: Arc<PortAllocator>,
    pub lifecycle: Arc<Lifecycle>,
    pub hub: HubHandle,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(binary: String) -> Self {
        Self::with_workspaces(binary, |store| store)
    }

    /// Like [`Harness::new`], with the workspace store wrapped by `wrap`.
    pub fn with_workspaces<F>(binary: String, wrap: F) -> Self
    where
        F: FnOnce(Arc<MemoryStore>) -> Arc<dyn WorkspaceStore>,
    {
        let store = Arc::new(MemoryStore::new());
        let dns = Arc::new(LoggingDns::new());
        let collab = Collaborators {
            workspaces: wrap(store.clone()),
            events: store.clone(),
            logs: store,
            bus: Arc::new(MemoryBus::default()),
            dns: dns.clone(),
        };

        let ports = Arc::new(PortAllocator::new(PortsConfig {
            base: free_port(),
            window: 200,
            ready_timeout: "5s".to_string(),
            forward_command: "sleep 30 # {external} {internal}".to_string(),
        }));
        let driver = ProvisioningDriver::new(
            ProvisionerConfig {
                binary,
                ..Default::default()
            },
            SecretRegistry::new(),
        );
        let lifecycle = Arc::new(Lifecycle::new(
            collab.clone(),
            driver,
            ports.clone(),
            BusConfig::default(),
            BASE_DOMAIN.to_string(),
        ));

        let cancel = CancellationToken::new();
        let (hub, handle) = Hub::new(256);
        tokio::spawn(hub.run(cancel.clone()));
        let bridge = BusBridge::new(
            collab.bus.as_ref(),
            collab.logs.clone(),
            handle.clone(),
            BusConfig::default(),
        );
        tokio::spawn(bridge.run(cancel.clone()));

        Self {
            collab,
            dns,
            ports,
            lifecycle,
            hub: handle,
            cancel,
        }
    }

    pub async fn create_workspace(&self) -> Workspace {
        self.collab
            .workspaces
            .create_workspace(NewWorkspace {
                title: "api".to_string(),
                user_id: 7,
                organization_id: 3,
                repository_url: "https://github.com/acme/api.git".to_string(),
                access_token: Some("ghp_token".to_string()),
                machine_type: "t3.small".to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn statuses(&self, workspace_id: u64) -> Vec<WorkspaceStatus> {
        self.collab
            .events
            .list_status_events(workspace_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect()
    }

    pub async fn shutdown(&self) {
        self.ports.shutdown().await;
        self.cancel.cancel();
    }
}
