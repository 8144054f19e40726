#![cfg(unix)]

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use workspaced::error::{OrchestratorError, ProvisioningError, Result};
use workspaced::orchestrator::lifecycle::public_url;
use workspaced::workspace::store::WorkspaceStore;
use workspaced::workspace::{
    ConfigUpdate, MemoryStore, NewWorkspace, Workspace, WorkspaceAction, WorkspaceConfig,
    WorkspaceStatus,
};

use crate::common::*;

/// Listener standing in for the provisioned workspace's IDE port.
fn workspace_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn up_script(internal: u16) -> String {
    format!(
        "    echo \"Create machine 'ws-$4'\"\n    echo \"Successfully opened http://127.0.0.1:{internal}\""
    )
}

#[tokio::test]
async fn start_reaches_running_with_url_and_mapping() {
    let (_ide, internal) = workspace_listener();
    let dir = TempDir::new().unwrap();
    let bin = fake_provisioner(&dir, &up_script(internal), "true", "true");
    let h = Harness::new(bin);
    let ws = h.create_workspace().await;

    h.lifecycle
        .run_action(WorkspaceAction::Start, ws.id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        h.statuses(ws.id).await,
        vec![WorkspaceStatus::Starting, WorkspaceStatus::Running]
    );

    let stored = h.collab.workspaces.get_workspace(ws.id, false).await.unwrap();
    assert_eq!(stored.status, WorkspaceStatus::Running);
    assert_eq!(
        stored.url.as_deref(),
        Some(public_url(&ws.fingerprint, BASE_DOMAIN, ws.id).as_str())
    );

    let mappings = h.ports.mappings();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].internal_port, internal);

    let config = h.collab.workspaces.get_config(ws.id).await.unwrap();
    assert_eq!(config.machine_name, Some(format!("ws-{}", ws.id)));
    assert_eq!(config.worker_port, Some(mappings[0].external_port));

    assert_eq!(h.dns.records(), vec![ws.fingerprint.clone()]);
    h.shutdown().await;
}

#[tokio::test]
async fn every_line_reaches_the_log_store() {
    let (_ide, internal) = workspace_listener();
    let dir = TempDir::new().unwrap();
    let up = format!("    echo '12:00:00 info Pulling image'\n{}", up_script(internal));
    let h = Harness::new(fake_provisioner(&dir, &up, "true", "true"));
    let ws = h.create_workspace().await;

    h.lifecycle
        .run_action(WorkspaceAction::Start, ws.id, CancellationToken::new())
        .await
        .unwrap();

    let logs = h.collab.logs.clone();
    let id = ws.id;
    assert!(
        eventually(Duration::from_secs(5), || {
            let logs = logs.clone();
            async move { logs.latest_logs(id).await.unwrap().len() == 3 }
        })
        .await,
        "all three lines should be stored"
    );
    let lines = h.collab.logs.latest_logs(ws.id).await.unwrap();
    assert_eq!(lines[0].time, "12:00:00");
    assert_eq!(lines[0].log_type, "info");
    assert_eq!(lines[0].text, "Pulling image");
    h.shutdown().await;
}

#[tokio::test]
async fn stop_marker_moves_to_stopped_and_releases_mapping() {
    let (_ide, internal) = workspace_listener();
    let dir = TempDir::new().unwrap();
    let bin = fake_provisioner(
        &dir,
        &up_script(internal),
        "    echo 'Successfully stopped'",
        "true",
    );
    let h = Harness::new(bin);
    let ws = h.create_workspace().await;

    h.lifecycle
        .run_action(WorkspaceAction::Start, ws.id, CancellationToken::new())
        .await
        .unwrap();
    assert!(h.ports.get(ws.id).is_some());

    h.lifecycle
        .run_action(WorkspaceAction::Stop, ws.id, CancellationToken::new())
        .await
        .unwrap();

    let statuses = h.statuses(ws.id).await;
    assert_eq!(
        statuses[statuses.len() - 2..],
        [WorkspaceStatus::Stopping, WorkspaceStatus::Stopped]
    );
    let stored = h.collab.workspaces.get_workspace(ws.id, false).await.unwrap();
    assert_eq!(stored.url, None);
    assert!(h.ports.get(ws.id).is_none());
    h.shutdown().await;
}

#[tokio::test]
async fn fatal_terminate_fails_workspace_but_job_succeeds() {
    let dir = TempDir::new().unwrap();
    let bin = fake_provisioner(
        &dir,
        "true",
        "true",
        "    echo 'fatal workspace 1 not found'\n    echo 'never read'\n    exit 2",
    );
    let h = Harness::new(bin);
    let ws = h.create_workspace().await;
    h.collab.workspaces.soft_delete(ws.id).await.unwrap();

    let result = h
        .lifecycle
        .run_action(WorkspaceAction::Terminate, ws.id, CancellationToken::new())
        .await;
    assert!(result.is_ok(), "fatal line + exit 2 is reported through status, got: {result:?}");

    let events = h.collab.events.list_status_events(ws.id).await.unwrap();
    let statuses: Vec<_> = events.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![WorkspaceStatus::Terminating, WorkspaceStatus::Failed]);
    assert!(events[1].message.contains("fatal workspace 1 not found"));
    h.shutdown().await;
}

#[tokio::test]
async fn delete_marker_terminates_soft_deleted_workspace() {
    let dir = TempDir::new().unwrap();
    let bin = fake_provisioner(
        &dir,
        "true",
        "true",
        "    echo 'Successfully deleted workspace api'",
    );
    let h = Harness::new(bin);
    let ws = h.create_workspace().await;
    h.collab.workspaces.soft_delete(ws.id).await.unwrap();

    h.lifecycle
        .run_action(WorkspaceAction::Terminate, ws.id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        h.statuses(ws.id).await,
        vec![WorkspaceStatus::Terminating, WorkspaceStatus::Terminated]
    );
    h.shutdown().await;
}

#[tokio::test]
async fn done_and_fatal_on_one_line_is_fatal() {
    let (_ide, internal) = workspace_listener();
    let dir = TempDir::new().unwrap();
    let up = format!(
        "    echo 'done: fatal quota exceeded'\n    echo \"Successfully opened http://127.0.0.1:{internal}\"\n    exit 1"
    );
    let h = Harness::new(fake_provisioner(&dir, &up, "true", "true"));
    let ws = h.create_workspace().await;

    h.lifecycle
        .run_action(WorkspaceAction::Start, ws.id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        h.statuses(ws.id).await,
        vec![WorkspaceStatus::Starting, WorkspaceStatus::Failed]
    );
    assert!(h.ports.mappings().is_empty(), "lines after the fatal one are not read");
    h.shutdown().await;
}

#[tokio::test]
async fn exit_without_fatal_line_fails_and_returns_error() {
    let dir = TempDir::new().unwrap();
    let bin = fake_provisioner(&dir, "true", "    echo 'stopping...'\n    exit 3", "true");
    let h = Harness::new(bin);
    let ws = h.create_workspace().await;

    let err = h
        .lifecycle
        .run_action(WorkspaceAction::Stop, ws.id, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, OrchestratorError::Provisioning(ProvisioningError::Exit { .. })),
        "got: {err:?}"
    );
    assert_eq!(
        h.statuses(ws.id).await,
        vec![WorkspaceStatus::Stopping, WorkspaceStatus::Failed]
    );
    h.shutdown().await;
}

#[tokio::test]
async fn unreachable_workspace_port_stays_starting() {
    let (ide, internal) = workspace_listener();
    drop(ide);
    let dir = TempDir::new().unwrap();
    let h = Harness::new(fake_provisioner(&dir, &up_script(internal), "true", "true"));
    let ws = h.create_workspace().await;

    h.lifecycle
        .run_action(WorkspaceAction::Start, ws.id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.statuses(ws.id).await, vec![WorkspaceStatus::Starting]);
    let stored = h.collab.workspaces.get_workspace(ws.id, false).await.unwrap();
    assert_eq!(stored.url, None);
    h.shutdown().await;
}

#[tokio::test]
async fn restart_stops_then_starts_again() {
    let (_ide, internal) = workspace_listener();
    let dir = TempDir::new().unwrap();
    let bin = fake_provisioner(
        &dir,
        &up_script(internal),
        "    echo 'Successfully stopped'",
        "true",
    );
    let h = Harness::new(bin);
    let ws = h.create_workspace().await;

    h.lifecycle
        .run_action(WorkspaceAction::Restart, ws.id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        h.statuses(ws.id).await,
        vec![WorkspaceStatus::Restarting, WorkspaceStatus::Running]
    );
    assert_eq!(h.ports.mappings().len(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn rebuild_deletes_then_brings_workspace_back() {
    let (_ide, internal) = workspace_listener();
    let dir = TempDir::new().unwrap();
    let deleted = dir.path().join("deleted");
    let bin = fake_provisioner(
        &dir,
        &up_script(internal),
        "true",
        &format!(
            "    touch {}\n    echo 'Successfully deleted workspace api'",
            deleted.display()
        ),
    );
    let h = Harness::new(bin);
    let ws = h.create_workspace().await;

    h.lifecycle
        .run_action(WorkspaceAction::Start, ws.id, CancellationToken::new())
        .await
        .unwrap();
    let first = h.ports.get(ws.id).unwrap();

    h.lifecycle
        .run_action(WorkspaceAction::Rebuild, ws.id, CancellationToken::new())
        .await
        .unwrap();

    assert!(deleted.exists(), "rebuild runs the delete step first");
    let statuses = h.statuses(ws.id).await;
    assert_eq!(
        statuses[statuses.len() - 2..],
        [WorkspaceStatus::Rebuilding, WorkspaceStatus::Running],
        "the delete marker does not terminate a rebuilding workspace"
    );

    let stored = h.collab.workspaces.get_workspace(ws.id, false).await.unwrap();
    assert_eq!(stored.status, WorkspaceStatus::Running);
    assert!(stored.url.is_some());
    let mappings = h.ports.mappings();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].internal_port, first.internal_port);
    assert_eq!(
        h.collab.workspaces.get_config(ws.id).await.unwrap().worker_port,
        Some(mappings[0].external_port)
    );
    h.shutdown().await;
}

/// Store whose config writes blow up.
struct BrokenConfigStore {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl WorkspaceStore for BrokenConfigStore {
    async fn create_workspace(&self, new: NewWorkspace) -> Result<Workspace> {
        self.inner.create_workspace(new).await
    }

    async fn get_workspace(&self, id: u64, include_deleted: bool) -> Result<Workspace> {
        self.inner.get_workspace(id, include_deleted).await
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Workspace> {
        self.inner.get_by_fingerprint(fingerprint).await
    }

    async fn update_status(&self, id: u64, status: WorkspaceStatus) -> Result<()> {
        self.inner.update_status(id, status).await
    }

    async fn update_url(&self, id: u64, url: Option<String>) -> Result<()> {
        self.inner.update_url(id, url).await
    }

    async fn get_config(&self, workspace_id: u64) -> Result<WorkspaceConfig> {
        self.inner.get_config(workspace_id).await
    }

    async fn update_config(&self, _workspace_id: u64, _update: ConfigUpdate) -> Result<()> {
        panic!("config table corrupted");
    }

    async fn soft_delete(&self, id: u64) -> Result<()> {
        self.inner.soft_delete(id).await
    }
}

#[tokio::test]
async fn panicking_line_handler_fails_workspace_and_keeps_logging() {
    let (_ide, internal) = workspace_listener();
    let dir = TempDir::new().unwrap();
    let up = format!("{}\n    echo 'info after the crash'", up_script(internal));
    let h = Harness::with_workspaces(fake_provisioner(&dir, &up, "true", "true"), |store| {
        Arc::new(BrokenConfigStore { inner: store })
    });
    let ws = h.create_workspace().await;

    let result = h
        .lifecycle
        .run_action(WorkspaceAction::Start, ws.id, CancellationToken::new())
        .await;
    assert!(result.is_ok(), "got: {result:?}");

    let events = h.collab.events.list_status_events(ws.id).await.unwrap();
    let statuses: Vec<_> = events.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![WorkspaceStatus::Starting, WorkspaceStatus::Failed]);
    assert!(events[1].message.contains("config table corrupted"), "got: {}", events[1].message);

    assert!(
        h.ports.mappings().is_empty(),
        "the opened line after the panic is not acted on"
    );
    let logs = h.collab.logs.clone();
    let id = ws.id;
    assert!(
        eventually(Duration::from_secs(5), || {
            let logs = logs.clone();
            async move { logs.latest_logs(id).await.unwrap().len() == 3 }
        })
        .await,
        "lines after the panic are still logged"
    );
    h.shutdown().await;
}
