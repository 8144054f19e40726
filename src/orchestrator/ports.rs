//! Dynamic external port allocation and TCP forwarding per workspace.

use std::collections::HashMap;
use std::net::TcpListener;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::model::PortsConfig;
use crate::error::{OrchestratorError, Result};
use crate::platform;

/// Interval between readiness probes of the internal port.
const READY_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub workspace_id: u64,
    pub internal_port: u16,
    pub external_port: u16,
}

struct MappingEntry {
    mapping: PortMapping,
    child: Child,
    pid: Option<u32>,
}

/// Owns the workspace → forwarding process table.
///
/// Every read and write of the table happens under its mutex; the lock is
/// never held across an await.
pub struct PortAllocator {
    config: PortsConfig,
    table: Mutex<HashMap<u64, MappingEntry>>,
    drains: TaskTracker,
}

pub fn check_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Wait until something accepts connections on `127.0.0.1:port`.
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let probe = || async {
        tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .map(|_| ())
    };
    let attempts = (timeout.as_millis() / READY_POLL.as_millis()).max(1) as usize;
    let result = tokio::time::timeout(
        timeout,
        probe
            .retry(
                ConstantBuilder::default()
                    .with_delay(READY_POLL)
                    .with_max_times(attempts),
            )
            .notify(|err: &std::io::Error, dur: Duration| {
                debug!(port, "port not ready: {}, retrying in {:?}", err, dur);
            }),
    )
    .await;
    matches!(result, Ok(Ok(())))
}

/// Substitute the port placeholders of the forwarder template.
pub fn render_forward_command(template: &str, external: u16, internal: u16) -> String {
    template
        .replace("{external}", &external.to_string())
        .replace("{internal}", &internal.to_string())
}

impl PortAllocator {
    pub fn new(config: PortsConfig) -> Self {
        Self {
            config,
            table: Mutex::new(HashMap::new()),
            drains: TaskTracker::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, MappingEntry>> {
        // A panic while holding the lock leaves the table itself consistent.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, workspace_id: u64) -> Option<PortMapping> {
        self.lock().get(&workspace_id).map(|e| e.mapping)
    }

    pub fn mappings(&self) -> Vec<PortMapping> {
        let mut all: Vec<_> = self.lock().values().map(|e| e.mapping).collect();
        all.sort_by_key(|m| m.workspace_id);
        all
    }

    /// Map `workspace_id` to a free external port forwarding to `internal_port`.
    ///
    /// Idempotent: a workspace that already has a mapping gets it back and no
    /// second forwarder is spawned.
    pub async fn allocate(&self, workspace_id: u64, internal_port: u16) -> Result<u16> {
        if let Some(existing) = self.get(workspace_id) {
            debug!(workspace_id, external_port = existing.external_port, "reusing port mapping");
            return Ok(existing.external_port);
        }

        let timeout = self.config.ready_timeout();
        if !wait_for_port(internal_port, timeout).await {
            return Err(OrchestratorError::Forwarding(format!(
                "internal port {} not reachable after {:?}",
                internal_port, timeout
            )));
        }

        let (external_port, stderr) = {
            let mut table = self.lock();
            if let Some(existing) = table.get(&workspace_id) {
                return Ok(existing.mapping.external_port);
            }

            let external_port = self.probe(&table)?;
            let command =
                render_forward_command(&self.config.forward_command, external_port, internal_port);
            let mut cmd = platform::shell_command(&command);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            platform::configure_process_group(&mut cmd);

            let mut child = cmd.spawn().map_err(|e| {
                OrchestratorError::Forwarding(format!("failed to spawn `{}`: {}", command, e))
            })?;
            let stderr = child.stderr.take();
            let pid = child.id();

            table.insert(
                workspace_id,
                MappingEntry {
                    mapping: PortMapping {
                        workspace_id,
                        internal_port,
                        external_port,
                    },
                    child,
                    pid,
                },
            );
            (external_port, stderr)
        };

        info!(
            workspace_id,
            external_port, internal_port, "forwarding 0.0.0.0:{} -> 127.0.0.1:{}", external_port, internal_port
        );

        if let Some(stderr) = stderr {
            self.drains.spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            warn!(workspace_id, "[forwarder-{}] {}", external_port, line)
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(workspace_id, error = %e, "forwarder stderr read error");
                            break;
                        }
                    }
                }
            });
        }

        Ok(external_port)
    }

    /// First bindable port in the window that no mapping holds.
    fn probe(&self, table: &HashMap<u64, MappingEntry>) -> Result<u16> {
        let base = u32::from(self.config.base);
        let end = (base + u32::from(self.config.window)).min(u32::from(u16::MAX) + 1);
        (base..end)
            .filter_map(|p| u16::try_from(p).ok())
            .filter(|p| !table.values().any(|e| e.mapping.external_port == *p))
            .find(|p| check_port_available(*p))
            .ok_or(OrchestratorError::PortExhaustion {
                base: self.config.base,
                window: self.config.window,
            })
    }

    /// Drop the mapping for `workspace_id` and stop its forwarder.
    pub async fn release(&self, workspace_id: u64) -> Option<PortMapping> {
        let entry = self.lock().remove(&workspace_id)?;
        let MappingEntry {
            mapping,
            mut child,
            pid,
        } = entry;
        platform::terminate_child(&mut child, pid).await;
        info!(workspace_id, external_port = mapping.external_port, "port mapping released");
        Some(mapping)
    }

    /// Release every mapping and wait briefly for the stderr drains.
    pub async fn shutdown(&self) {
        let entries: Vec<MappingEntry> = self.lock().drain().map(|(_, e)| e).collect();
        for mut entry in entries {
            platform::terminate_child(&mut entry.child, entry.pid).await;
        }
        self.drains.close();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.drains.wait()).await;
    }
}
