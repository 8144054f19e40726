pub mod command;
pub mod protocol;

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::model::ProvisionerConfig;
use crate::config::secrets::SecretRegistry;
use crate::error::ProvisioningError;
use crate::platform;

pub use command::{build_command, ProvisionCommand, ProvisionRequest, ProvisionStep};
pub use protocol::{classify, LineEvent, LogType};

/// Lines buffered between the output readers and the consumer.
const LINE_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Exit policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVerdict {
    /// Exit status zero.
    Success,
    /// Non-zero exit after a fatal line was already streamed. The failure has
    /// been reported through that line, so the run itself counts as success.
    FatalAlreadyReported,
    /// Non-zero exit with no fatal line.
    ProcessError,
}

/// Map a provisioning process exit onto the run outcome.
///
/// A non-zero exit is only an error when no fatal line was seen. This couples
/// the outcome to the CLI printing its fatal marker; it is kept here, and only
/// here, so the rule can change without touching the streaming loop.
pub fn exit_verdict(exited_ok: bool, fatal_seen: bool) -> ExitVerdict {
    match (exited_ok, fatal_seen) {
        (true, _) => ExitVerdict::Success,
        (false, true) => ExitVerdict::FatalAlreadyReported,
        (false, false) => ExitVerdict::ProcessError,
    }
}

// ---------------------------------------------------------------------------
// ProvisionRun
// ---------------------------------------------------------------------------

/// A running provisioning process.
///
/// Yields classified lines in the order the readers observed them, then the
/// exit outcome from [`ProvisionRun::finish`]. Stdout and stderr are read by
/// separate tasks, so lines written to both streams at nearly the same time
/// can arrive in either order.
pub struct ProvisionRun {
    events: mpsc::Receiver<LineEvent>,
    completion: JoinHandle<Result<(), ProvisioningError>>,
}

impl ProvisionRun {
    /// Next classified line, or `None` once output ends or a fatal line was seen.
    pub async fn next_event(&mut self) -> Option<LineEvent> {
        self.events.recv().await
    }

    /// Wait for the process to exit and apply the exit policy.
    pub async fn finish(mut self) -> Result<(), ProvisioningError> {
        self.events.close();
        while self.events.recv().await.is_some() {}
        match self.completion.await {
            Ok(result) => result,
            Err(e) => Err(ProvisioningError::Aborted(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ProvisioningDriver
// ---------------------------------------------------------------------------

/// Runs the provisioning CLI, one process per step.
#[derive(Debug, Clone)]
pub struct ProvisioningDriver {
    config: ProvisionerConfig,
    secrets: SecretRegistry,
}

impl ProvisioningDriver {
    pub fn new(config: ProvisionerConfig, secrets: SecretRegistry) -> Self {
        Self { config, secrets }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Spawn the CLI for `step` and start streaming its output.
    ///
    /// Cancelling `cancel` kills the whole process group.
    pub fn run(
        &self,
        step: ProvisionStep,
        request: &ProvisionRequest,
        cancel: CancellationToken,
    ) -> Result<ProvisionRun, ProvisioningError> {
        let command = build_command(&self.config, step, request);
        info!(
            workspace_id = request.workspace_id,
            step = %step,
            "running {}",
            command.masked(&self.secrets, request.access_token.as_deref()),
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        platform::configure_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ProvisioningError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let child_pid = child.id();
        debug!(workspace_id = request.workspace_id, pid = ?child_pid, "provisioner spawned");

        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        if let Some(out) = child.stdout.take() {
            tokio::spawn(pipe_lines(out, line_tx.clone(), request.workspace_id, "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pipe_lines(err, line_tx, request.workspace_id, "stderr"));
        }

        let (event_tx, event_rx) = mpsc::channel(LINE_BUFFER);
        let completion = tokio::spawn(supervise(
            child,
            child_pid,
            line_rx,
            event_tx,
            cancel,
            command.program,
            request.workspace_id,
        ));

        Ok(ProvisionRun {
            events: event_rx,
            completion,
        })
    }

    /// Run each configured setup command once, logging failures.
    pub async fn prepare(&self) {
        for argv in &self.config.setup {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            let shown = self.secrets.mask_value(&argv.join(" "));
            match Command::new(program).args(args).output().await {
                Ok(output) if output.status.success() => {
                    info!(command = %shown, "provisioner setup done")
                }
                Ok(output) => warn!(
                    command = %shown,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "provisioner setup failed"
                ),
                Err(e) => warn!(command = %shown, error = %e, "provisioner setup failed to spawn"),
            }
        }
    }
}

/// Forward each line of `reader` to `tx` until EOF or the receiver goes away.
async fn pipe_lines<R>(reader: R, tx: mpsc::Sender<String>, workspace_id: u64, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = line.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(text).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(workspace_id, stream, error = %e, "provisioner read error");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    child_pid: Option<u32>,
    mut lines: mpsc::Receiver<String>,
    events: mpsc::Sender<LineEvent>,
    cancel: CancellationToken,
    program: String,
    workspace_id: u64,
) -> Result<(), ProvisioningError> {
    let mut fatal_seen = false;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                let event = classify(line);
                let fatal = event.is_failure();
                if events.send(event).await.is_err() {
                    debug!(workspace_id, "line consumer went away");
                }
                if fatal {
                    fatal_seen = true;
                    break;
                }
            }
            _ = cancel.cancelled() => {
                warn!(workspace_id, "provisioning cancelled, killing process group");
                platform::kill_child(&mut child, child_pid).await;
                return Err(ProvisioningError::Cancelled);
            }
        }
    }

    // Stop reading; the readers exit on their next send.
    drop(lines);
    drop(events);

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| ProvisioningError::Aborted(e.to_string()))?,
        _ = cancel.cancelled() => {
            warn!(workspace_id, "provisioning cancelled, killing process group");
            platform::kill_child(&mut child, child_pid).await;
            return Err(ProvisioningError::Cancelled);
        }
    };

    match exit_verdict(status.success(), fatal_seen) {
        ExitVerdict::Success => {
            info!(workspace_id, "{} exited successfully", program);
            Ok(())
        }
        ExitVerdict::FatalAlreadyReported => {
            warn!(workspace_id, %status, "{} exited after a fatal line, treating run as reported", program);
            Ok(())
        }
        ExitVerdict::ProcessError => {
            warn!(workspace_id, %status, "{} exited with error", program);
            Err(ProvisioningError::Exit {
                program,
                status: status.to_string(),
            })
        }
    }
}
