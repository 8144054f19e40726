use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

pub fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

pub fn configure_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

pub async fn terminate_child(child: &mut tokio::process::Child, child_pid: Option<u32>) {
    let Some(pid) = child_pid else {
        let _ = child.kill().await;
        return;
    };

    match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => debug!(pid, "sent SIGTERM to process group"),
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, "process group already exited");
            let _ = child.wait().await;
            return;
        }
        Err(e) => {
            warn!(pid, error = %e, "killpg(SIGTERM) failed, falling back to kill");
            let _ = child.kill().await;
            return;
        }
    }

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(_status)) => debug!(pid, "child exited after SIGTERM"),
        _ => {
            warn!(pid, "child did not exit within 5s, sending SIGKILL");
            kill_child(child, Some(pid)).await;
        }
    }
}

pub async fn kill_child(child: &mut tokio::process::Child, child_pid: Option<u32>) {
    if let Some(pid) = child_pid {
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pid, "sent SIGKILL to process group"),
            Err(nix::errno::Errno::ESRCH) => debug!(pid, "process group already exited"),
            Err(e) => warn!(pid, error = %e, "killpg(SIGKILL) failed"),
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}
