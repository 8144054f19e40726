use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
use windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;

pub fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd.exe");
    cmd.arg("/C").arg(command);
    cmd
}

pub fn configure_process_group(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

pub async fn terminate_child(child: &mut tokio::process::Child, child_pid: Option<u32>) {
    if let Some(pid) = child_pid {
        // SAFETY: pid is the group id of a process group this process created.
        unsafe {
            if GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) != 0 {
                debug!(pid, "sent CTRL_BREAK_EVENT");
            }
        }

        if let Ok(Ok(_status)) = tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            debug!(pid, "child exited after CTRL_BREAK");
            return;
        }
        debug!(pid, "child did not exit within 5s, terminating");
    }

    kill_child(child, child_pid).await;
}

pub async fn kill_child(child: &mut tokio::process::Child, _child_pid: Option<u32>) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}
