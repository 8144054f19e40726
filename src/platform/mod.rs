use tokio::process::Command;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as imp;
#[cfg(windows)]
use windows as imp;

/// Create a platform-appropriate shell command.
/// Unix: `sh -c <command>`, Windows: `cmd.exe /C <command>`
pub fn shell_command(command: &str) -> Command {
    imp::shell_command(command)
}

/// Configure the command to run in a new process group.
/// Unix: `process_group(0)`, Windows: `CREATE_NEW_PROCESS_GROUP`
pub fn configure_process_group(cmd: &mut Command) {
    imp::configure_process_group(cmd)
}

/// Gracefully terminate a child process and its process group.
/// Forcefully kills after 5 seconds.
pub async fn terminate_child(child: &mut tokio::process::Child, child_pid: Option<u32>) {
    imp::terminate_child(child, child_pid).await
}

/// Kill a child process and its process group immediately (SIGKILL).
pub async fn kill_child(child: &mut tokio::process::Child, child_pid: Option<u32>) {
    imp::kill_child(child, child_pid).await
}

/// Expand leading `~` or `$HOME` in a path string to the actual home directory.
///
/// Returns the original string unchanged when no home directory is available
/// or the string doesn't start with `~` or `$HOME`.
pub fn expand_home(path: &str) -> String {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        let home = home.to_string_lossy();
        if path == "~" || path == "$HOME" {
            return home.to_string();
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return format!("{}/{}", home, rest);
        }
        if let Some(rest) = path
            .strip_prefix("$HOME/")
            .or_else(|| path.strip_prefix("$HOME\\"))
        {
            return format!("{}/{}", home, rest);
        }
    }
    path.to_string()
}
