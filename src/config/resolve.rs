use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "workspaced.toml";

/// Walk up the directory tree from `start`, checking for `filename` at each level.
pub fn find_config(start: &Path, filename: &str) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(filename);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Resolve the config file path.
///
/// An explicit `-f` path must exist. Without one, the current directory and
/// its parents are searched for `workspaced.toml`; `Ok(None)` means none was
/// found and built-in defaults apply.
pub fn resolve_config(cli_file: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = cli_file {
        if path.is_file() {
            return Ok(Some(path.canonicalize()?));
        }
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let cwd = std::env::current_dir()?;
    Ok(find_config(&cwd, CONFIG_FILENAME))
}
