pub mod model;
pub mod resolve;
pub mod secrets;
pub mod validate;

use std::path::{Path, PathBuf};

use anyhow::Context;

use model::WorkspacedConfig;
use secrets::SecretRegistry;

/// Read and parse a config file, returning the raw source alongside for diagnostics.
pub fn load_config(path: &Path) -> anyhow::Result<(WorkspacedConfig, String)> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: WorkspacedConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
    Ok((config, content))
}

/// A config ready to run with: validated, `$VAR`-expanded, secrets tracked.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: WorkspacedConfig,
    pub secrets: SecretRegistry,
    pub path: Option<PathBuf>,
}

/// Resolve, parse, validate and expand the config. Without a file the
/// built-in defaults are used.
pub fn load(cli_file: Option<&Path>) -> anyhow::Result<LoadedConfig> {
    let Some(path) = resolve::resolve_config(cli_file)? else {
        return Ok(LoadedConfig {
            config: WorkspacedConfig::default(),
            secrets: SecretRegistry::new(),
            path: None,
        });
    };

    let (mut config, source) = load_config(&path)?;
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| resolve::CONFIG_FILENAME.to_string());

    if let Err(errors) = validate::validate(&config, &source, &filename) {
        let count = errors.len();
        for err in errors {
            let report: miette::Report = err.into();
            eprintln!("{:?}", report);
        }
        anyhow::bail!("{} has {} configuration error(s)", filename, count);
    }

    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let secrets = secrets::expand_config_env_vars(&mut config, config_dir)
        .with_context(|| format!("expanding variables in {}", path.display()))?;

    Ok(LoadedConfig {
        config,
        secrets,
        path: Some(path),
    })
}
