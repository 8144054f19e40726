use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

use super::model::WorkspacedConfig;

/// Compiled pattern matching `$VAR`, `${VAR}`, and `$$` escape sequences.
static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)|\$\$")
        .expect("valid regex")
});

// ---------------------------------------------------------------------------
// SecretRegistry: tracks secret values for masking
// ---------------------------------------------------------------------------

/// Tracks expanded secret values so they can be masked in logged command lines.
#[derive(Debug, Clone, Default)]
pub struct SecretRegistry {
    secret_values: HashSet<String>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, value: &str) {
        if !value.is_empty() {
            self.secret_values.insert(value.to_string());
        }
    }

    /// Replace any known secret substrings in `value` with `****`.
    pub fn mask_value(&self, value: &str) -> String {
        let mut result = value.to_string();
        for secret in &self.secret_values {
            result = result.replace(secret.as_str(), "****");
        }
        result
    }

    pub fn contains_secret(&self, value: &str) -> bool {
        self.secret_values.iter().any(|s| value.contains(s.as_str()))
    }
}

// ---------------------------------------------------------------------------
// .env file parser
// ---------------------------------------------------------------------------

/// Parse a `.env` file into key-value pairs.
///
/// Supports: `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'`, `# comments`, blank lines.
/// Returns an empty map if the file does not exist.
pub fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading .env file {}", path.display()))?;

    parse_env_content(&content)
}

fn parse_env_content(content: &str) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();

    for (line_num, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((key, value)) = trimmed.split_once('=') else {
            bail!(
                ".env line {}: expected KEY=VALUE, got {:?}",
                line_num + 1,
                trimmed
            );
        };

        let key = key.trim().trim_start_matches("export ").trim().to_string();
        if key.is_empty() {
            bail!(".env line {}: empty key", line_num + 1);
        }

        let value = value.trim();
        let value = if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            &value[1..value.len() - 1]
        } else {
            value
        };

        vars.insert(key, value.to_string());
    }

    Ok(vars)
}

// ---------------------------------------------------------------------------
// $VAR expansion engine
// ---------------------------------------------------------------------------

/// Expand `$VAR`, `${VAR}`, and `$$` escape sequences in a string.
///
/// Lookup order: (1) `env_file_vars`, (2) host process env.
/// Returns `(expanded_string, had_expansion)`.
pub fn expand_env_vars(
    input: &str,
    env_file_vars: &BTreeMap<String, String>,
    field_context: &str,
) -> Result<(String, bool)> {
    if !input.contains('$') {
        return Ok((input.to_string(), false));
    }

    let mut result = String::with_capacity(input.len());
    let mut last_end = 0;
    let mut had_expansion = false;

    for caps in ENV_VAR_RE.captures_iter(input) {
        let Some(m) = caps.get(0) else { continue };
        result.push_str(&input[last_end..m.start()]);

        match caps.get(1).or_else(|| caps.get(2)) {
            None => result.push('$'),
            Some(name) => {
                let var_name = name.as_str();
                let value = env_file_vars
                    .get(var_name)
                    .cloned()
                    .or_else(|| std::env::var(var_name).ok());

                match value {
                    Some(val) => {
                        result.push_str(&val);
                        had_expansion = true;
                    }
                    None => bail!(
                        "undefined environment variable ${} in {}",
                        var_name,
                        field_context
                    ),
                }
            }
        }

        last_end = m.end();
    }

    result.push_str(&input[last_end..]);
    Ok((result, had_expansion))
}

/// Expand `$VAR` references in provider options, setup commands and the proxy
/// worker host.
///
/// Variables come from `provisioner.env_file` (resolved against `config_dir`)
/// before the process environment. Every expanded provider option and setup
/// argument is tracked as a secret.
pub fn expand_config_env_vars(
    config: &mut WorkspacedConfig,
    config_dir: &Path,
) -> Result<SecretRegistry> {
    let env_file_vars = match &config.provisioner.env_file {
        Some(env_file) => parse_env_file(&config_dir.join(crate::platform::expand_home(env_file)))
            .with_context(|| format!("loading provisioner env_file {:?}", env_file))?,
        None => BTreeMap::new(),
    };

    let mut registry = SecretRegistry::new();

    let mut expanded_options = BTreeMap::new();
    for (key, value) in &config.provisioner.provider_options {
        let (expanded, was_secret) = expand_env_vars(
            value,
            &env_file_vars,
            &format!("provisioner.provider_options.{key}"),
        )?;
        if was_secret {
            registry.track(&expanded);
        }
        expanded_options.insert(key.clone(), expanded);
    }
    config.provisioner.provider_options = expanded_options;

    for (i, argv) in config.provisioner.setup.iter_mut().enumerate() {
        for arg in argv.iter_mut() {
            let (expanded, was_secret) =
                expand_env_vars(arg, &env_file_vars, &format!("provisioner.setup[{i}]"))?;
            if was_secret {
                registry.track(&expanded);
            }
            *arg = expanded;
        }
    }

    let (worker_host, _) =
        expand_env_vars(&config.proxy.worker_host, &env_file_vars, "proxy.worker_host")?;
    config.proxy.worker_host = worker_host;

    Ok(registry)
}
