use std::fmt;

use crate::config::model::ProvisionerConfig;
use crate::config::secrets::SecretRegistry;

/// One invocation of the provisioning CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Up,
    Stop,
    Delete,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::Up => "up",
            ProvisionStep::Stop => "stop",
            ProvisionStep::Delete => "delete",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the driver needs to know about the workspace it provisions.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub workspace_id: u64,
    pub repository_url: String,
    pub access_token: Option<String>,
    pub machine_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProvisionCommand {
    /// Command line for logs with tokens and tracked secrets masked.
    pub fn masked(&self, secrets: &SecretRegistry, token: Option<&str>) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        let line = secrets.mask_value(&line);
        match token.filter(|t| !t.is_empty()) {
            Some(token) => line.replace(token, "****"),
            None => line,
        }
    }
}

/// Embed a git access token into a repository URL as `git:<token>@`.
pub fn inject_token(repository_url: &str, token: Option<&str>) -> String {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return repository_url.to_string();
    };
    match repository_url.strip_prefix("https://") {
        Some(rest) => format!("https://git:{}@{}", token, rest),
        None => format!("git:{}@{}", token, repository_url),
    }
}

pub fn build_command(
    config: &ProvisionerConfig,
    step: ProvisionStep,
    request: &ProvisionRequest,
) -> ProvisionCommand {
    let id = request.workspace_id.to_string();
    let args = match step {
        ProvisionStep::Up => {
            let mut args = vec![
                "up".to_string(),
                inject_token(&request.repository_url, request.access_token.as_deref()),
                "--id".to_string(),
                id,
                "--ide".to_string(),
                config.ide.clone(),
                "--provider-option".to_string(),
                format!("{}={}", config.machine_option, request.machine_type),
            ];
            for (key, value) in &config.provider_options {
                args.push("--provider-option".to_string());
                args.push(format!("{}={}", key, value));
            }
            args
        }
        ProvisionStep::Stop => vec!["stop".to_string(), id],
        ProvisionStep::Delete => vec!["delete".to_string(), id, "--force".to_string()],
    };

    ProvisionCommand {
        program: config.binary.clone(),
        args,
    }
}
