use anyhow::Result;
use owo_colors::OwoColorize;
use std::path::Path;

use crate::config;
use crate::config::model::WorkspacedConfig;
use crate::config::resolve::{resolve_config, CONFIG_FILENAME};
use crate::config::validate::validate;

fn summary(config: &WorkspacedConfig) -> String {
    let last_port = u32::from(config.ports.base) + u32::from(config.ports.window).saturating_sub(1);
    format!(
        "provisioner {}, ports {}-{}, {} workers",
        config.provisioner.binary, config.ports.base, last_port, config.queue.concurrency
    )
}

pub fn run(config_file: Option<&Path>) -> Result<()> {
    let Some(config_path) = resolve_config(config_file)? else {
        println!(
            "  {} no {} found, built-in defaults apply ({})",
            "\u{2713}".green(),
            CONFIG_FILENAME,
            summary(&WorkspacedConfig::default()),
        );
        return Ok(());
    };

    let (config, source) = config::load_config(&config_path)?;

    let filename = config_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| CONFIG_FILENAME.to_string());

    match validate(&config, &source, &filename) {
        Ok(()) => {
            println!(
                "  {} {} is valid ({})",
                "\u{2713}".green(),
                filename,
                summary(&config),
            );
            Ok(())
        }
        Err(errors) => {
            let count = errors.len();
            for err in errors {
                let report: miette::Report = err.into();
                eprintln!("{:?}", report);
            }
            anyhow::bail!("{} has {} configuration error(s)", filename, count)
        }
    }
}
