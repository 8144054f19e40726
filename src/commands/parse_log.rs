use anyhow::{Context, Result};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use std::path::Path;

use crate::provisioner::protocol::{extract_machine_name, extract_url, internal_port, parse_log_line, strip_ansi};
use crate::provisioner::{classify, LineEvent};

/// One analysed line of a captured provisioning log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineReport {
    pub event: &'static str,
    pub log_type: String,
    pub text: String,
    pub facts: Vec<String>,
}

/// Classify `content` the way a live run would, stopping after the first
/// fatal line.
pub fn analyze(content: &str) -> Vec<LineReport> {
    let mut reports = Vec::new();
    for raw in content.lines() {
        let event = classify(raw.to_string());
        let Some(parsed) = parse_log_line(raw, event.log_type(), "--:--:--") else {
            continue;
        };

        let clean = strip_ansi(raw);
        let mut facts = Vec::new();
        if let Some(machine) = extract_machine_name(&clean) {
            facts.push(format!("machine={}", machine));
        }
        if let Some(url) = extract_url(&clean) {
            match internal_port(url) {
                Some(port) => facts.push(format!("internal_port={}", port)),
                None => facts.push(format!("url={}", url)),
            }
        }

        let failed = event.is_failure();
        reports.push(LineReport {
            event: match event {
                LineEvent::Progress(_) => "progress",
                LineEvent::Completed(_) => "completed",
                LineEvent::Failed(_) => "failed",
            },
            log_type: parsed.log_type,
            text: parsed.text,
            facts,
        });
        if failed {
            break;
        }
    }
    reports
}

pub fn run(file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let use_color = std::io::stdout().is_terminal();

    for report in analyze(&content) {
        let event = format!("{:<9}", report.event);
        let event = if !use_color {
            event
        } else {
            match report.event {
                "failed" => event.red().to_string(),
                "completed" => event.green().to_string(),
                _ => event.dimmed().to_string(),
            }
        };
        let facts = if report.facts.is_empty() {
            String::new()
        } else {
            format!("  [{}]", report.facts.join(" "))
        };
        println!("{} {:<6} {}{}", event, report.log_type, report.text, facts);
    }
    Ok(())
}
