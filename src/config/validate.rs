// The miette/thiserror derive macros generate code that triggers false
// positive unused_assignments warnings on enum variant fields.
#![allow(unused_assignments)]

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::config::model::WorkspacedConfig;

// ---------------------------------------------------------------------------
// ConfigDiagnostic: miette-powered validation error
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigDiagnostic {
    #[error("ports.window must be at least 1")]
    #[diagnostic(code(workspaced::empty_port_window))]
    EmptyPortWindow {
        #[source_code]
        src: NamedSource<String>,
        #[label("no candidate ports")]
        span: SourceSpan,
    },

    #[error("port window {base}+{window} runs past 65535")]
    #[diagnostic(
        code(workspaced::port_window_overflow),
        help("lower ports.base or ports.window")
    )]
    PortWindowOverflow {
        #[source_code]
        src: NamedSource<String>,
        #[label("window ends beyond the last port")]
        span: SourceSpan,
        base: u16,
        window: u16,
    },

    #[error("queue.concurrency must be at least 1")]
    #[diagnostic(code(workspaced::zero_concurrency))]
    ZeroConcurrency {
        #[source_code]
        src: NamedSource<String>,
        #[label("no workers would run")]
        span: SourceSpan,
    },

    #[error("invalid duration `{value}` for {field}")]
    #[diagnostic(
        code(workspaced::invalid_duration),
        help("use a humantime value such as \"30s\", \"5m\" or \"1h 30m\"")
    )]
    InvalidDuration {
        #[source_code]
        src: NamedSource<String>,
        #[label("not a duration")]
        span: SourceSpan,
        field: String,
        value: String,
    },

    #[error("{field} must be greater than zero")]
    #[diagnostic(code(workspaced::zero_duration))]
    ZeroDuration {
        #[source_code]
        src: NamedSource<String>,
        #[label("zero duration")]
        span: SourceSpan,
        field: String,
    },

    #[error("hub.ping_period must be shorter than hub.pong_wait")]
    #[diagnostic(
        code(workspaced::ping_after_pong_wait),
        help("peers time out the connection before the next ping arrives")
    )]
    PingNotBeforePongWait {
        #[source_code]
        src: NamedSource<String>,
        #[label("ping period is too long")]
        span: SourceSpan,
    },

    #[error("ports.forward_command is missing the `{placeholder}` placeholder")]
    #[diagnostic(code(workspaced::forward_placeholder))]
    MissingForwardPlaceholder {
        #[source_code]
        src: NamedSource<String>,
        #[label("expected {placeholder} here")]
        span: SourceSpan,
        placeholder: String,
    },

    #[error("{field} is empty")]
    #[diagnostic(code(workspaced::empty_value))]
    EmptyValue {
        #[source_code]
        src: NamedSource<String>,
        #[label("empty value")]
        span: SourceSpan,
        field: String,
    },
}

// ---------------------------------------------------------------------------
// Source span helpers
// ---------------------------------------------------------------------------

/// Byte span of the value of `field` inside the `[section]` table, falling back
/// to the table header, then to the start of the file.
fn find_field_span(source: &str, section: &str, field: &str) -> SourceSpan {
    let header = format!("[{}]", section);
    let Some(header_pos) = source.find(&header) else {
        return (0, 0).into();
    };
    let after_header = &source[header_pos..];
    let table_end = after_header[header.len()..]
        .find("\n[")
        .map(|p| p + header.len())
        .unwrap_or(after_header.len());
    let table = &after_header[..table_end];

    for line_start in std::iter::once(0).chain(table.match_indices('\n').map(|(i, _)| i + 1)) {
        let line = &table[line_start..];
        let line = line.split('\n').next().unwrap_or("");
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix(field) else {
            continue;
        };
        if !rest.trim_start().starts_with('=') {
            continue;
        }
        let Some(eq) = line.find('=') else { continue };
        let value = line[eq + 1..].trim();
        let value_offset = line[eq + 1..].find(value).unwrap_or(0) + eq + 1;
        return (header_pos + line_start + value_offset, value.len()).into();
    }

    (header_pos, header.len()).into()
}

fn check_duration(
    errors: &mut Vec<ConfigDiagnostic>,
    src: &NamedSource<String>,
    source: &str,
    section: &str,
    field: &str,
    value: &str,
) -> Option<std::time::Duration> {
    match humantime::parse_duration(value) {
        Ok(d) => Some(d),
        Err(_) => {
            errors.push(ConfigDiagnostic::InvalidDuration {
                src: src.clone(),
                span: find_field_span(source, section, field),
                field: format!("{section}.{field}"),
                value: value.to_string(),
            });
            None
        }
    }
}

/// Like [`check_duration`], but a zero value is also an error. Used for
/// periods that drive timers.
fn check_period(
    errors: &mut Vec<ConfigDiagnostic>,
    src: &NamedSource<String>,
    source: &str,
    section: &str,
    field: &str,
    value: &str,
) -> Option<std::time::Duration> {
    let period = check_duration(errors, src, source, section, field, value)?;
    if period.is_zero() {
        errors.push(ConfigDiagnostic::ZeroDuration {
            src: src.clone(),
            span: find_field_span(source, section, field),
            field: format!("{section}.{field}"),
        });
        return None;
    }
    Some(period)
}

// ---------------------------------------------------------------------------
// Main validation function
// ---------------------------------------------------------------------------

/// Check a parsed config, collecting every problem rather than stopping at the first.
pub fn validate(
    config: &WorkspacedConfig,
    source: &str,
    filename: &str,
) -> Result<(), Vec<ConfigDiagnostic>> {
    let mut errors = Vec::new();
    let src = NamedSource::new(filename, source.to_string());

    let ports = &config.ports;
    if ports.window == 0 {
        errors.push(ConfigDiagnostic::EmptyPortWindow {
            src: src.clone(),
            span: find_field_span(source, "ports", "window"),
        });
    } else if u32::from(ports.base) + u32::from(ports.window) - 1 > u32::from(u16::MAX) {
        errors.push(ConfigDiagnostic::PortWindowOverflow {
            src: src.clone(),
            span: find_field_span(source, "ports", "window"),
            base: ports.base,
            window: ports.window,
        });
    }

    for placeholder in ["{external}", "{internal}"] {
        if !ports.forward_command.contains(placeholder) {
            errors.push(ConfigDiagnostic::MissingForwardPlaceholder {
                src: src.clone(),
                span: find_field_span(source, "ports", "forward_command"),
                placeholder: placeholder.to_string(),
            });
        }
    }

    check_duration(&mut errors, &src, source, "ports", "ready_timeout", &ports.ready_timeout);

    if config.queue.concurrency == 0 {
        errors.push(ConfigDiagnostic::ZeroConcurrency {
            src: src.clone(),
            span: find_field_span(source, "queue", "concurrency"),
        });
    }
    check_period(&mut errors, &src, source, "queue", "unique_ttl", &config.queue.unique_ttl);
    check_duration(&mut errors, &src, source, "queue", "retry_delay", &config.queue.retry_delay);

    let hub = &config.hub;
    let ping = check_period(&mut errors, &src, source, "hub", "ping_period", &hub.ping_period);
    let pong = check_period(&mut errors, &src, source, "hub", "pong_wait", &hub.pong_wait);
    check_period(&mut errors, &src, source, "hub", "write_wait", &hub.write_wait);
    if let (Some(ping), Some(pong)) = (ping, pong) {
        if ping >= pong {
            errors.push(ConfigDiagnostic::PingNotBeforePongWait {
                src: src.clone(),
                span: find_field_span(source, "hub", "ping_period"),
            });
        }
    }

    check_period(
        &mut errors,
        &src,
        source,
        "reconcile",
        "interval",
        &config.reconcile.interval,
    );

    for (section, field, value) in [
        ("proxy", "base_domain", &config.proxy.base_domain),
        ("proxy", "worker_host", &config.proxy.worker_host),
        ("provisioner", "binary", &config.provisioner.binary),
    ] {
        if value.trim().is_empty() {
            errors.push(ConfigDiagnostic::EmptyValue {
                src: src.clone(),
                span: find_field_span(source, section, field),
                field: format!("{section}.{field}"),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_FILENAME: &str = "workspaced.toml";

    fn check(source: &str) -> Result<(), Vec<ConfigDiagnostic>> {
        let config: WorkspacedConfig = toml::from_str(source).unwrap();
        validate(&config, source, TEST_FILENAME)
    }

    #[test]
    fn defaults_are_valid() {
        assert!(check("").is_ok());
    }

    #[test]
    fn zero_window_detected() {
        let errs = check("[ports]\nwindow = 0\n").unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], ConfigDiagnostic::EmptyPortWindow { .. }));
    }

    #[test]
    fn window_past_last_port_detected() {
        let errs = check("[ports]\nbase = 65000\nwindow = 1000\n").unwrap_err();
        assert!(matches!(
            errs[0],
            ConfigDiagnostic::PortWindowOverflow {
                base: 65000,
                window: 1000,
                ..
            }
        ));
    }

    #[test]
    fn ping_must_precede_pong_wait() {
        let errs = check("[hub]\nping_period = \"60s\"\npong_wait = \"60s\"\n").unwrap_err();
        assert!(matches!(errs[0], ConfigDiagnostic::PingNotBeforePongWait { .. }));
    }

    #[test]
    fn zero_timer_periods_rejected() {
        let source = "[queue]\nunique_ttl = \"0s\"\n\n[hub]\nping_period = \"0s\"\nwrite_wait = \"0ms\"\n\n[reconcile]\ninterval = \"0s\"\n";
        let errs = check(source).unwrap_err();
        let fields: Vec<&str> = errs
            .iter()
            .map(|e| match e {
                ConfigDiagnostic::ZeroDuration { field, .. } => field.as_str(),
                other => panic!("unexpected diagnostic: {other:?}"),
            })
            .collect();
        assert_eq!(
            fields,
            vec!["queue.unique_ttl", "hub.ping_period", "hub.write_wait", "reconcile.interval"]
        );
    }

    #[test]
    fn zero_pong_wait_rejected_once() {
        let errs = check("[hub]\npong_wait = \"0s\"\n").unwrap_err();
        assert_eq!(errs.len(), 1, "got: {errs:?}");
        assert!(matches!(errs[0], ConfigDiagnostic::ZeroDuration { .. }));
    }

    #[test]
    fn forward_command_needs_both_placeholders() {
        let errs = check("[ports]\nforward_command = \"socat TCP-LISTEN:{external}\"\n").unwrap_err();
        assert_eq!(errs.len(), 1);
        match &errs[0] {
            ConfigDiagnostic::MissingForwardPlaceholder { placeholder, .. } => {
                assert_eq!(placeholder, "{internal}")
            }
            other => panic!("unexpected diagnostic: {other:?}"),
        }
    }

    #[test]
    fn multiple_errors_collected() {
        let source = "[queue]\nconcurrency = 0\nunique_ttl = \"whenever\"\n\n[proxy]\nbase_domain = \"\"\n";
        let errs = check(source).unwrap_err();
        assert_eq!(errs.len(), 3, "got: {errs:?}");
    }

    #[test]
    fn span_points_at_field_value() {
        let source = "[queue]\nconcurrency = 0\n";
        let span = find_field_span(source, "queue", "concurrency");
        assert_eq!(&source[span.offset()..span.offset() + span.len()], "0");
    }

    #[test]
    fn diagnostics_carry_codes() {
        let errs = check("[ports]\nready_timeout = \"later\"\n").unwrap_err();
        for err in &errs {
            assert!(!err.to_string().is_empty());
            let diag: &dyn Diagnostic = err;
            assert!(diag.code().is_some());
        }
    }
}
