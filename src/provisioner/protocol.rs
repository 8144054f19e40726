//! Line protocol spoken by the provisioning CLI.
//!
//! Every output line is classified into a [`LineEvent`]; the start flow also
//! mines lines for the machine handle and the internal workspace URL.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;

static MACHINE_CREATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Create machine '([^']+)'").expect("valid regex"));

static OPENED_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Successfully opened (http[^\s]+)").expect("valid regex"));

static STOPPED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Successfully stopped").expect("valid regex"));

static DELETED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Successfully deleted workspace").expect("valid regex"));

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid regex"));

static LOG_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<time>\d{2}:\d{2}:\d{2})\s+(?P<type>\w+)\s+(?P<text>.+)$")
        .expect("valid regex")
});

const FATAL_TOKEN: &str = "fatal";
const DONE_TOKEN: &str = "done";

// ---------------------------------------------------------------------------
// LineEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Info,
    Done,
    Fatal,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Info => "INFO",
            LogType::Done => "DONE",
            LogType::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified line of provisioning output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// Benign progress output (`info` marker or anything unrecognised).
    Progress(String),
    /// A `done` marker line.
    Completed(String),
    /// A `fatal` marker line. Nothing after it is read.
    Failed(String),
}

impl LineEvent {
    pub fn line(&self) -> &str {
        match self {
            LineEvent::Progress(l) | LineEvent::Completed(l) | LineEvent::Failed(l) => l,
        }
    }

    pub fn log_type(&self) -> LogType {
        match self {
            LineEvent::Progress(_) => LogType::Info,
            LineEvent::Completed(_) => LogType::Done,
            LineEvent::Failed(_) => LogType::Fatal,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, LineEvent::Failed(_))
    }
}

/// Classify a raw output line. The fatal marker wins over every other marker.
pub fn classify(line: String) -> LineEvent {
    if line.contains(FATAL_TOKEN) {
        LineEvent::Failed(line)
    } else if line.contains(DONE_TOKEN) {
        LineEvent::Completed(line)
    } else {
        // `info` lines and unrecognised output alike
        LineEvent::Progress(line)
    }
}

// ---------------------------------------------------------------------------
// Extraction rules
// ---------------------------------------------------------------------------

/// Provisioning handle from a `Create machine '<name>'` line.
pub fn extract_machine_name(line: &str) -> Option<&str> {
    MACHINE_CREATE_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Workspace URL from a `Successfully opened <url>` line.
pub fn extract_url(line: &str) -> Option<&str> {
    OPENED_URL_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Explicit port of a workspace URL; the port the workspace listens on locally.
pub fn internal_port(url: &str) -> Option<u16> {
    Url::parse(url).ok()?.port()
}

pub fn is_stop_success(line: &str) -> bool {
    STOPPED_RE.is_match(line)
}

pub fn is_delete_success(line: &str) -> bool {
    DELETED_RE.is_match(line)
}

// ---------------------------------------------------------------------------
// Log line cleanup
// ---------------------------------------------------------------------------

/// A provisioning line reduced to the fields clients display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLog {
    pub time: String,
    pub log_type: String,
    pub text: String,
}

pub fn strip_ansi(line: &str) -> String {
    ANSI_RE.replace_all(line, "").into_owned()
}

/// Split `HH:MM:SS <type> <text>` output into its fields after stripping ANSI
/// colour codes. Lines in any other shape keep their text and take `now` and
/// `fallback_type`. Returns `None` for lines with nothing left to show.
pub fn parse_log_line(line: &str, fallback_type: LogType, now: &str) -> Option<ParsedLog> {
    let clean = strip_ansi(line.trim());
    let clean = clean.trim();
    if clean.is_empty() {
        return None;
    }

    if let Some(caps) = LOG_LINE_RE.captures(clean) {
        return Some(ParsedLog {
            time: caps["time"].to_string(),
            log_type: caps["type"].to_string(),
            text: caps["text"].to_string(),
        });
    }

    Some(ParsedLog {
        time: now.to_string(),
        log_type: fallback_type.as_str().to_lowercase(),
        text: clean.to_string(),
    })
}
