// ABOUTME: Shared value types for the invocation pipeline
// ABOUTME: Backend names and modes, invoke requests, streamed lines, and caller events

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The closed set of command-line backends switchyard knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendName {
    Claude,
    Codex,
}

impl BackendName {
    pub const ALL: [BackendName; 2] = [BackendName::Claude, BackendName::Codex];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendName::Claude => "claude",
            BackendName::Codex => "codex",
        }
    }
}

impl fmt::Display for BackendName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(BackendName::Claude),
            "codex" => Ok(BackendName::Codex),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Which backend a caller asked for.
///
/// `Explicit` pins a single backend and opts out of failover; `Auto` lets the
/// router pick from the healthy backends in preferred order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendMode {
    #[default]
    Auto,
    Explicit(BackendName),
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::Auto => f.write_str("auto"),
            BackendMode::Explicit(name) => name.fmt(f),
        }
    }
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(BackendMode::Auto);
        }
        s.parse().map(BackendMode::Explicit)
    }
}

impl From<BackendName> for BackendMode {
    fn from(name: BackendName) -> Self {
        BackendMode::Explicit(name)
    }
}

/// One chat request as handed to a backend. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct BackendInvokeRequest {
    pub prompt: String,
    pub session_id: String,
    pub workspace_dir: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub cancellation: CancellationToken,
}

impl BackendInvokeRequest {
    pub fn new(
        prompt: impl Into<String>,
        session_id: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: session_id.into(),
            workspace_dir: workspace_dir.into(),
            timeout: Duration::from_secs(300),
            max_output_bytes: 8 * 1024 * 1024,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// A single line read from a running backend process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedLine {
    pub source: StreamSource,
    pub line: String,
}

impl StreamedLine {
    pub fn stdout(line: impl Into<String>) -> Self {
        Self {
            source: StreamSource::Stdout,
            line: line.into(),
        }
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self {
            source: StreamSource::Stderr,
            line: line.into(),
        }
    }
}

/// Events handed to the caller while a request streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendStreamEvent {
    /// Incremental assistant text
    Delta { text: String },
}

impl BackendStreamEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        BackendStreamEvent::Delta { text: text.into() }
    }

    pub fn text(&self) -> &str {
        match self {
            BackendStreamEvent::Delta { text } => text,
        }
    }
}
