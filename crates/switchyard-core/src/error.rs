// ABOUTME: Error types for backend invocation
// ABOUTME: ErrorCode taxonomy, per-run RunError, and the caller-facing BackendInvocationError

use crate::types::BackendName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a backend attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Timeout,
    ExitNonzero,
    OutputTooLarge,
    SpawnFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::ExitNonzero => "exit-nonzero",
            ErrorCode::OutputTooLarge => "output-too-large",
            ErrorCode::SpawnFailure => "spawn-failure",
        }
    }

    /// Transient codes are worth retrying later; the flag only changes how
    /// failures are reported, every code still fails over.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorCode::OutputTooLarge)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single process run, before it is attributed to a backend.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("process output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },

    #[error("process exited with status {}", exit_code_label(.code))]
    ExitNonzero { code: Option<i32>, stderr: String },

    #[error("failed to read process output: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "unknown (terminated by signal)".to_string())
}

impl RunError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RunError::Spawn { .. } => ErrorCode::SpawnFailure,
            RunError::Timeout { .. } => ErrorCode::Timeout,
            RunError::OutputTooLarge { .. } => ErrorCode::OutputTooLarge,
            // A pipe read failure mid-run looks like the process dying under us
            RunError::ExitNonzero { .. } | RunError::Io(_) => ErrorCode::ExitNonzero,
        }
    }

    /// Human-readable details for the caller, including the stderr excerpt
    /// when the process exited on its own.
    pub fn details(&self) -> String {
        match self {
            RunError::ExitNonzero { stderr, .. } if !stderr.is_empty() => {
                format!("{self}\n{stderr}")
            }
            _ => self.to_string(),
        }
    }

    pub fn into_invocation_error(self, backend: BackendName) -> BackendInvocationError {
        let code = self.code();
        BackendInvocationError {
            backend,
            code,
            transient: code.is_transient(),
            details: Some(self.details()),
        }
    }
}

/// The single terminal error a failed request surfaces to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{backend} backend failed ({code}){}", details_suffix(.details))]
pub struct BackendInvocationError {
    pub backend: BackendName,
    pub code: ErrorCode,
    pub transient: bool,
    pub details: Option<String>,
}

fn details_suffix(details: &Option<String>) -> String {
    match details {
        Some(d) if !d.is_empty() => format!(": {d}"),
        _ => String::new(),
    }
}

impl BackendInvocationError {
    pub fn new(backend: BackendName, code: ErrorCode, details: impl Into<String>) -> Self {
        Self {
            backend,
            code,
            transient: code.is_transient(),
            details: Some(details.into()),
        }
    }
}
