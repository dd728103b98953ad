//! Error types for the harness.

use std::path::PathBuf;
use thiserror::Error;

use crate::process::StreamKind;

/// Primary error type for harness operations.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The executable could not be started at all.
    #[error("Failed to launch '{program}' in {cwd}: {source}")]
    ProcessLaunch {
        program: String,
        cwd: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process ran but exited unsuccessfully.
    #[error("'{command}' failed for {cell} with {}", describe_exit(*exit_code))]
    ProcessExit {
        cell: String,
        command: String,
        exit_code: Option<i32>,
    },

    /// Reading one of the child's output pipes failed.
    #[error("Failed reading child {stream}: {source}")]
    Capture {
        stream: StreamKind,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the child to exit failed.
    #[error("Failed waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exceeded the configured timeout and was killed.
    #[error("'{program}' timed out after {secs:.1}s ({stdout_bytes} stdout / {stderr_bytes} stderr bytes captured)")]
    Timeout {
        program: String,
        secs: f64,
        stdout_bytes: usize,
        stderr_bytes: usize,
    },

    /// An expected anchor line was absent from the tool output.
    #[error("Failed to find metric '{metric}' on {stream}")]
    MetricNotFound { metric: String, stream: StreamKind },

    /// An anchor or histogram line was found but its value did not parse.
    #[error("Malformed value for metric '{metric}': {line:?}")]
    MalformedMetric { metric: String, line: String },

    /// The instrumented pass of a differential measurement failed.
    #[error("Instrumented run of {cell} failed with {}: {stderr_tail}", describe_exit(*exit_code))]
    InstrumentationRun {
        cell: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    /// The baseline pass of a differential measurement failed.
    #[error("Baseline run of {cell} failed with {}: {stderr_tail}", describe_exit(*exit_code))]
    BaselineRun {
        cell: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    /// Reading or writing a result file failed.
    #[error("Result store error at '{path}': {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A result file could not be (de)serialized.
    #[error("Result file '{path}' is not valid: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The grid configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No tool is configured for a suite/backend pairing.
    #[error("No instrumentation tool configured for backend '{backend}' in suite '{suite}'")]
    UnknownTool { suite: String, backend: String },
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, HarnessError>;

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "a signal".to_string(),
    }
}
