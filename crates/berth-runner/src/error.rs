//! Step-level errors for the executor and the external seams it drives.

use berth_core::{FilesystemError, TemplateError};

/// Failures reported by a [`crate::ServiceController`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceControlError {
    #[error("invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("service controller `{program}` is unreachable: {source}")]
    Unreachable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {}: {stderr}", exit_label(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {secs}s")]
    TimedOut { command: String, secs: u64 },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

/// Failures of the deploy notification.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid notify endpoint `{0}`")]
    InvalidEndpoint(String),

    #[error("notify is enabled but no {0} was supplied")]
    MissingField(&'static str),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("POST {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("POST {endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },
}

/// Any error that fails a step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    #[error(transparent)]
    Service(#[from] ServiceControlError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("interrupted")]
    Interrupted,
}

/// A step error tagged with the step it came from.
#[derive(Debug, thiserror::Error)]
#[error("step `{step}`: {source}")]
pub struct StepFailure {
    pub step: String,
    #[source]
    pub source: StepError,
}
