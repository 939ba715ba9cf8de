//! Error taxonomy for plan loading, templating, and file materialization.

use std::path::PathBuf;

/// Errors produced while parsing or rendering a template or condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("line {line}: unresolved variable `{name}`")]
    UnresolvedVariable { name: String, line: usize },

    #[error("line {line}: malformed directive: {reason}")]
    MalformedDirective { reason: String, line: usize },

    #[error("line {line}: unterminated `{open}` tag")]
    Unterminated { open: &'static str, line: usize },

    #[error("line {line}: `{{% if %}}` block is never closed")]
    UnclosedBlock { line: usize },

    #[error("invalid expression `{expr}`: {reason}")]
    InvalidExpression { expr: String, reason: String },
}

/// Filesystem failures raised by the materializer.
#[derive(Debug, thiserror::Error)]
pub enum FilesystemError {
    #[error("{}: exists and is not a directory", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("{}: exists and is not a regular file", .path.display())]
    NotAFile { path: PathBuf },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown user `{0}`")]
    UnknownUser(String),

    #[error("unknown group `{0}`")]
    UnknownGroup(String),
}

impl FilesystemError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FilesystemError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised before any step runs: unreadable or invalid plans.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse plan {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid plan: {0}")]
    Invalid(String),

    #[error("another run holds the lock at {}", .path.display())]
    Locked { path: PathBuf },

    #[error("failed to take run lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid variable assignment `{0}` (expected NAME=VALUE)")]
    InvalidVariable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_error_display_carries_line() {
        let err = TemplateError::UnresolvedVariable {
            name: "slack_token".to_string(),
            line: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("line 7"));
        assert!(msg.contains("slack_token"));
    }

    #[test]
    fn test_filesystem_error_display_carries_path() {
        let err = FilesystemError::NotADirectory {
            path: PathBuf::from("/opt/sirbot"),
        };
        assert!(err.to_string().contains("/opt/sirbot"));
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn test_locked_error_display() {
        let err = PlanError::Locked {
            path: PathBuf::from("/opt/sirbot/.berth.lock"),
        };
        assert!(err.to_string().contains(".berth.lock"));
    }
}
