//! Service controller seam and the Docker Compose implementation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ServiceControlError;

/// Compose file names probed in a service directory, in order.
pub const COMPOSE_FILE_NAMES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// What to restart. Passed opaquely to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub source: PathBuf,
    pub pull: bool,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>, pull: bool) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            pull,
        }
    }

    /// Non-empty name and an existing source directory.
    pub fn validate(&self) -> Result<(), ServiceControlError> {
        if self.name.trim().is_empty() {
            return Err(ServiceControlError::InvalidDescriptor(
                "service name is empty".to_string(),
            ));
        }
        if !self.source.is_dir() {
            return Err(ServiceControlError::InvalidDescriptor(format!(
                "{} is not a directory",
                self.source.display()
            )));
        }
        Ok(())
    }
}

/// Restarts a service through an external controller.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn restart(&self, service: &ServiceDescriptor) -> Result<(), ServiceControlError>;
}

/// Configuration for [`ComposeController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeConfig {
    /// Executable to run.
    pub program: String,

    /// Arguments placed before the compose flags (`["compose"]` for the docker plugin).
    pub base_args: Vec<String>,

    /// Per-command timeout in seconds. 0 disables the timeout.
    pub timeout_secs: u64,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            base_args: vec!["compose".to_string()],
            timeout_secs: 300,
        }
    }
}

/// Drives `docker compose pull` / `docker compose up -d --force-recreate`.
#[derive(Debug, Clone, Default)]
pub struct ComposeController {
    config: ComposeConfig,
}

impl ComposeController {
    pub fn new(config: ComposeConfig) -> Self {
        Self { config }
    }

    /// Argument vectors (without the program) run for `service`.
    pub fn commands(&self, service: &ServiceDescriptor, compose_file: &Path) -> Vec<Vec<String>> {
        let mut prefix = self.config.base_args.clone();
        prefix.extend([
            "--project-directory".to_string(),
            service.source.display().to_string(),
            "--project-name".to_string(),
            service.name.clone(),
            "--file".to_string(),
            compose_file.display().to_string(),
        ]);

        let mut commands = Vec::new();
        if service.pull {
            let mut pull = prefix.clone();
            pull.push("pull".to_string());
            commands.push(pull);
        }
        let mut up = prefix;
        up.extend(
            ["up", "-d", "--force-recreate", "--remove-orphans"]
                .iter()
                .map(|s| s.to_string()),
        );
        commands.push(up);
        commands
    }

    async fn run(&self, args: &[String]) -> Result<(), ServiceControlError> {
        let command = format!("{} {}", self.config.program, args.join(" "));
        debug!(command = %command, "running service command");

        let child = Command::new(&self.config.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ServiceControlError::Unreachable {
                program: self.config.program.clone(),
                source,
            })?;

        let waited = if self.config.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(self.config.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| ServiceControlError::TimedOut {
                command: command.clone(),
                secs: self.config.timeout_secs,
            })?
        } else {
            child.wait_with_output().await
        };
        let output = waited.map_err(|source| ServiceControlError::Unreachable {
            program: self.config.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ServiceControlError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// First compose file present in `dir`.
pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
    COMPOSE_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

#[async_trait]
impl ServiceController for ComposeController {
    async fn restart(&self, service: &ServiceDescriptor) -> Result<(), ServiceControlError> {
        service.validate()?;
        let compose_file = find_compose_file(&service.source).ok_or_else(|| {
            ServiceControlError::InvalidDescriptor(format!(
                "no compose file in {}",
                service.source.display()
            ))
        })?;

        for args in self.commands(service, &compose_file) {
            self.run(&args).await?;
        }
        info!(service = %service.name, pull = service.pull, "service restarted");
        Ok(())
    }
}
