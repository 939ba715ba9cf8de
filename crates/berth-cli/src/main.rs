//! Berth - declarative deployment executor CLI
//!
//! ## Commands
//!
//! - `apply`: run a plan's steps against this host, fail-fast
//! - `validate`: check a plan and render its templates without touching the host

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use berth_core::{LogFormat, Plan, RunResult, StepStatus};
use berth_runner::{
    ComposeConfig, ComposeController, Executor, Interrupt, Notifier, RunConfig,
};

#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Declarative, idempotent single-host deployment executor", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a plan to this host
    Apply {
        #[command(flatten)]
        target: TargetArgs,

        /// Send the deploy notification
        #[arg(long, env = "BERTH_NOTIFY", value_parser = clap::builder::BoolishValueParser::new())]
        notify: bool,

        /// Token sent in the deploy notification
        #[arg(long, env = "BERTH_DEPLOY_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Report format written to stdout
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,

        /// Program used to drive compose
        #[arg(long, env = "BERTH_COMPOSE_PROGRAM", default_value = "docker")]
        compose_program: String,

        /// Timeout per compose command in seconds (0 = none)
        #[arg(long, default_value_t = 300)]
        compose_timeout_secs: u64,

        /// Timeout for the notification request in seconds
        #[arg(long, default_value_t = 30)]
        notify_timeout_secs: u64,
    },

    /// Check a plan without touching the host
    Validate {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Plan file (TOML)
    plan: PathBuf,

    /// Context variable, repeatable (overrides plan vars and BERTH_VAR_*)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    vars: Vec<String>,

    /// Host name exposed to templates as `target_host`
    #[arg(long, env = "BERTH_TARGET_HOST")]
    host: Option<String>,

    /// Deploy version exposed as `deploy_version` and sent when notifying
    #[arg(long, env = "BERTH_DEPLOY_VERSION")]
    deploy_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl TargetArgs {
    fn load(&self) -> Result<(Plan, RunConfig)> {
        let plan = Plan::from_path(&self.plan)
            .with_context(|| format!("failed to load plan {}", self.plan.display()))?;
        let context = plan
            .layered_context(std::env::vars(), &self.vars)
            .context("invalid --var")?;

        let mut config = RunConfig::new(context);
        config.target_host = self.host.clone();
        config.deploy_version = self.deploy_version.clone();
        Ok((plan, config))
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    berth_core::init_tracing(LogFormat::from_json_flag(cli.json_logs), level);

    match cli.command {
        Commands::Apply {
            target,
            notify,
            token,
            output,
            compose_program,
            compose_timeout_secs,
            notify_timeout_secs,
        } => {
            let (plan, mut config) = target.load()?;
            config.notify_enabled = notify;
            config.token = token;

            let services = ComposeController::new(ComposeConfig {
                program: compose_program,
                timeout_secs: compose_timeout_secs,
                ..ComposeConfig::default()
            });
            let notifier = Notifier::with_timeout(Duration::from_secs(notify_timeout_secs))?;
            let executor = Executor::new(Arc::new(services), notifier)
                .with_interrupt(Interrupt::on_ctrl_c());

            cmd_apply(&executor, &plan, &config, output).await
        }
        Commands::Validate { target } => {
            let (plan, config) = target.load()?;
            let executor = Executor::new(Arc::new(ComposeController::default()), Notifier::new()?);
            cmd_validate(&executor, &plan, &config)
        }
    }
}

async fn cmd_apply(
    executor: &Executor,
    plan: &Plan,
    config: &RunConfig,
    output: OutputFormat,
) -> Result<ExitCode> {
    info!(
        config_root = %plan.config_root().display(),
        steps = plan.steps().len(),
        notify = config.notify_enabled,
        "applying plan"
    );
    let result = executor.run(plan, config).await?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_report(&result),
    }

    if let Some(failed) = result.failed_step() {
        eprintln!(
            "berth: step `{}` failed: {}",
            failed.name,
            failed.detail.as_deref().unwrap_or("unknown error")
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_validate(executor: &Executor, plan: &Plan, config: &RunConfig) -> Result<ExitCode> {
    let active = executor.validate(plan, config)?;
    println!(
        "plan ok: {} of {} steps would run",
        active,
        plan.steps().len()
    );
    Ok(ExitCode::SUCCESS)
}

fn print_report(result: &RunResult) {
    println!("run {}", result.run_id());
    for step in result.steps() {
        let mut line = format!("  {:<8} {}", step.status.to_string(), step.name);
        if step.status == StepStatus::Applied && !step.changed {
            line.push_str(" (unchanged)");
        }
        if let Some(detail) = &step.detail {
            line.push_str(": ");
            line.push_str(detail);
        }
        println!("{line}");
    }
    println!(
        "{} applied ({} changed), {} skipped, {} failed in {}ms",
        result.count(StepStatus::Applied),
        result.changed_count(),
        result.count(StepStatus::Skipped),
        result.count(StepStatus::Failed),
        result.duration_ms()
    );
}
