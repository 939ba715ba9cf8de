//! Step executor: runs a plan's steps in order, fail-fast.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use berth_core::obs;
use berth_core::step::{CopyContentIfAbsent, CopyFile, EnsureDir, HttpNotify, RenderTemplate};
use berth_core::{
    evaluate_condition, render, ContentDigest, FileSpec, FilesystemError, Materializer,
    OverwritePolicy, Plan, PlanError, RenderContext, RunRecorder, RunResult, Step, StepKind,
    StepRecord, WriteOutcome,
};
use tracing::{info, Instrument};

use crate::error::{NotifyError, StepError, StepFailure};
use crate::interrupt::Interrupt;
use crate::lock::RunLock;
use crate::notify::{NotifyOutcome, NotifyPayload, Notifier};
use crate::service::{ServiceController, ServiceDescriptor};

/// Context variable set from [`RunConfig::target_host`].
pub const TARGET_HOST_VAR: &str = "target_host";

/// Context variable set from [`RunConfig::deploy_version`].
pub const DEPLOY_VERSION_VAR: &str = "deploy_version";

/// Per-invocation parameters. Nothing here is persisted between runs.
#[derive(Clone, Default)]
pub struct RunConfig {
    pub context: RenderContext,
    pub notify_enabled: bool,
    pub token: Option<String>,
    pub deploy_version: Option<String>,
    pub target_host: Option<String>,
}

impl RunConfig {
    pub fn new(context: RenderContext) -> Self {
        Self {
            context,
            ..Self::default()
        }
    }

    pub fn with_notify(mut self, enabled: bool) -> Self {
        self.notify_enabled = enabled;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_deploy_version(mut self, version: impl Into<String>) -> Self {
        self.deploy_version = Some(version.into());
        self
    }

    pub fn with_target_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = Some(host.into());
        self
    }

    /// The context with the built-in variables layered on top.
    pub fn effective_context(&self) -> RenderContext {
        let mut ctx = self.context.clone();
        if let Some(host) = &self.target_host {
            ctx.insert(TARGET_HOST_VAR, host.clone());
        }
        if let Some(version) = &self.deploy_version {
            ctx.insert(DEPLOY_VERSION_VAR, version.clone());
        }
        ctx
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("context", &self.context)
            .field("notify_enabled", &self.notify_enabled)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("deploy_version", &self.deploy_version)
            .field("target_host", &self.target_host)
            .finish()
    }
}

/// What a successful step did.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StepOutcome {
    Applied {
        changed: bool,
        digest: Option<ContentDigest>,
    },
    Skipped(String),
}

/// Runs plans against the local host.
pub struct Executor {
    materializer: Materializer,
    services: Arc<dyn ServiceController>,
    notifier: Notifier,
    interrupt: Interrupt,
}

impl Executor {
    pub fn new(services: Arc<dyn ServiceController>, notifier: Notifier) -> Self {
        Self {
            materializer: Materializer::new(),
            services,
            notifier,
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_materializer(mut self, materializer: Materializer) -> Self {
        self.materializer = materializer;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Apply every step in declaration order, halting at the first failure.
    ///
    /// A step failure is recorded in the returned [`RunResult`]; `Err` is
    /// reserved for problems that prevent the run from starting.
    pub async fn run(&self, plan: &Plan, config: &RunConfig) -> Result<RunResult, PlanError> {
        let _lock = RunLock::acquire(plan.lock_path())?;
        let recorder = RunRecorder::new();
        let span = obs::run_span(&recorder.run_id().to_string());
        self.run_steps(plan, config, recorder).instrument(span).await
    }

    async fn run_steps(
        &self,
        plan: &Plan,
        config: &RunConfig,
        mut recorder: RunRecorder,
    ) -> Result<RunResult, PlanError> {
        let ctx = config.effective_context();
        obs::emit_run_started(
            &recorder.run_id().to_string(),
            plan.steps().len(),
            config.notify_enabled,
        );

        for (index, step) in plan.steps().iter().enumerate() {
            let kind = step.kind.label();
            if self.interrupt.is_triggered() {
                let record =
                    StepRecord::failed(&step.name, kind, StepError::Interrupted.to_string());
                obs::emit_step_finished(&record);
                recorder.push(record);
                break;
            }

            obs::emit_step_started(index, &step.name, kind);
            let started = Instant::now();
            let outcome = self.execute(plan, step, &ctx, config).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let record = match outcome {
                Ok(StepOutcome::Applied { changed, digest }) => {
                    let record = StepRecord::applied(&step.name, kind, changed);
                    match digest {
                        Some(digest) => record.with_digest(digest),
                        None => record,
                    }
                }
                Ok(StepOutcome::Skipped(reason)) => StepRecord::skipped(&step.name, kind, reason),
                Err(e) => StepRecord::failed(&step.name, kind, e.to_string()),
            }
            .with_duration_ms(duration_ms);

            obs::emit_step_finished(&record);
            recorder.push(record);
            if recorder.is_halted() {
                break;
            }
        }

        let result = recorder.finish();
        obs::emit_run_finished(&result);
        Ok(result)
    }

    async fn execute(
        &self,
        plan: &Plan,
        step: &Step,
        ctx: &RenderContext,
        config: &RunConfig,
    ) -> Result<StepOutcome, StepError> {
        if let Some(when) = &step.when {
            if !evaluate_condition(when, ctx)? {
                return Ok(StepOutcome::Skipped(format!("condition `{when}` is false")));
            }
        }

        match &step.kind {
            StepKind::EnsureDir(s) => self.ensure_dir(plan, s),
            StepKind::RenderTemplate(s) => self.render_template(plan, s, ctx),
            StepKind::CopyFile(s) => self.copy_file(plan, s),
            StepKind::CopyContentIfAbsent(s) => self.copy_content_if_absent(plan, s),
            StepKind::RestartService(s) => {
                let service =
                    ServiceDescriptor::new(&s.service, plan.resolve_dest(&s.source), s.pull);
                self.services.restart(&service).await?;
                Ok(StepOutcome::Applied {
                    changed: true,
                    digest: None,
                })
            }
            StepKind::WaitFor(s) => {
                self.interruptible(tokio::time::sleep(Duration::from_secs(s.delay_secs)))
                    .await?;
                Ok(StepOutcome::Applied {
                    changed: false,
                    digest: None,
                })
            }
            StepKind::HttpNotify(s) => {
                let outcome = self
                    .interruptible(self.notify(s, config))
                    .await??;
                Ok(match outcome {
                    NotifyOutcome::Sent => StepOutcome::Applied {
                        changed: true,
                        digest: None,
                    },
                    NotifyOutcome::Disabled => StepOutcome::Skipped("notify disabled".to_string()),
                })
            }
        }
    }

    async fn interruptible<F: std::future::Future>(&self, fut: F) -> Result<F::Output, StepError> {
        tokio::select! {
            out = fut => Ok(out),
            _ = self.interrupt.triggered() => Err(StepError::Interrupted),
        }
    }

    fn ensure_dir(&self, plan: &Plan, s: &EnsureDir) -> Result<StepOutcome, StepError> {
        let changed = self.materializer.ensure_directory(
            &plan.resolve_dest(&s.path),
            s.mode,
            s.owner.as_deref(),
            s.group.as_deref(),
        )?;
        Ok(StepOutcome::Applied {
            changed,
            digest: None,
        })
    }

    fn render_template(
        &self,
        plan: &Plan,
        s: &RenderTemplate,
        ctx: &RenderContext,
    ) -> Result<StepOutcome, StepError> {
        let source = read_template(&self.materializer, &plan.resolve_source(&s.source))?;
        let rendered = render(&source, ctx)?;
        let spec = FileSpec::new(plan.resolve_dest(&s.dest), s.mode)
            .with_owner(s.owner.clone(), s.group.clone())
            .with_overwrite(s.overwrite);
        self.write(&spec, rendered.as_bytes())
    }

    fn copy_file(&self, plan: &Plan, s: &CopyFile) -> Result<StepOutcome, StepError> {
        let bytes = self
            .materializer
            .read_source(&plan.resolve_source(&s.source))?;
        let spec = FileSpec::new(plan.resolve_dest(&s.dest), s.mode)
            .with_owner(s.owner.clone(), s.group.clone())
            .with_overwrite(s.overwrite);
        self.write(&spec, &bytes)
    }

    fn copy_content_if_absent(
        &self,
        plan: &Plan,
        s: &CopyContentIfAbsent,
    ) -> Result<StepOutcome, StepError> {
        let spec = FileSpec::new(plan.resolve_dest(&s.dest), s.mode)
            .with_owner(s.owner.clone(), s.group.clone())
            .with_overwrite(OverwritePolicy::NeverIfExists);
        self.write(&spec, s.content.as_bytes())
    }

    fn write(&self, spec: &FileSpec, bytes: &[u8]) -> Result<StepOutcome, StepError> {
        let outcome = self.materializer.write_file(spec, bytes)?;
        Ok(match outcome {
            WriteOutcome::Written | WriteOutcome::Unchanged => StepOutcome::Applied {
                changed: outcome == WriteOutcome::Written,
                digest: Some(ContentDigest::from_bytes(bytes)),
            },
            WriteOutcome::Preserved => {
                StepOutcome::Skipped(format!("{} exists; preserved", spec.path.display()))
            }
        })
    }

    async fn notify(
        &self,
        s: &HttpNotify,
        config: &RunConfig,
    ) -> Result<NotifyOutcome, NotifyError> {
        self.notifier
            .wait_then_notify(
                Duration::from_secs(s.readiness_delay_secs),
                config.notify_enabled,
                || {
                    Ok(NotifyPayload {
                        item: s.item.clone(),
                        repo: s.repo.clone(),
                        token: config.token.clone().ok_or(NotifyError::MissingField("token"))?,
                        version: config
                            .deploy_version
                            .clone()
                            .ok_or(NotifyError::MissingField("deploy version"))?,
                    })
                },
                &s.endpoint,
            )
            .await
    }

    /// Check a plan without touching the target: evaluate every condition and
    /// render every template whose step would run. Returns the number of
    /// steps that would run.
    pub fn validate(&self, plan: &Plan, config: &RunConfig) -> Result<usize, StepFailure> {
        let ctx = config.effective_context();
        let mut active = 0;
        for step in plan.steps() {
            let tag = |source: StepError| StepFailure {
                step: step.name.clone(),
                source,
            };
            if let Some(when) = &step.when {
                if !evaluate_condition(when, &ctx).map_err(|e| tag(e.into()))? {
                    continue;
                }
            }
            match &step.kind {
                StepKind::RenderTemplate(s) => {
                    let source = read_template(&self.materializer, &plan.resolve_source(&s.source))
                        .map_err(|e| tag(e.into()))?;
                    render(&source, &ctx).map_err(|e| tag(e.into()))?;
                }
                StepKind::CopyFile(s) => {
                    self.materializer
                        .read_source(&plan.resolve_source(&s.source))
                        .map_err(|e| tag(e.into()))?;
                }
                _ => {}
            }
            active += 1;
        }
        info!(steps = plan.steps().len(), active = active, "plan validated");
        Ok(active)
    }
}

fn read_template(materializer: &Materializer, path: &Path) -> Result<String, FilesystemError> {
    let bytes = materializer.read_source(path)?;
    String::from_utf8(bytes).map_err(|e| FilesystemError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })
}
