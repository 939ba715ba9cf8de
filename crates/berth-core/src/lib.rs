//! Berth core library
//!
//! Plan model, restricted templating, and file materialization for the
//! `berth` deployment executor.
//!
//! # Layer Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`plan`], [`step`] | TOML plan files and the step tagged union |
//! | [`context`], [`expr`], [`template`] | Variables, conditions, rendering |
//! | [`materialize`] | Directory creation and atomic file writes |
//! | [`run`], [`digest`] | Per-step records and the run result |
//! | [`obs`], [`telemetry`] | Structured lifecycle events and tracing setup |

pub mod context;
pub mod digest;
pub mod error;
pub mod expr;
pub mod materialize;
pub mod obs;
pub mod plan;
pub mod run;
pub mod step;
pub mod telemetry;
pub mod template;

pub use context::{is_truthy, RenderContext, ENV_VAR_PREFIX};
pub use digest::ContentDigest;
pub use error::{FilesystemError, PlanError, TemplateError};
pub use expr::{evaluate_condition, Expr};
pub use materialize::{AccountDb, FileSpec, Materializer, StagedWrite, WriteOutcome};
pub use plan::{Plan, Settings, LOCK_FILE_NAME};
pub use run::{RunRecorder, RunResult, StepRecord, StepStatus};
pub use step::{FileMode, OverwritePolicy, Step, StepKind, DEFAULT_FILE_MODE};
pub use telemetry::{init_tracing, LogFormat};
pub use template::{render, Template};

/// Crate version, used in the notifier's user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
