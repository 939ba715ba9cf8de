//! Plan files: the ordered step list plus settings and default variables.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::context::{is_valid_name, RenderContext};
use crate::error::PlanError;
use crate::expr::Expr;
use crate::step::{Step, StepKind};

/// Name of the lock file taken under the config root for the duration of a run.
pub const LOCK_FILE_NAME: &str = ".berth.lock";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    vars: BTreeMap<String, toml::Value>,
    #[serde(default)]
    steps: Vec<Step>,
}

/// `[settings]` table. Relative paths are resolved against the plan's directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub config_root: Option<PathBuf>,
    #[serde(default)]
    pub source_root: Option<PathBuf>,
}

/// A loaded, validated plan.
#[derive(Debug, Clone)]
pub struct Plan {
    config_root: PathBuf,
    source_root: PathBuf,
    vars: RenderContext,
    steps: Vec<Step>,
}

impl Plan {
    /// Read and validate the plan at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Plan, PlanError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::parse(&text, path, &base_dir)
    }

    /// Parse plan text. Relative settings paths resolve against `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: impl AsRef<Path>) -> Result<Plan, PlanError> {
        Self::parse(text, Path::new("<inline>"), base_dir.as_ref())
    }

    /// Build a plan directly from its parts (validated the same way as a file).
    pub fn from_parts(
        config_root: impl Into<PathBuf>,
        source_root: impl Into<PathBuf>,
        vars: RenderContext,
        steps: Vec<Step>,
    ) -> Result<Plan, PlanError> {
        let plan = Plan {
            config_root: config_root.into(),
            source_root: source_root.into(),
            vars,
            steps,
        };
        plan.validate()?;
        Ok(plan)
    }

    fn parse(text: &str, origin: &Path, base_dir: &Path) -> Result<Plan, PlanError> {
        let file: PlanFile = toml::from_str(text).map_err(|source| PlanError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;

        let mut vars = RenderContext::new();
        for (name, value) in file.vars {
            let value = scalar_to_string(&name, value)?;
            vars.insert(name, value);
        }

        let config_root = anchor(base_dir, file.settings.config_root);
        let source_root = anchor(base_dir, file.settings.source_root);
        tracing::debug!(
            plan = %origin.display(),
            config_root = %config_root.display(),
            source_root = %source_root.display(),
            steps = file.steps.len(),
            "plan loaded"
        );

        Plan::from_parts(config_root, source_root, vars, file.steps)
    }

    /// Structural checks. Runs before any step, so a bad plan touches nothing.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Invalid("plan has no steps".to_string()));
        }

        for name in self.vars.names() {
            if !is_valid_name(name) {
                return Err(PlanError::Invalid(format!("invalid variable name `{name}`")));
            }
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            let name = step.name.trim();
            if name.is_empty() {
                return Err(PlanError::Invalid("step with an empty name".to_string()));
            }
            if !seen.insert(name) {
                return Err(PlanError::Invalid(format!("duplicate step name `{name}`")));
            }
            if let Some(when) = &step.when {
                Expr::parse(when)
                    .map_err(|e| PlanError::Invalid(format!("step `{name}`: {e}")))?;
            }
            validate_kind(name, &step.kind)?;
        }
        Ok(())
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Plan-level default variables (the lowest context layer).
    pub fn vars(&self) -> &RenderContext {
        &self.vars
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config_root.join(LOCK_FILE_NAME)
    }

    /// Destination paths are relative to the config root unless absolute.
    pub fn resolve_dest(&self, path: &Path) -> PathBuf {
        self.config_root.join(path)
    }

    /// Template and static-file sources are relative to the source root unless absolute.
    pub fn resolve_source(&self, path: &Path) -> PathBuf {
        self.source_root.join(path)
    }

    /// Layer the context: plan `[vars]`, then `BERTH_VAR_*` entries from
    /// `env`, then `NAME=VALUE` assignments.
    pub fn layered_context<I, S>(
        &self,
        env: I,
        assignments: &[S],
    ) -> Result<RenderContext, PlanError>
    where
        I: IntoIterator<Item = (String, String)>,
        S: AsRef<str>,
    {
        let mut ctx = self.vars.clone();
        ctx.overlay_env(env);
        ctx.overlay_assignments(assignments)?;
        Ok(ctx)
    }
}

fn anchor(base_dir: &Path, path: Option<PathBuf>) -> PathBuf {
    match path {
        Some(p) if p.is_absolute() => p,
        Some(p) => base_dir.join(p),
        None => base_dir.to_path_buf(),
    }
}

fn scalar_to_string(name: &str, value: toml::Value) -> Result<String, PlanError> {
    match value {
        toml::Value::String(s) => Ok(s),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(d) => Ok(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => Err(PlanError::Invalid(format!(
            "variable `{name}` must be a string, number, or boolean"
        ))),
    }
}

fn validate_kind(name: &str, kind: &StepKind) -> Result<(), PlanError> {
    let invalid = |reason: String| PlanError::Invalid(format!("step `{name}`: {reason}"));

    if let Some(dest) = kind.dest() {
        if dest.as_os_str().is_empty() {
            return Err(invalid("destination path is empty".to_string()));
        }
        if escapes_root(dest) {
            return Err(invalid(format!(
                "destination `{}` must not contain `..`",
                dest.display()
            )));
        }
    }

    match kind {
        StepKind::RestartService(s) => {
            if s.service.trim().is_empty() {
                return Err(invalid("service name is empty".to_string()));
            }
            if escapes_root(&s.source) {
                return Err(invalid(format!(
                    "service source `{}` must not contain `..`",
                    s.source.display()
                )));
            }
        }
        StepKind::HttpNotify(n) => {
            if !(n.endpoint.starts_with("http://") || n.endpoint.starts_with("https://")) {
                return Err(invalid(format!(
                    "endpoint `{}` must be an http or https URL",
                    n.endpoint
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

fn escapes_root(path: &Path) -> bool {
    !path.is_absolute() && path.components().any(|c| matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{FileMode, OverwritePolicy};

    const SAMPLE: &str = r#"
[settings]
config_root = "deploy"
source_root = "files"

[vars]
traefik_enabled = true
replicas = 2

[[steps]]
name = "config directory"
kind = "ensure_dir"
path = "."
mode = "0750"

[[steps]]
name = "acme state"
kind = "copy_content_if_absent"
content = "{}"
dest = "acme.json"
when = "traefik_enabled"

[[steps]]
name = "compose file"
kind = "copy_file"
source = "docker-compose.yml"
dest = "docker-compose.yml"
mode = 420
overwrite = "never_if_exists"
"#;

    #[test]
    fn test_parse_sample_plan() {
        let plan = Plan::from_toml_str(SAMPLE, "/srv/plans").unwrap();
        assert_eq!(plan.config_root(), Path::new("/srv/plans/deploy"));
        assert_eq!(plan.source_root(), Path::new("/srv/plans/files"));
        assert_eq!(plan.vars().get("traefik_enabled"), Some("true"));
        assert_eq!(plan.vars().get("replicas"), Some("2"));
        assert_eq!(plan.steps().len(), 3);
        assert_eq!(plan.steps()[1].when.as_deref(), Some("traefik_enabled"));
        match &plan.steps()[2].kind {
            StepKind::CopyFile(c) => {
                assert_eq!(c.mode, FileMode::new(0o644).unwrap());
                assert_eq!(c.overwrite, OverwritePolicy::NeverIfExists);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(plan.lock_path(), Path::new("/srv/plans/deploy/.berth.lock"));
    }

    #[test]
    fn test_absolute_roots_are_kept() {
        let text = r#"
[settings]
config_root = "/opt/sirbot"

[[steps]]
name = "settle"
kind = "wait_for"
delay_secs = 0
"#;
        let plan = Plan::from_toml_str(text, "/srv/plans").unwrap();
        assert_eq!(plan.config_root(), Path::new("/opt/sirbot"));
        assert_eq!(plan.source_root(), Path::new("/srv/plans"));
        assert_eq!(
            plan.resolve_dest(Path::new(".env")),
            PathBuf::from("/opt/sirbot/.env")
        );
    }

    #[test]
    fn test_empty_plan_rejected() {
        let err = Plan::from_toml_str("", ".").unwrap_err();
        assert!(matches!(err, PlanError::Invalid(msg) if msg.contains("no steps")));
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let text = r#"
[[steps]]
name = "settle"
kind = "wait_for"
delay_secs = 1

[[steps]]
name = "settle"
kind = "wait_for"
delay_secs = 2
"#;
        let err = Plan::from_toml_str(text, ".").unwrap_err();
        assert!(err.to_string().contains("duplicate step name"));
    }

    #[test]
    fn test_parent_dir_in_dest_rejected() {
        let text = r#"
[[steps]]
name = "escape"
kind = "copy_content_if_absent"
content = "x"
dest = "../etc/passwd"
"#;
        let err = Plan::from_toml_str(text, ".").unwrap_err();
        assert!(err.to_string().contains("must not contain `..`"));
    }

    #[test]
    fn test_bad_condition_rejected_at_load() {
        let text = r#"
[[steps]]
name = "settle"
kind = "wait_for"
delay_secs = 1
when = "env = 'prod'"
"#;
        let err = Plan::from_toml_str(text, ".").unwrap_err();
        assert!(err.to_string().contains("step `settle`"));
    }

    #[test]
    fn test_unknown_kind_is_parse_error() {
        let text = r#"
[[steps]]
name = "x"
kind = "format_disk"
"#;
        assert!(matches!(
            Plan::from_toml_str(text, ".").unwrap_err(),
            PlanError::Parse { .. }
        ));
    }

    #[test]
    fn test_misspelled_step_key_is_parse_error() {
        let text = r#"
[[steps]]
name = "acme"
kind = "copy_file"
source = "acme.json"
dest = "traefik/acme.json"
overwite = "never_if_exists"
"#;
        let err = Plan::from_toml_str(text, ".").unwrap_err();
        assert!(matches!(err, PlanError::Parse { .. }));
        assert!(err.to_string().contains("overwite"));
    }

    #[test]
    fn test_non_http_endpoint_rejected() {
        let text = r#"
[[steps]]
name = "notify"
kind = "http_notify"
endpoint = "ftp://example.org"
item = "sirbot"
repo = "r"
"#;
        let err = Plan::from_toml_str(text, ".").unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }

    #[test]
    fn test_table_variable_rejected() {
        let text = r#"
[vars]
nested = { a = 1 }

[[steps]]
name = "settle"
kind = "wait_for"
delay_secs = 1
"#;
        let err = Plan::from_toml_str(text, ".").unwrap_err();
        assert!(err.to_string().contains("nested"));
    }

    #[test]
    fn test_context_layering_order() {
        let text = r#"
[vars]
mode = "plan"
region = "eu"
flag = "off"

[[steps]]
name = "settle"
kind = "wait_for"
delay_secs = 1
"#;
        let plan = Plan::from_toml_str(text, ".").unwrap();
        let env = vec![
            ("BERTH_VAR_MODE".to_string(), "env".to_string()),
            ("BERTH_VAR_FLAG".to_string(), "on".to_string()),
        ];
        let ctx = plan.layered_context(env, &["mode=cli"]).unwrap();
        assert_eq!(ctx.get("mode"), Some("cli"));
        assert_eq!(ctx.get("flag"), Some("on"));
        assert_eq!(ctx.get("region"), Some("eu"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Plan::from_path("/definitely/not/here/plan.toml").unwrap_err();
        assert!(matches!(err, PlanError::Read { .. }));
    }
}
