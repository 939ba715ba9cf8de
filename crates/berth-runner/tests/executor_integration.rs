//! End-to-end executor behavior against a scratch config root.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use berth_core::{Plan, PlanError, StepStatus};
use berth_runner::fakes::RecordingServiceController;
use berth_runner::{Executor, Interrupt, Notifier, RunConfig, RunLock, StepError};

const ENV_TEMPLATE: &str = "\
SLACK_TOKEN={{ slack_token }}
{% if traefik_enabled %}
TRAEFIK_HOST={{ target_host }}
{% endif %}
";

const PLAN: &str = r#"
[settings]
config_root = "out"

[vars]
traefik_enabled = "true"

[[steps]]
name = "config directory"
kind = "ensure_dir"
path = "."
mode = "0750"

[[steps]]
name = "environment file"
kind = "render_template"
source = "env.tmpl"
dest = ".env"

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
mode = "0644"

[[steps]]
name = "restart bot"
kind = "restart_service"
service = "sirbot"
source = "."
pull = true

[[steps]]
name = "settle"
kind = "wait_for"
delay_secs = 0
"#;

fn scaffold(dir: &Path) {
    fs::write(dir.join("env.tmpl"), ENV_TEMPLATE).unwrap();
    fs::write(dir.join("docker-compose.yml"), "services:\n  bot: {}\n").unwrap();
}

fn config(plan: &Plan) -> RunConfig {
    RunConfig::new(plan.vars().clone().with("slack_token", "xoxb-1"))
        .with_target_host("bot.example.org")
        .with_deploy_version("abc123")
}

fn executor(services: Arc<RecordingServiceController>) -> Executor {
    Executor::new(services, Notifier::new().unwrap())
}

fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().unwrap().is_file())
        .map(|e| {
            (
                e.file_name().to_string_lossy().into_owned(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn second_run_converges_without_changes() {
    let dir = tempfile::tempdir().unwrap();
    scaffold(dir.path());
    let plan = Plan::from_toml_str(PLAN, dir.path()).unwrap();
    let services = Arc::new(RecordingServiceController::new());
    let exec = executor(services.clone());

    let first = exec.run(&plan, &config(&plan)).await.unwrap();
    assert!(first.success(), "first run failed: {:?}", first.failed_step());
    assert_eq!(first.count(StepStatus::Applied), 6);
    let after_first = snapshot(plan.config_root());

    let second = exec.run(&plan, &config(&plan)).await.unwrap();
    assert!(second.success());
    assert_eq!(snapshot(plan.config_root()), after_first, "filesystem state must be identical");

    let statuses: Vec<StepStatus> = second.steps().iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Applied,
            StepStatus::Applied,
            StepStatus::Skipped,
            StepStatus::Applied,
            StepStatus::Applied,
            StepStatus::Applied,
        ]
    );
    for name in ["config directory", "environment file", "compose file"] {
        let record = second.steps().iter().find(|s| s.name == name).unwrap();
        assert!(!record.changed, "{name} should be unchanged on the second run");
    }
    assert_eq!(services.call_count(), 2, "restart runs on every invocation");
    assert!(services.calls()[0].pull);
    assert_eq!(services.calls()[0].source, plan.config_root().join("."));
}

#[tokio::test]
async fn rendered_env_file_content_and_mode() {
    let dir = tempfile::tempdir().unwrap();
    scaffold(dir.path());
    let plan = Plan::from_toml_str(PLAN, dir.path()).unwrap();
    let result = executor(Arc::new(RecordingServiceController::new()))
        .run(&plan, &config(&plan))
        .await
        .unwrap();
    assert!(result.success());

    let env_path = plan.config_root().join(".env");
    assert_eq!(
        fs::read_to_string(&env_path).unwrap(),
        "SLACK_TOKEN=xoxb-1\nTRAEFIK_HOST=bot.example.org\n"
    );
    let record = &result.steps()[1];
    assert_eq!(
        record.content_digest.as_ref().map(|d| d.as_str().len()),
        Some(64)
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&env_path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600, "env file defaults to owner-only");
    }
}

#[tokio::test]
async fn existing_secret_file_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    scaffold(dir.path());
    let plan = Plan::from_toml_str(PLAN, dir.path()).unwrap();
    fs::create_dir_all(plan.config_root()).unwrap();
    let acme = plan.config_root().join("acme.json");
    fs::write(&acme, b"{\"issued\":true}").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&acme, fs::Permissions::from_mode(0o640)).unwrap();
    }

    let result = executor(Arc::new(RecordingServiceController::new()))
        .run(&plan, &config(&plan))
        .await
        .unwrap();

    let record = result.steps().iter().find(|s| s.name == "acme state").unwrap();
    assert_eq!(record.status, StepStatus::Skipped);
    assert!(record.detail.as_deref().unwrap().contains("preserved"));
    assert_eq!(fs::read(&acme).unwrap(), b"{\"issued\":true}");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&acme).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640, "preserved file keeps its own mode");
    }
}

#[tokio::test]
async fn failure_halts_remaining_steps() {
    let dir = tempfile::tempdir().unwrap();
    let text = r#"
[settings]
config_root = "out"

[[steps]]
name = "A"
kind = "ensure_dir"
path = "."

[[steps]]
name = "B"
kind = "restart_service"
service = "sirbot"
source = "."

[[steps]]
name = "C"
kind = "copy_content_if_absent"
content = "{}"
dest = "acme.json"
"#;
    let plan = Plan::from_toml_str(text, dir.path()).unwrap();
    let services = Arc::new(RecordingServiceController::failing("no such service: bot"));

    let result = executor(services.clone()).run(&plan, &config(&plan)).await.unwrap();

    assert_eq!(
        result.statuses(),
        vec![("A", StepStatus::Applied), ("B", StepStatus::Failed)]
    );
    assert!(!result.success());
    let failed = result.failed_step().unwrap();
    assert_eq!(failed.name, "B");
    assert!(failed.detail.as_deref().unwrap().contains("no such service"));
    assert!(!plan.config_root().join("acme.json").exists(), "C must never run");
    assert_eq!(services.call_count(), 1);
}

#[tokio::test]
async fn false_condition_skips_without_invoking_controller() {
    let dir = tempfile::tempdir().unwrap();
    let text = r#"
[settings]
config_root = "out"

[vars]
restart_enabled = "no"

[[steps]]
name = "restart bot"
kind = "restart_service"
service = "sirbot"
source = "."
when = "restart_enabled"
"#;
    let plan = Plan::from_toml_str(text, dir.path()).unwrap();
    let services = Arc::new(RecordingServiceController::new());
    let ctx = plan.layered_context(Vec::new(), &[] as &[&str]).unwrap();

    let result = executor(services.clone())
        .run(&plan, &RunConfig::new(ctx))
        .await
        .unwrap();

    assert_eq!(result.statuses(), vec![("restart bot", StepStatus::Skipped)]);
    assert_eq!(services.call_count(), 0);
}

#[tokio::test]
async fn unresolved_variable_fails_step_with_line() {
    let dir = tempfile::tempdir().unwrap();
    scaffold(dir.path());
    let plan = Plan::from_toml_str(PLAN, dir.path()).unwrap();

    // No slack_token in the context.
    let config = RunConfig::new(plan.vars().clone()).with_target_host("bot.example.org");
    let result = executor(Arc::new(RecordingServiceController::new()))
        .run(&plan, &config)
        .await
        .unwrap();

    let failed = result.failed_step().expect("render should fail");
    assert_eq!(failed.name, "environment file");
    assert_eq!(
        failed.detail.as_deref(),
        Some("line 1: unresolved variable `slack_token`")
    );
    assert!(!plan.config_root().join(".env").exists());
}

#[tokio::test]
async fn interrupt_before_first_step_records_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    scaffold(dir.path());
    let plan = Plan::from_toml_str(PLAN, dir.path()).unwrap();
    let interrupt = Interrupt::new();
    interrupt.trigger();

    let result = executor(Arc::new(RecordingServiceController::new()))
        .with_interrupt(interrupt)
        .run(&plan, &config(&plan))
        .await
        .unwrap();

    assert_eq!(
        result.statuses(),
        vec![("config directory", StepStatus::Failed)]
    );
    assert_eq!(result.steps()[0].detail.as_deref(), Some("interrupted"));
}

#[tokio::test]
async fn interrupt_cancels_wait() {
    let dir = tempfile::tempdir().unwrap();
    let text = r#"
[settings]
config_root = "out"

[[steps]]
name = "settle"
kind = "wait_for"
delay_secs = 3600
"#;
    let plan = Plan::from_toml_str(text, dir.path()).unwrap();
    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.trigger();
    });

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        executor(Arc::new(RecordingServiceController::new()))
            .with_interrupt(interrupt)
            .run(&plan, &RunConfig::default()),
    )
    .await
    .expect("wait should be interrupted")
    .unwrap();

    assert_eq!(result.statuses(), vec![("settle", StepStatus::Failed)]);
    assert_eq!(result.steps()[0].detail.as_deref(), Some("interrupted"));
}

#[tokio::test]
async fn concurrent_run_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    scaffold(dir.path());
    let plan = Plan::from_toml_str(PLAN, dir.path()).unwrap();
    let _held = RunLock::acquire(plan.lock_path()).unwrap();

    let err = executor(Arc::new(RecordingServiceController::new()))
        .run(&plan, &config(&plan))
        .await
        .unwrap_err();
    assert!(matches!(err, PlanError::Locked { .. }), "got {err:?}");
    assert!(!plan.config_root().join(".env").exists());
}

#[tokio::test]
async fn validate_reports_render_errors_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    scaffold(dir.path());
    let plan = Plan::from_toml_str(PLAN, dir.path()).unwrap();
    let exec = executor(Arc::new(RecordingServiceController::new()));

    assert_eq!(exec.validate(&plan, &config(&plan)).unwrap(), 6);

    let err = exec
        .validate(&plan, &RunConfig::new(plan.vars().clone()))
        .unwrap_err();
    assert_eq!(err.step, "environment file");
    assert!(matches!(err.source, StepError::Template(_)));
    assert!(!plan.config_root().exists(), "validate must not touch the target");
}
