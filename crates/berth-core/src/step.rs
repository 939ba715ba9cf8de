//! Declarative step definitions.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Default mode for files the plan writes.
pub const DEFAULT_FILE_MODE: FileMode = FileMode(0o600);

/// A single named step, optionally gated by a `when` expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    /// Condition (see [`crate::expr`]). Absent means "always".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    #[serde(flatten)]
    pub kind: StepKind,
}

/// Step kinds and their parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    EnsureDir(EnsureDir),
    RenderTemplate(RenderTemplate),
    CopyFile(CopyFile),
    CopyContentIfAbsent(CopyContentIfAbsent),
    RestartService(RestartService),
    WaitFor(WaitFor),
    HttpNotify(HttpNotify),
}

impl StepKind {
    /// Stable snake_case label, matching the plan file's `kind`.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::EnsureDir(_) => "ensure_dir",
            StepKind::RenderTemplate(_) => "render_template",
            StepKind::CopyFile(_) => "copy_file",
            StepKind::CopyContentIfAbsent(_) => "copy_content_if_absent",
            StepKind::RestartService(_) => "restart_service",
            StepKind::WaitFor(_) => "wait_for",
            StepKind::HttpNotify(_) => "http_notify",
        }
    }

    /// Destination written by file-producing steps.
    pub fn dest(&self) -> Option<&PathBuf> {
        match self {
            StepKind::EnsureDir(s) => Some(&s.path),
            StepKind::RenderTemplate(s) => Some(&s.dest),
            StepKind::CopyFile(s) => Some(&s.dest),
            StepKind::CopyContentIfAbsent(s) => Some(&s.dest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnsureDir {
    pub path: PathBuf,
    #[serde(default)]
    pub mode: Option<FileMode>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderTemplate {
    /// Template path, relative to the source root.
    pub source: PathBuf,
    /// Output path, relative to the config root.
    pub dest: PathBuf,
    #[serde(default = "default_file_mode")]
    pub mode: FileMode,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub overwrite: OverwritePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyFile {
    pub source: PathBuf,
    pub dest: PathBuf,
    #[serde(default = "default_file_mode")]
    pub mode: FileMode,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub overwrite: OverwritePolicy,
}

/// Seeds a file with literal content once; never overwrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyContentIfAbsent {
    pub content: String,
    pub dest: PathBuf,
    #[serde(default = "default_file_mode")]
    pub mode: FileMode,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartService {
    /// Service (compose project) name.
    pub service: String,
    /// Directory holding the service definition, relative to the config root.
    pub source: PathBuf,
    #[serde(default)]
    pub pull: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitFor {
    pub delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpNotify {
    pub endpoint: String,
    pub item: String,
    pub repo: String,
    #[serde(default)]
    pub readiness_delay_secs: u64,
}

/// Whether an existing destination may be replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    #[default]
    Always,
    /// Leave an existing file untouched (content and permissions).
    NeverIfExists,
}

/// Unix permission bits. Deserializes from an octal string (`"0600"`) or an integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

impl FileMode {
    pub const fn new(bits: u32) -> Option<FileMode> {
        if bits > 0o7777 {
            None
        } else {
            Some(FileMode(bits))
        }
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn parse_octal(s: &str) -> Option<FileMode> {
        let digits = s.trim().trim_start_matches("0o");
        if digits.is_empty() {
            return None;
        }
        u32::from_str_radix(digits, 8).ok().and_then(FileMode::new)
    }
}

fn default_file_mode() -> FileMode {
    DEFAULT_FILE_MODE
}

impl std::fmt::Debug for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileMode({:04o})", self.0)
    }
}

impl std::fmt::Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl Serialize for FileMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FileMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ModeVisitor;

        impl serde::de::Visitor<'_> for ModeVisitor {
            type Value = FileMode;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an octal mode string like \"0600\" or an integer")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<FileMode, E> {
                FileMode::parse_octal(v)
                    .ok_or_else(|| E::custom(format!("invalid octal file mode `{v}`")))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<FileMode, E> {
                u32::try_from(v)
                    .ok()
                    .and_then(FileMode::new)
                    .ok_or_else(|| E::custom(format!("file mode {v:o} out of range")))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<FileMode, E> {
                u32::try_from(v)
                    .ok()
                    .and_then(FileMode::new)
                    .ok_or_else(|| E::custom(format!("file mode {v:o} out of range")))
            }
        }

        deserializer.deserialize_any(ModeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_mode_parse_octal() {
        assert_eq!(FileMode::parse_octal("0600").map(FileMode::bits), Some(0o600));
        assert_eq!(FileMode::parse_octal("755").map(FileMode::bits), Some(0o755));
        assert_eq!(FileMode::parse_octal("0o640").map(FileMode::bits), Some(0o640));
        assert!(FileMode::parse_octal("0900").is_none());
        assert!(FileMode::parse_octal("").is_none());
        assert!(FileMode::parse_octal("17777").is_none());
    }

    #[test]
    fn test_file_mode_display() {
        assert_eq!(DEFAULT_FILE_MODE.to_string(), "0600");
        assert_eq!(FileMode::new(0o4755).unwrap().to_string(), "4755");
    }

    #[test]
    fn test_step_kind_labels_match_serde_tags() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "settle",
            "kind": "wait_for",
            "delay_secs": 3
        }))
        .unwrap();
        assert_eq!(step.kind.label(), "wait_for");
        assert_eq!(step.kind, StepKind::WaitFor(WaitFor { delay_secs: 3 }));
        assert!(step.when.is_none());
    }

    #[test]
    fn test_render_template_defaults() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "env",
            "kind": "render_template",
            "source": "env.tmpl",
            "dest": ".env"
        }))
        .unwrap();
        match step.kind {
            StepKind::RenderTemplate(t) => {
                assert_eq!(t.mode, DEFAULT_FILE_MODE);
                assert_eq!(t.overwrite, OverwritePolicy::Always);
                assert!(t.owner.is_none());
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_mode_accepts_integer_and_string() {
        let a: EnsureDir =
            serde_json::from_value(serde_json::json!({"path": "x", "mode": "0750"})).unwrap();
        let b: EnsureDir =
            serde_json::from_value(serde_json::json!({"path": "x", "mode": 488})).unwrap();
        assert_eq!(a.mode, b.mode);
    }
}
