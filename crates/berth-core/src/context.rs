//! Render context: the read-only variable map shared by templates and step conditions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;

/// Environment prefix for context variables (`BERTH_VAR_SLACK_TOKEN` -> `slack_token`).
pub const ENV_VAR_PREFIX: &str = "BERTH_VAR_";

/// Ordered variable map. Ordering is by name so renders are deterministic.
///
/// Values frequently hold secrets, so `Debug` prints names only.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderContext {
    vars: BTreeMap<String, String>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Variable names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// Overlay every `(key, value)` whose key starts with [`ENV_VAR_PREFIX`].
    ///
    /// The prefix is stripped and the remainder lowercased. Takes an iterator
    /// rather than reading the process environment so callers decide the source.
    pub fn overlay_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix(ENV_VAR_PREFIX) {
                if is_valid_name(name) {
                    self.insert(name.to_ascii_lowercase(), value);
                }
            }
        }
    }

    /// Overlay `NAME=VALUE` assignments as given on the command line.
    pub fn overlay_assignments<S: AsRef<str>>(
        &mut self,
        assignments: &[S],
    ) -> Result<(), PlanError> {
        for raw in assignments {
            let (name, value) = parse_assignment(raw.as_ref())?;
            self.insert(name, value);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("names", &self.vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RenderContext {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut ctx = RenderContext::new();
        for (k, v) in iter {
            ctx.insert(k, v);
        }
        ctx
    }
}

/// Split `NAME=VALUE`. The value may itself contain `=`.
pub fn parse_assignment(raw: &str) -> Result<(String, String), PlanError> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| PlanError::InvalidVariable(raw.to_string()))?;
    let name = name.trim();
    if !is_valid_name(name) {
        return Err(PlanError::InvalidVariable(raw.to_string()));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Variable names are `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Truthiness used by `{% if %}` and step conditions.
///
/// Everything is true except the empty string and `0`, `false`, `no`, `off`
/// (case-insensitive).
pub fn is_truthy(value: &str) -> bool {
    let v = value.trim();
    !(v.is_empty()
        || v == "0"
        || v.eq_ignore_ascii_case("false")
        || v.eq_ignore_ascii_case("no")
        || v.eq_ignore_ascii_case("off"))
}
