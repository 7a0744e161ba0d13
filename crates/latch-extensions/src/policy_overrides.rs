//! Persisted allow/deny overrides for tool hooks (`policies.json`).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use latch_core::write_text_atomic;
use serde_json::{Map, Value};

use crate::{diagnostics::DiagnosticLog, registry::HookPolicy, safe_fs::read_json_file_safely};

pub const POLICY_OVERRIDES_FILE_NAME: &str = "policies.json";
const TOOL_HOOKS_KEY: &str = "toolHooks";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// `hook name -> allow|deny`, consulted before a hook's own policy or handler.
pub struct PolicyOverrides {
    entries: BTreeMap<String, HookPolicy>,
}

impl PolicyOverrides {
    pub fn get(&self, hook: &str) -> Option<HookPolicy> {
        self.entries.get(hook).copied()
    }

    pub fn insert(&mut self, hook: impl Into<String>, policy: HookPolicy) {
        self.entries.insert(hook.into(), policy);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, HookPolicy> {
        &self.entries
    }
}

/// Loads `policies.json` from each scope directory in order; later scopes
/// replace earlier entries for the same hook.
pub fn load_policy_overrides(scope_dirs: &[PathBuf], log: &mut DiagnosticLog) -> PolicyOverrides {
    let mut overrides = PolicyOverrides::default();
    for dir in scope_dirs {
        let path = dir.join(POLICY_OVERRIDES_FILE_NAME);
        let source = path.display().to_string();
        match read_json_file_safely(&path) {
            Ok(Some(value)) => apply_policy_document(&value, &source, &mut overrides, log),
            Ok(None) => {}
            Err(error) => log.record(source, format!("ignoring policy overrides: {error}")),
        }
    }
    overrides
}

fn apply_policy_document(
    value: &Value,
    source: &str,
    overrides: &mut PolicyOverrides,
    log: &mut DiagnosticLog,
) {
    let Some(object) = value.as_object() else {
        log.record(
            source,
            "ignoring policy overrides: top-level value must be a JSON object",
        );
        return;
    };
    let Some(tool_hooks) = object.get(TOOL_HOOKS_KEY) else {
        return;
    };
    let Some(tool_hooks) = tool_hooks.as_object() else {
        log.record(
            source,
            format!("ignoring field '{TOOL_HOOKS_KEY}': expected an object"),
        );
        return;
    };
    for (hook, policy) in tool_hooks {
        match policy.as_str().and_then(HookPolicy::parse) {
            Some(policy) => overrides.insert(hook.clone(), policy),
            None => log.record(
                source,
                format!("ignoring override for hook '{hook}': expected \"allow\" or \"deny\""),
            ),
        }
    }
}

/// Sets (or with `None`, removes) one override in a `policies.json` file,
/// keeping every other key intact.
pub fn write_policy_override(path: &Path, hook: &str, policy: Option<HookPolicy>) -> Result<()> {
    let hook = hook.trim();
    if hook.is_empty() {
        bail!("hook name must not be empty");
    }
    let mut document = match read_json_file_safely(path)
        .with_context(|| format!("failed to load {}", path.display()))?
    {
        Some(Value::Object(object)) => object,
        Some(_) => bail!("{} must contain a JSON object", path.display()),
        None => Map::new(),
    };
    let tool_hooks = document
        .entry(TOOL_HOOKS_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(tool_hooks) = tool_hooks.as_object_mut() else {
        bail!(
            "{} field '{TOOL_HOOKS_KEY}' must be a JSON object",
            path.display()
        );
    };
    match policy {
        Some(policy) => {
            tool_hooks.insert(hook.to_string(), Value::String(policy.as_str().to_string()));
        }
        None => {
            tool_hooks.remove(hook);
        }
    }
    let mut payload = serde_json::to_string_pretty(&Value::Object(document))
        .context("failed to serialize policy overrides")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
}
