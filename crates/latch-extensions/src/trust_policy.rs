//! Trust policy resolution from environment variables and per-scope trust files.
//!
//! Sources merge in order: environment, global trust file, project trust file.
//! Later sources only add to the allow/deny sets; a malformed entry is dropped
//! on its own with a diagnostic and never aborts the merge.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use latch_core::write_text_atomic;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    diagnostics::DiagnosticLog,
    safe_fs::{is_valid_extension_name, read_json_file_safely},
};

pub const ENV_ENFORCE_TRUST: &str = "EXTENSIONS_ENFORCE_TRUST";
pub const ENV_ALLOW: &str = "EXTENSIONS_ALLOW";
pub const ENV_DENY: &str = "EXTENSIONS_DENY";
pub const ENV_REQUIRE_HASHES: &str = "EXTENSIONS_REQUIRE_HASHES";
pub const ENV_HASHES: &str = "EXTENSIONS_HASHES";

/// Recognized trust file names, read in this order within each scope.
pub const TRUST_FILE_NAMES: [&str; 2] = ["trust.json", "extensions.trust.json"];

const ALLOW_KEYS: [&str; 2] = ["allow", "allowed"];
const DENY_KEYS: [&str; 2] = ["deny", "denied"];
const REQUIRE_HASHES_KEYS: [&str; 2] = ["requireHashes", "require_hashes"];
const HASH_KEYS: [&str; 3] = ["hashes", "integrity", "sha256"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Raw values of the trust environment variables.
pub struct TrustEnv {
    pub enforce_trust: Option<String>,
    pub allow: Option<String>,
    pub deny: Option<String>,
    pub require_hashes: Option<String>,
    pub hashes: Option<String>,
}

impl TrustEnv {
    pub fn from_process() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            enforce_trust: lookup(ENV_ENFORCE_TRUST),
            allow: lookup(ENV_ALLOW),
            deny: lookup(ENV_DENY),
            require_hashes: lookup(ENV_REQUIRE_HASHES),
            hashes: lookup(ENV_HASHES),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Immutable admission rules for one load cycle.
pub struct TrustPolicy {
    pub enforce: bool,
    /// Explicit enforce flag seen across all sources; `Some(true)` is sticky.
    pub explicit_enforce: Option<bool>,
    pub requires_allowlist: bool,
    pub allowed: BTreeSet<String>,
    pub denied: BTreeSet<String>,
    pub require_hashes: bool,
    pub hashes: BTreeMap<String, String>,
}

impl TrustPolicy {
    pub fn is_denied(&self, key: &str) -> bool {
        self.denied.contains(key)
    }

    pub fn is_allowlisted(&self, key: &str) -> bool {
        self.allowed.contains(key)
    }

    pub fn pinned_hash(&self, key: &str) -> Option<&str> {
        self.hashes.get(key).map(String::as_str)
    }

    /// True when the operator explicitly disabled enforcement.
    pub fn is_explicit_opt_out(&self) -> bool {
        !self.enforce && self.explicit_enforce == Some(false)
    }
}

#[derive(Debug, Default)]
struct TrustPolicyBuilder {
    explicit_enforce: Option<bool>,
    allowed: BTreeSet<String>,
    denied: BTreeSet<String>,
    require_hashes: bool,
    hashes: BTreeMap<String, String>,
}

impl TrustPolicyBuilder {
    fn set_enforce(&mut self, enforce: bool) {
        if self.explicit_enforce != Some(true) {
            self.explicit_enforce = Some(enforce);
        }
    }

    fn add_name(
        set: &mut BTreeSet<String>,
        raw: &str,
        source: &str,
        field: &str,
        log: &mut DiagnosticLog,
    ) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        if !is_valid_extension_name(trimmed) {
            log.record(
                source,
                format!("ignoring invalid extension name '{trimmed}' in '{field}'"),
            );
            return;
        }
        set.insert(trimmed.to_ascii_lowercase());
    }

    fn add_hash(&mut self, name: &str, digest: &str, source: &str, log: &mut DiagnosticLog) {
        let name = name.trim();
        if !is_valid_extension_name(name) {
            log.record(
                source,
                format!("ignoring hash entry with invalid extension name '{name}'"),
            );
            return;
        }
        let Some(digest) = normalize_sha256_hex(digest) else {
            log.record(
                source,
                format!("ignoring malformed sha256 digest for extension '{name}'"),
            );
            return;
        };
        self.hashes.insert(name.to_ascii_lowercase(), digest);
    }

    fn build(self) -> TrustPolicy {
        let has_rules = !self.allowed.is_empty() || !self.denied.is_empty();
        let enforce = self.explicit_enforce == Some(true) || has_rules;
        TrustPolicy {
            enforce,
            explicit_enforce: self.explicit_enforce,
            requires_allowlist: enforce && !has_rules,
            allowed: self.allowed,
            denied: self.denied,
            require_hashes: self.require_hashes,
            hashes: self.hashes,
        }
    }
}

/// Parses a bool-ish toggle (`1/true/yes/on`, `0/false/no/off`).
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Returns the lower-case 64-digit hex form of a sha256 digest, accepting an
/// optional `sha256:` prefix.
pub fn normalize_sha256_hex(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("sha256:").unwrap_or(trimmed);
    if trimmed.len() != 64 || !trimmed.chars().all(|character| character.is_ascii_hexdigit()) {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// Resolves the policy for one load cycle. `scope_dirs` are searched in order
/// (global first, project last) for the recognized trust file names.
pub fn resolve_trust_policy(
    env: &TrustEnv,
    scope_dirs: &[PathBuf],
    log: &mut DiagnosticLog,
) -> TrustPolicy {
    let mut builder = TrustPolicyBuilder::default();
    apply_trust_env(env, &mut builder, log);
    for dir in scope_dirs {
        for file_name in TRUST_FILE_NAMES {
            apply_trust_file(&dir.join(file_name), &mut builder, log);
        }
    }
    let policy = builder.build();
    tracing::debug!(
        enforce = policy.enforce,
        requires_allowlist = policy.requires_allowlist,
        allowed = policy.allowed.len(),
        denied = policy.denied.len(),
        require_hashes = policy.require_hashes,
        hashes = policy.hashes.len(),
        "resolved extension trust policy"
    );
    policy
}

/// Builds a policy from one JSON trust document, for tooling and fuzzing.
pub fn trust_policy_from_document(value: &Value, source: &str) -> (TrustPolicy, DiagnosticLog) {
    let mut builder = TrustPolicyBuilder::default();
    let mut log = DiagnosticLog::new();
    apply_trust_document(value, source, &mut builder, &mut log);
    (builder.build(), log)
}

/// Pins `digest` for extension `name` under `hashes` in the trust file at
/// `path`, creating the file when missing and keeping every other key.
pub fn write_pinned_hash(path: &Path, name: &str, digest: &str) -> Result<()> {
    let name = name.trim();
    if !is_valid_extension_name(name) {
        bail!("invalid extension name '{name}'");
    }
    let Some(digest) = normalize_sha256_hex(digest) else {
        bail!("malformed sha256 digest '{digest}'");
    };
    let mut document = match read_json_file_safely(path)
        .with_context(|| format!("failed to load {}", path.display()))?
    {
        Some(Value::Object(object)) => object,
        Some(_) => bail!("{} must contain a JSON object", path.display()),
        None => Map::new(),
    };
    let hashes = document
        .entry(HASH_KEYS[0])
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(hashes) = hashes.as_object_mut() else {
        bail!("{} field '{}' must be a JSON object", path.display(), HASH_KEYS[0]);
    };
    hashes.insert(name.to_ascii_lowercase(), Value::String(digest));
    let mut payload = serde_json::to_string_pretty(&Value::Object(document))
        .context("failed to serialize trust file")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
}

fn apply_trust_env(env: &TrustEnv, builder: &mut TrustPolicyBuilder, log: &mut DiagnosticLog) {
    if let Some(raw) = env.enforce_trust.as_deref() {
        match parse_bool_flag(raw) {
            Some(enforce) => builder.set_enforce(enforce),
            None => log.record(
                format!("env:{ENV_ENFORCE_TRUST}"),
                format!("ignoring unrecognized boolean value '{}'", raw.trim()),
            ),
        }
    }
    if let Some(raw) = env.allow.as_deref() {
        let source = format!("env:{ENV_ALLOW}");
        for entry in raw.split(',') {
            TrustPolicyBuilder::add_name(&mut builder.allowed, entry, &source, ENV_ALLOW, log);
        }
    }
    if let Some(raw) = env.deny.as_deref() {
        let source = format!("env:{ENV_DENY}");
        for entry in raw.split(',') {
            TrustPolicyBuilder::add_name(&mut builder.denied, entry, &source, ENV_DENY, log);
        }
    }
    if let Some(raw) = env.require_hashes.as_deref() {
        match parse_bool_flag(raw) {
            Some(require) => builder.require_hashes |= require,
            None => log.record(
                format!("env:{ENV_REQUIRE_HASHES}"),
                format!("ignoring unrecognized boolean value '{}'", raw.trim()),
            ),
        }
    }
    if let Some(raw) = env.hashes.as_deref() {
        let source = format!("env:{ENV_HASHES}");
        for pair in raw.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once(':') {
                Some((name, digest)) if !name.trim().is_empty() => {
                    builder.add_hash(name, digest, &source, log)
                }
                _ => log.record(
                    &source,
                    format!("ignoring malformed hash pair '{pair}', expected name:sha256hex"),
                ),
            }
        }
    }
}

fn apply_trust_file(path: &Path, builder: &mut TrustPolicyBuilder, log: &mut DiagnosticLog) {
    let source = path.display().to_string();
    match read_json_file_safely(path) {
        Ok(Some(value)) => apply_trust_document(&value, &source, builder, log),
        Ok(None) => {}
        Err(error) => log.record(source, format!("ignoring trust file: {error}")),
    }
}

fn apply_trust_document(
    value: &Value,
    source: &str,
    builder: &mut TrustPolicyBuilder,
    log: &mut DiagnosticLog,
) {
    let Some(object) = value.as_object() else {
        log.record(source, "ignoring trust file: top-level value must be a JSON object");
        return;
    };

    if let Some(enforce) = object.get("enforce") {
        match enforce.as_bool() {
            Some(enforce) => builder.set_enforce(enforce),
            None => log.record(source, "ignoring field 'enforce': expected a boolean"),
        }
    }
    for key in ALLOW_KEYS {
        apply_name_list(object, key, source, &mut builder.allowed, log);
    }
    for key in DENY_KEYS {
        apply_name_list(object, key, source, &mut builder.denied, log);
    }
    for key in REQUIRE_HASHES_KEYS {
        if let Some(require) = object.get(key) {
            match require.as_bool() {
                Some(require) => builder.require_hashes |= require,
                None => log.record(source, format!("ignoring field '{key}': expected a boolean")),
            }
        }
    }
    for key in HASH_KEYS {
        let Some(hashes) = object.get(key) else {
            continue;
        };
        let Some(hashes) = hashes.as_object() else {
            log.record(
                source,
                format!("ignoring field '{key}': expected an object of name to sha256 digest"),
            );
            continue;
        };
        for (name, digest) in hashes {
            match digest.as_str() {
                Some(digest) => builder.add_hash(name, digest, source, log),
                None => log.record(
                    source,
                    format!("ignoring hash entry '{name}' in '{key}': digest must be a string"),
                ),
            }
        }
    }
}

fn apply_name_list(
    object: &Map<String, Value>,
    key: &str,
    source: &str,
    set: &mut BTreeSet<String>,
    log: &mut DiagnosticLog,
) {
    let Some(value) = object.get(key) else {
        return;
    };
    let Some(entries) = value.as_array() else {
        log.record(source, format!("ignoring field '{key}': expected an array of names"));
        return;
    };
    for entry in entries {
        match entry.as_str() {
            Some(name) => TrustPolicyBuilder::add_name(set, name, source, key, log),
            None => log.record(
                source,
                format!("ignoring non-string entry {entry} in '{key}'"),
            ),
        }
    }
}
