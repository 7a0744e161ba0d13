use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

const AUDIT_SCRIPT: &str = r#"read -r request
case "$request" in
  *'"kind":"register"'*)
    echo '{"call":"registerToolHook","name":"no-shell","tools":["bash"],"policy":"deny"}'
    echo '{"call":"registerCommand","name":"status","usage":"[verbose]"}'
    ;;
esac
"#;

fn binary_command() -> Command {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("latch"));
    command
        .env_remove("EXTENSIONS_ENFORCE_TRUST")
        .env_remove("EXTENSIONS_ALLOW")
        .env_remove("EXTENSIONS_DENY")
        .env_remove("EXTENSIONS_REQUIRE_HASHES")
        .env_remove("EXTENSIONS_HASHES")
        .env_remove("LATCH_HOOK_TIMEOUT_MS")
        .env("LATCH_EXTENSION_INTERPRETER", "/bin/sh");
    command
}

#[test]
fn integration_help_lists_subcommands() {
    binary_command()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("check-tool"))
        .stdout(predicate::str::contains("override"));
}

#[test]
fn integration_global_extension_static_policy_denies_tool() {
    let temp = tempdir().expect("tempdir");
    let config_root = temp.path().join("config");
    let cwd = temp.path().join("project");
    fs::create_dir_all(config_root.join("extensions")).expect("extensions dir");
    fs::create_dir_all(&cwd).expect("cwd");
    fs::write(config_root.join("extensions").join("audit.js"), AUDIT_SCRIPT).expect("script");

    binary_command()
        .env("LATCH_CONFIG_ROOT", &config_root)
        .args(["--cwd"])
        .arg(&cwd)
        .arg("commands")
        .assert()
        .success()
        .stdout(predicate::str::contains("/status [verbose] [audit]"));

    let output = binary_command()
        .env("LATCH_CONFIG_ROOT", &config_root)
        .arg("--cwd")
        .arg(&cwd)
        .args(["check-tool", "--tool", "BASH"])
        .output()
        .expect("run check-tool");
    assert!(output.status.success());
    let decision: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(decision["decision"], "deny");
    assert_eq!(decision["reason"], "blocked by static policy of hook 'no-shell'");
}

#[test]
fn integration_enforced_trust_without_rules_reports_diagnostic() {
    let temp = tempdir().expect("tempdir");
    let config_root = temp.path().join("config");
    fs::create_dir_all(config_root.join("extensions")).expect("extensions dir");
    fs::write(config_root.join("extensions").join("audit.js"), AUDIT_SCRIPT).expect("script");

    binary_command()
        .env("LATCH_CONFIG_ROOT", &config_root)
        .env("EXTENSIONS_ENFORCE_TRUST", "true")
        .arg("--cwd")
        .arg(temp.path())
        .arg("diagnostics")
        .assert()
        .success()
        .stdout(predicate::str::contains("enforced without an allowlist"));
}

#[test]
fn integration_unknown_command_fails() {
    let temp = tempdir().expect("tempdir");
    binary_command()
        .env("LATCH_CONFIG_ROOT", temp.path().join("config"))
        .arg("--cwd")
        .arg(temp.path())
        .args(["run-command", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown command 'missing'"));
}
