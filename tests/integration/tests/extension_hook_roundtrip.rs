use std::{fs, path::PathBuf, sync::Arc};

use anyhow::Result;
use latch_extensions::{
    global_extensions_dir, project_extensions_dir, sha256_file_hex, write_pinned_hash,
    write_policy_override, BuiltinRegistration, CommandContext, CommandOutcome, CommandOutput,
    ExtensionManager, ExtensionManagerConfig, ExtensionProcessConfig, ExtensionScope, HookPolicy,
    HookVerdict, ToolCall, ToolHookContext, ToolHookDecision, ToolHookHandler,
    ToolHookRegistration, ToolResult, TrustEnv, POLICY_OVERRIDES_FILE_NAME,
};
use serde_json::json;
use tempfile::tempdir;

const REDACT_SCRIPT: &str = r#"read -r request
case "$request" in
  *'"kind":"register"'*)
    echo '{"call":"registerToolHook","name":"redact-paths","tools":["write*"],"tags":["prod"]}'
    echo '{"call":"registerToolResultHook","name":"result-log"}'
    ;;
  *'"kind":"tool-hook"'*)
    echo '{"decision":"allow","args":{"path":"/redacted"}}'
    ;;
  *'"kind":"tool-result-hook"'*)
    echo "$request" >> results.log
    ;;
esac
"#;

const RELEASE_SCRIPT: &str = r#"read -r request
case "$request" in
  *'"kind":"register"'*)
    echo '{"call":"registerCommand","name":"release","usage":"<version>"}'
    echo '{"call":"registerToolHook","name":"release-gate","tools":["deploy"]}'
    ;;
  *'"kind":"command"'*) echo '{"send":"cut the release"}' ;;
  *'"kind":"tool-hook"'*) echo '{"decision":"deny","reason":"release freeze"}' ;;
esac
"#;

struct AuditWrites;

impl ToolHookHandler for AuditWrites {
    fn evaluate(
        &self,
        _hook: &str,
        call: &ToolCall,
        _context: &ToolHookContext,
    ) -> Result<Option<HookVerdict>> {
        if call.args["path"] == "/redacted" {
            return Ok(Some(HookVerdict::Respond {
                content: json!("write skipped in audit mode"),
            }));
        }
        Ok(None)
    }
}

fn config(config_root: PathBuf, env: TrustEnv) -> ExtensionManagerConfig {
    ExtensionManagerConfig {
        config_root,
        env,
        process: ExtensionProcessConfig {
            interpreter: Some(PathBuf::from("/bin/sh")),
            ..ExtensionProcessConfig::default()
        },
    }
}

#[test]
fn integration_trusted_extensions_drive_commands_and_hook_pipeline() {
    let temp = tempdir().expect("tempdir");
    let root = fs::canonicalize(temp.path()).expect("canonical");
    let config_root = root.join("config");
    let cwd = root.join("workspace");
    let global_dir = global_extensions_dir(&config_root);
    let project_dir = project_extensions_dir(&cwd);
    fs::create_dir_all(&global_dir).expect("global dir");
    fs::create_dir_all(&project_dir).expect("project dir");
    fs::write(global_dir.join("redact.js"), REDACT_SCRIPT).expect("redact");
    fs::write(project_dir.join("release.mjs"), RELEASE_SCRIPT).expect("release");

    let env = TrustEnv {
        allow: Some("redact,release".to_string()),
        require_hashes: Some("yes".to_string()),
        ..TrustEnv::default()
    };
    let manager = ExtensionManager::new(config(config_root.clone(), env)).with_builtin(
        BuiltinRegistration::ToolHook(
            ToolHookRegistration {
                name: "audit-writes".to_string(),
                tools: vec!["write*".to_string()],
                ..ToolHookRegistration::default()
            },
            Arc::new(AuditWrites),
        ),
    );

    manager.load(&cwd);
    assert!(manager.list_extensions().is_empty());
    let missing_hashes = manager
        .list_diagnostics()
        .into_iter()
        .filter(|diagnostic| diagnostic.message.contains("not pinned"))
        .count();
    assert_eq!(missing_hashes, 2);

    let redact_digest = sha256_file_hex(&global_dir.join("redact.js")).expect("hash redact");
    let release_digest = sha256_file_hex(&project_dir.join("release.mjs")).expect("hash release");
    write_pinned_hash(&global_dir.join("trust.json"), "redact", &redact_digest).expect("pin");
    write_pinned_hash(&project_dir.join("trust.json"), "release", &release_digest).expect("pin");

    let snapshot = manager.load(&cwd);
    assert!(manager.list_diagnostics().is_empty(), "{:?}", manager.list_diagnostics());
    let scopes = manager
        .list_extensions()
        .into_iter()
        .map(|info| (info.name, info.scope))
        .collect::<Vec<_>>();
    assert_eq!(
        scopes,
        vec![
            ("redact".to_string(), ExtensionScope::Global),
            ("release".to_string(), ExtensionScope::Project),
        ]
    );
    let hook_order = snapshot
        .registry
        .tool_hooks()
        .iter()
        .map(|hook| hook.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(hook_order, vec!["audit-writes", "redact-paths", "release-gate"]);

    let prod = ToolHookContext {
        session_id: Some("session-1".to_string()),
        tags: vec!["prod".to_string()],
        ..ToolHookContext::default()
    };
    let write = ToolCall::new("write_file", json!({"path": "/home/me/notes.txt"}));
    assert_eq!(
        manager.run_tool_hooks(&write, &prod),
        Some(ToolHookDecision::Allow {
            args: json!({"path": "/redacted"})
        })
    );
    assert_eq!(
        manager.run_tool_hooks(&write, &ToolHookContext::default()),
        None
    );

    let deploy = ToolCall::new("deploy", json!({"target": "prod"}));
    let Some(ToolHookDecision::Deny { reason, hook, source }) =
        manager.run_tool_hooks(&deploy, &prod)
    else {
        panic!("expected release gate to deny");
    };
    assert_eq!(reason, "release freeze");
    assert_eq!(hook, "release-gate");
    assert_eq!(source, project_dir.join("release.mjs"));

    assert_eq!(
        manager.run_command("/Release", "1.2.0", &CommandContext::default()),
        Some(CommandOutcome::Completed {
            output: CommandOutput::Send {
                message: "cut the release".to_string()
            }
        })
    );

    manager.run_tool_result_hooks(
        &ToolResult {
            name: "deploy".to_string(),
            args: json!({"target": "prod"}),
            result_text: "denied".to_string(),
            is_error: true,
            duration_ms: 0,
        },
        &prod,
    );
    let results = fs::read_to_string(global_dir.join("results.log")).expect("results log");
    assert!(results.contains("\"is_error\":true"));
    assert!(results.contains("session-1"));

    write_policy_override(
        &config_root.join("extensions").join(POLICY_OVERRIDES_FILE_NAME),
        "release-gate",
        Some(HookPolicy::Allow),
    )
    .expect("override");
    manager.load(&cwd);
    assert_eq!(manager.run_tool_hooks(&deploy, &prod), None);
    assert_eq!(
        manager.policy_overrides().get("release-gate"),
        Some(HookPolicy::Allow)
    );

    fs::write(
        project_dir.join("release.mjs"),
        RELEASE_SCRIPT.replace("cut the release", "ship it anyway"),
    )
    .expect("tamper");
    manager.load(&cwd);
    assert_eq!(manager.list_extensions().len(), 1);
    assert!(manager.get_command("release").is_none());
    assert!(manager
        .list_diagnostics()
        .iter()
        .any(|diagnostic| diagnostic.message.contains("integrity hash mismatch")));
}
