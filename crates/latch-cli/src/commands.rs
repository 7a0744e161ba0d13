use std::{
    collections::BTreeSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use latch_extensions::{
    safe_fs::EXTENSION_SCRIPT_EXTENSIONS, scope_extensions_dir, sha256_file_hex,
    write_pinned_hash, write_policy_override, CommandContext, CommandOutcome, CommandOutput,
    ExtensionManager, ExtensionManagerConfig, ExtensionProcessConfig, ExtensionScope, HookPolicy,
    ToolCall, ToolHookContext, TrustEnv, MAX_RESPONSE_BYTES_DEFAULT, POLICY_OVERRIDES_FILE_NAME,
    TRUST_FILE_NAMES,
};
use serde_json::{json, Value};

use crate::{
    bootstrap_helpers::default_config_root,
    cli_args::{CheckToolArgs, Cli, CliCommand, OverrideCommand, TrustCommand},
};

struct ResolvedPaths {
    cwd: PathBuf,
    config_root: PathBuf,
}

fn resolve_paths(cli: &Cli) -> Result<ResolvedPaths> {
    let cwd = match cli.cwd.clone() {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    let config_root = cli
        .config_root
        .clone()
        .unwrap_or_else(|| default_config_root(|key| std::env::var(key).ok()));
    Ok(ResolvedPaths { cwd, config_root })
}

fn build_manager(cli: &Cli, paths: &ResolvedPaths) -> ExtensionManager {
    ExtensionManager::new(ExtensionManagerConfig {
        config_root: paths.config_root.clone(),
        env: TrustEnv::from_process(),
        process: ExtensionProcessConfig {
            interpreter: cli.interpreter.clone(),
            registration_timeout_ms: cli.registration_timeout_ms,
            hook_timeout_ms: cli.hook_timeout_ms,
            max_response_bytes: MAX_RESPONSE_BYTES_DEFAULT,
        },
    })
}

pub(crate) fn run_cli(cli: Cli, out: &mut dyn Write) -> Result<()> {
    let paths = resolve_paths(&cli)?;
    tracing::debug!(
        cwd = %paths.cwd.display(),
        config_root = %paths.config_root.display(),
        "resolved latch paths"
    );
    match &cli.command {
        CliCommand::Trust(TrustCommand::Pin { name, scope }) => {
            pin_extension(&paths, name, (*scope).into(), out)
        }
        CliCommand::Override(command) => edit_override(&paths, command, out),
        command => {
            let manager = build_manager(&cli, &paths);
            manager.load(&paths.cwd);
            match command {
                CliCommand::Extensions => print_extensions(&manager, out),
                CliCommand::Commands => print_commands(&manager, out),
                CliCommand::Diagnostics { json } => print_diagnostics(&manager, *json, out),
                CliCommand::Policy { json } => print_policy(&manager, *json, out),
                CliCommand::CheckTool(args) => check_tool(&manager, args, out),
                CliCommand::RunCommand { name, args } => {
                    run_command(&manager, name, &args.join(" "), out)
                }
                CliCommand::Trust(_) | CliCommand::Override(_) => Ok(()),
            }
        }
    }
}

fn print_extensions(manager: &ExtensionManager, out: &mut dyn Write) -> Result<()> {
    let extensions = manager.list_extensions();
    if extensions.is_empty() {
        writeln!(out, "no extensions loaded")?;
        return Ok(());
    }
    for extension in extensions {
        writeln!(
            out,
            "{} ({}) {}",
            extension.name,
            extension.scope.as_str(),
            extension.path.display()
        )?;
        for (label, names) in [
            ("commands", &extension.commands),
            ("tool hooks", &extension.tool_hooks),
            ("tool result hooks", &extension.tool_result_hooks),
        ] {
            if !names.is_empty() {
                writeln!(out, "  {label}: {}", names.join(", "))?;
            }
        }
    }
    Ok(())
}

fn print_commands(manager: &ExtensionManager, out: &mut dyn Write) -> Result<()> {
    let commands = manager.list_commands();
    if commands.is_empty() {
        writeln!(out, "no commands registered")?;
        return Ok(());
    }
    for command in commands {
        let mut line = format!("/{}", command.name);
        if let Some(usage) = command.usage.as_deref() {
            line.push(' ');
            line.push_str(usage);
        }
        if let Some(description) = command.description.as_deref() {
            line.push_str(" - ");
            line.push_str(description);
        }
        writeln!(out, "{line} [{}]", command.origin.extension)?;
    }
    Ok(())
}

fn print_diagnostics(manager: &ExtensionManager, json: bool, out: &mut dyn Write) -> Result<()> {
    let diagnostics = manager.list_diagnostics();
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&diagnostics)?)?;
        return Ok(());
    }
    if diagnostics.is_empty() {
        writeln!(out, "no diagnostics")?;
    }
    for diagnostic in diagnostics {
        writeln!(out, "{}", diagnostic.render())?;
    }
    Ok(())
}

fn join_names(names: &BTreeSet<String>) -> String {
    if names.is_empty() {
        return "-".to_string();
    }
    names.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn print_policy(manager: &ExtensionManager, json: bool, out: &mut dyn Write) -> Result<()> {
    let policy = manager.trust_policy();
    let overrides = manager.policy_overrides();
    if json {
        let payload = json!({
            "trust": serde_json::to_value(&policy)?,
            "overrides": serde_json::to_value(overrides.entries())?,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        return Ok(());
    }
    writeln!(out, "enforce: {}", policy.enforce)?;
    writeln!(out, "requires_allowlist: {}", policy.requires_allowlist)?;
    writeln!(out, "allowed: {}", join_names(&policy.allowed))?;
    writeln!(out, "denied: {}", join_names(&policy.denied))?;
    writeln!(out, "require_hashes: {}", policy.require_hashes)?;
    for (name, digest) in &policy.hashes {
        writeln!(out, "hash {name}: {digest}")?;
    }
    for (hook, decision) in overrides.entries() {
        writeln!(out, "override {hook}: {}", decision.as_str())?;
    }
    Ok(())
}

fn check_tool(manager: &ExtensionManager, args: &CheckToolArgs, out: &mut dyn Write) -> Result<()> {
    let tool_args = serde_json::from_str::<Value>(&args.args)
        .with_context(|| format!("--args must be valid JSON: {}", args.args))?;
    let call = ToolCall::new(args.tool.clone(), tool_args);
    let context = ToolHookContext {
        session_id: args.session_id.clone(),
        tags: args.tags.clone(),
        ..ToolHookContext::default()
    };
    let payload = match manager.run_tool_hooks(&call, &context) {
        Some(decision) => serde_json::to_value(decision)?,
        None => json!({"decision": "none"}),
    };
    writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

fn run_command(manager: &ExtensionManager, name: &str, args: &str, out: &mut dyn Write) -> Result<()> {
    let outcome = manager
        .run_command(name, args, &CommandContext::default())
        .ok_or_else(|| anyhow!("unknown command '{name}'"))?;
    match outcome {
        CommandOutcome::Completed { output } => match output {
            CommandOutput::Nothing => {}
            CommandOutput::Display { text } => writeln!(out, "{text}")?,
            CommandOutput::Send { message } => writeln!(out, "send: {message}")?,
            CommandOutput::Handled => writeln!(out, "handled")?,
        },
        CommandOutcome::Failed { error } => bail!(error),
    }
    Ok(())
}

fn find_extension_file(dir: &Path, name: &str) -> Result<PathBuf> {
    for extension in EXTENSION_SCRIPT_EXTENSIONS {
        let candidate = dir.join(format!("{name}.{extension}"));
        match fs::symlink_metadata(&candidate) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                bail!("refusing to pin symlinked extension {}", candidate.display())
            }
            Ok(metadata) if metadata.is_file() => return Ok(candidate),
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to inspect {}", candidate.display()))
            }
        }
    }
    bail!("no extension named '{name}' in {}", dir.display())
}

fn pin_extension(
    paths: &ResolvedPaths,
    name: &str,
    scope: ExtensionScope,
    out: &mut dyn Write,
) -> Result<()> {
    let dir = scope_extensions_dir(scope, &paths.config_root, &paths.cwd);
    let file = find_extension_file(&dir, name)?;
    let digest = sha256_file_hex(&file)?;
    let trust_file = dir.join(TRUST_FILE_NAMES[0]);
    write_pinned_hash(&trust_file, name, &digest)?;
    writeln!(
        out,
        "pinned {name} sha256:{digest} in {}",
        trust_file.display()
    )?;
    Ok(())
}

fn edit_override(paths: &ResolvedPaths, command: &OverrideCommand, out: &mut dyn Write) -> Result<()> {
    match command {
        OverrideCommand::Set {
            hook,
            policy,
            scope,
        } => {
            let dir = scope_extensions_dir((*scope).into(), &paths.config_root, &paths.cwd);
            let path = dir.join(POLICY_OVERRIDES_FILE_NAME);
            let policy = HookPolicy::from(*policy);
            write_policy_override(&path, hook, Some(policy))?;
            writeln!(out, "override {hook}: {} ({})", policy.as_str(), path.display())?;
        }
        OverrideCommand::Clear { hook, scope } => {
            let dir = scope_extensions_dir((*scope).into(), &paths.config_root, &paths.cwd);
            let path = dir.join(POLICY_OVERRIDES_FILE_NAME);
            write_policy_override(&path, hook, None)?;
            writeln!(out, "override {hook} cleared ({})", path.display())?;
        }
    }
    Ok(())
}
