use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use latch_extensions::{
    ExtensionScope, HookPolicy, HOOK_TIMEOUT_MS_DEFAULT, REGISTRATION_TIMEOUT_MS_DEFAULT,
};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "latch",
    about = "Inspect, trust and exercise Latch extensions",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        global = true,
        help = "Project directory whose .config/extensions is scanned. Defaults to the current directory."
    )]
    pub(crate) cwd: Option<PathBuf>,

    #[arg(
        long = "config-root",
        env = "LATCH_CONFIG_ROOT",
        global = true,
        help = "Directory holding the global extensions/ folder. Defaults to $XDG_CONFIG_HOME/latch or $HOME/.config/latch."
    )]
    pub(crate) config_root: Option<PathBuf>,

    #[arg(
        long,
        env = "LATCH_EXTENSION_INTERPRETER",
        global = true,
        help = "Run every extension script through this program instead of executing it directly."
    )]
    pub(crate) interpreter: Option<PathBuf>,

    #[arg(
        long = "registration-timeout-ms",
        global = true,
        default_value_t = REGISTRATION_TIMEOUT_MS_DEFAULT,
        value_parser = parse_positive_u64,
        help = "Time limit for one extension to finish registering."
    )]
    pub(crate) registration_timeout_ms: u64,

    #[arg(
        long = "hook-timeout-ms",
        env = "LATCH_HOOK_TIMEOUT_MS",
        global = true,
        default_value_t = HOOK_TIMEOUT_MS_DEFAULT,
        value_parser = parse_positive_u64,
        help = "Time limit for one command, tool hook or result hook invocation."
    )]
    pub(crate) hook_timeout_ms: u64,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// List loaded extensions and what each registered.
    Extensions,
    /// List registered commands.
    Commands,
    /// Print load and runtime diagnostics.
    Diagnostics {
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved trust policy and hook overrides.
    Policy {
        #[arg(long)]
        json: bool,
    },
    /// Run the tool hook pipeline for one tool call.
    CheckTool(CheckToolArgs),
    /// Dispatch a registered command.
    RunCommand {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Manage pinned extension digests.
    #[command(subcommand)]
    Trust(TrustCommand),
    /// Manage persisted tool hook overrides.
    #[command(subcommand)]
    Override(OverrideCommand),
}

#[derive(Debug, Args)]
pub(crate) struct CheckToolArgs {
    #[arg(long)]
    pub(crate) tool: String,

    #[arg(long, default_value = "{}", help = "Tool arguments as a JSON value.")]
    pub(crate) args: String,

    #[arg(long = "tag", help = "Session tag; repeatable.")]
    pub(crate) tags: Vec<String>,

    #[arg(long = "session-id")]
    pub(crate) session_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum TrustCommand {
    /// Store the current sha256 of an extension file in the scope's trust.json.
    Pin {
        name: String,
        #[arg(long, value_enum, default_value_t = CliScope::Project)]
        scope: CliScope,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum OverrideCommand {
    /// Force a tool hook to allow or deny.
    Set {
        hook: String,
        #[arg(value_enum)]
        policy: CliHookPolicy,
        #[arg(long, value_enum, default_value_t = CliScope::Project)]
        scope: CliScope,
    },
    /// Remove a tool hook override.
    Clear {
        hook: String,
        #[arg(long, value_enum, default_value_t = CliScope::Project)]
        scope: CliScope,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum CliScope {
    Global,
    Project,
}

impl From<CliScope> for ExtensionScope {
    fn from(value: CliScope) -> Self {
        match value {
            CliScope::Global => ExtensionScope::Global,
            CliScope::Project => ExtensionScope::Project,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum CliHookPolicy {
    Allow,
    Deny,
}

impl From<CliHookPolicy> for HookPolicy {
    fn from(value: CliHookPolicy) -> Self {
        match value {
            CliHookPolicy::Allow => HookPolicy::Allow,
            CliHookPolicy::Deny => HookPolicy::Deny,
        }
    }
}
