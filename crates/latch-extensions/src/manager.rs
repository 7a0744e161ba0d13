//! Load cycle orchestration and the programmatic surface hosts use.

use std::{
    fs,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::{
    admission::{admitted_sha256, check_extension_admission},
    diagnostics::{DiagnosticLog, ExtensionDiagnostic, RuntimeDiagnostics},
    handler::{
        CommandContext, CommandHandler, CommandOutput, ToolCall, ToolHookContext, ToolHookHandler,
        ToolResult, ToolResultHandler,
    },
    hooks::{self, ToolHookDecision},
    loader::load_extension,
    policy_overrides::{load_policy_overrides, PolicyOverrides},
    process::ExtensionProcessConfig,
    registry::{
        CommandRegistration, ExtensionCommand, ExtensionInfo, ExtensionRegistry,
        RegistrationOrigin, ToolHookRegistration, ToolResultHookRegistration,
    },
    safe_fs::{is_safe_extension_dir, scan_extension_dir, ExtensionScope},
    trust_policy::{resolve_trust_policy, TrustEnv, TrustPolicy},
};

pub const EXTENSIONS_DIR_NAME: &str = "extensions";
pub const PROJECT_CONFIG_DIR_NAME: &str = ".config";
/// Origin name used for handlers registered by the host itself.
pub const BUILTIN_EXTENSION_NAME: &str = "builtin";

pub fn global_extensions_dir(config_root: &Path) -> PathBuf {
    config_root.join(EXTENSIONS_DIR_NAME)
}

pub fn project_extensions_dir(cwd: &Path) -> PathBuf {
    cwd.join(PROJECT_CONFIG_DIR_NAME).join(EXTENSIONS_DIR_NAME)
}

/// Returns the extensions directory of `scope`.
pub fn scope_extensions_dir(scope: ExtensionScope, config_root: &Path, cwd: &Path) -> PathBuf {
    match scope {
        ExtensionScope::Global => global_extensions_dir(config_root),
        ExtensionScope::Project => project_extensions_dir(cwd),
    }
}

fn absolute_path(path: &Path) -> PathBuf {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
pub struct ExtensionManagerConfig {
    /// Holds the global `extensions/` directory.
    pub config_root: PathBuf,
    pub env: TrustEnv,
    pub process: ExtensionProcessConfig,
}

impl ExtensionManagerConfig {
    /// Uses the trust variables of the current process environment.
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
            env: TrustEnv::from_process(),
            process: ExtensionProcessConfig::default(),
        }
    }
}

#[derive(Clone)]
/// An in-process handler the host registers ahead of every load.
pub enum BuiltinRegistration {
    Command(CommandRegistration, Arc<dyn CommandHandler>),
    ToolHook(ToolHookRegistration, Arc<dyn ToolHookHandler>),
    ToolResultHook(ToolResultHookRegistration, Arc<dyn ToolResultHandler>),
}

impl std::fmt::Debug for BuiltinRegistration {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(registration, _) => {
                formatter.debug_tuple("Command").field(registration).finish()
            }
            Self::ToolHook(registration, _) => {
                formatter.debug_tuple("ToolHook").field(registration).finish()
            }
            Self::ToolResultHook(registration, _) => formatter
                .debug_tuple("ToolResultHook")
                .field(registration)
                .finish(),
        }
    }
}

#[derive(Debug, Default)]
/// Everything one `load` produced. Replaced wholesale by the next load.
pub struct LoadSnapshot {
    pub cwd: Option<PathBuf>,
    pub policy: TrustPolicy,
    pub overrides: PolicyOverrides,
    pub registry: ExtensionRegistry,
    pub diagnostics: Vec<ExtensionDiagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CommandOutcome {
    Completed { output: CommandOutput },
    Failed { error: String },
}

pub struct ExtensionManager {
    config: ExtensionManagerConfig,
    builtins: Vec<BuiltinRegistration>,
    snapshot: ArcSwap<LoadSnapshot>,
    runtime: Mutex<RuntimeDiagnostics>,
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ExtensionManager")
            .field("config", &self.config)
            .field("builtins", &self.builtins)
            .finish_non_exhaustive()
    }
}

impl ExtensionManager {
    pub fn new(config: ExtensionManagerConfig) -> Self {
        Self {
            config,
            builtins: Vec::new(),
            snapshot: ArcSwap::from_pointee(LoadSnapshot::default()),
            runtime: Mutex::new(RuntimeDiagnostics::default()),
        }
    }

    /// Adds an in-process handler, registered before any extension on every load.
    pub fn with_builtin(mut self, builtin: BuiltinRegistration) -> Self {
        self.builtins.push(builtin);
        self
    }

    pub fn config(&self) -> &ExtensionManagerConfig {
        &self.config
    }

    /// Rebuilds policy, overrides and registry for `cwd` and swaps the result
    /// in. Never fails; every problem becomes a load diagnostic.
    pub fn load(&self, cwd: &Path) -> Arc<LoadSnapshot> {
        let cwd = absolute_path(cwd);
        let config_root = absolute_path(&self.config.config_root);
        let global_dir = global_extensions_dir(&config_root);
        let project_dir = project_extensions_dir(&cwd);
        let shared_dir = global_dir == project_dir;
        let mut scope_dirs = Vec::with_capacity(2);
        if is_safe_extension_dir(&config_root, &global_dir) {
            scope_dirs.push(global_dir.clone());
        }
        if !shared_dir && is_safe_extension_dir(&cwd, &project_dir) {
            scope_dirs.push(project_dir.clone());
        }

        let mut log = DiagnosticLog::new();
        let policy = resolve_trust_policy(&self.config.env, &scope_dirs, &mut log);
        let overrides = load_policy_overrides(&scope_dirs, &mut log);

        let mut registry = ExtensionRegistry::new();
        self.register_builtins(&mut registry, &mut log);

        let mut files = scan_extension_dir(&config_root, &global_dir, ExtensionScope::Global, &mut log);
        if !shared_dir {
            files.extend(scan_extension_dir(
                &cwd,
                &project_dir,
                ExtensionScope::Project,
                &mut log,
            ));
        }

        let discovered = files.len();
        let mut admitted = 0usize;
        for file in &files {
            let source = file.path.display().to_string();
            if let Err(rejection) = check_extension_admission(file, &policy) {
                log.record(source, rejection.to_string());
                continue;
            }
            if file.scope == ExtensionScope::Project && !policy.enforce {
                log.record(
                    source.as_str(),
                    "loading project-local extension with trust enforcement explicitly disabled",
                );
            }
            admitted += 1;
            load_extension(
                file,
                admitted_sha256(file, &policy),
                &self.config.process,
                &mut registry,
                &mut log,
            );
        }

        let snapshot = Arc::new(LoadSnapshot {
            cwd: Some(cwd),
            policy,
            overrides,
            diagnostics: log.into_entries(),
            registry,
        });
        tracing::info!(
            discovered,
            admitted,
            loaded = snapshot.registry.extensions().len(),
            commands = snapshot.registry.commands().len(),
            tool_hooks = snapshot.registry.tool_hooks().len(),
            tool_result_hooks = snapshot.registry.tool_result_hooks().len(),
            diagnostics = snapshot.diagnostics.len(),
            "extensions loaded"
        );
        self.snapshot.store(snapshot.clone());
        lock_unpoisoned(&self.runtime).clear();
        snapshot
    }

    fn register_builtins(&self, registry: &mut ExtensionRegistry, log: &mut DiagnosticLog) {
        for builtin in &self.builtins {
            let origin = RegistrationOrigin {
                extension: BUILTIN_EXTENSION_NAME.to_string(),
                source: PathBuf::from(format!("<{BUILTIN_EXTENSION_NAME}>")),
            };
            let outcome = match builtin.clone() {
                BuiltinRegistration::Command(registration, handler) => {
                    registry.register_command(registration, origin, handler)
                }
                BuiltinRegistration::ToolHook(registration, handler) => {
                    registry.register_tool_hook(registration, origin, handler)
                }
                BuiltinRegistration::ToolResultHook(registration, handler) => {
                    registry.register_tool_result_hook(registration, origin, handler)
                }
            };
            if let Err(error) = outcome {
                log.record(BUILTIN_EXTENSION_NAME, error.to_string());
            }
        }
    }

    /// The snapshot of the most recent load.
    pub fn snapshot(&self) -> Arc<LoadSnapshot> {
        self.snapshot.load_full()
    }

    pub fn get_command(&self, name: &str) -> Option<ExtensionCommand> {
        self.snapshot.load().registry.command(name).cloned()
    }

    pub fn list_commands(&self) -> Vec<ExtensionCommand> {
        self.snapshot.load().registry.commands().to_vec()
    }

    pub fn list_extensions(&self) -> Vec<ExtensionInfo> {
        self.snapshot.load().registry.extensions().to_vec()
    }

    /// Load diagnostics followed by runtime diagnostics.
    pub fn list_diagnostics(&self) -> Vec<ExtensionDiagnostic> {
        let mut diagnostics = self.snapshot.load().diagnostics.clone();
        diagnostics.extend(lock_unpoisoned(&self.runtime).snapshot());
        diagnostics
    }

    pub fn policy_overrides(&self) -> PolicyOverrides {
        self.snapshot.load().overrides.clone()
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        self.snapshot.load().policy.clone()
    }

    fn absorb_runtime(&self, local: RuntimeDiagnostics) {
        if local.is_empty() {
            return;
        }
        let mut runtime = lock_unpoisoned(&self.runtime);
        for diagnostic in local.snapshot() {
            runtime.push(diagnostic);
        }
    }

    fn with_default_cwd(snapshot: &LoadSnapshot, context: &ToolHookContext) -> ToolHookContext {
        let mut context = context.clone();
        if context.cwd.as_os_str().is_empty() {
            if let Some(cwd) = snapshot.cwd.as_ref() {
                context.cwd = cwd.clone();
            }
        }
        context
    }

    pub fn run_tool_hooks(
        &self,
        call: &ToolCall,
        context: &ToolHookContext,
    ) -> Option<ToolHookDecision> {
        let snapshot = self.snapshot.load_full();
        let context = Self::with_default_cwd(&snapshot, context);
        let mut local = RuntimeDiagnostics::default();
        let decision = hooks::run_tool_hooks(
            &snapshot.registry,
            &snapshot.overrides,
            call,
            &context,
            &mut local,
        );
        self.absorb_runtime(local);
        decision
    }

    pub fn run_tool_result_hooks(&self, result: &ToolResult, context: &ToolHookContext) {
        let snapshot = self.snapshot.load_full();
        let context = Self::with_default_cwd(&snapshot, context);
        let mut local = RuntimeDiagnostics::default();
        hooks::run_tool_result_hooks(&snapshot.registry, result, &context, &mut local);
        self.absorb_runtime(local);
    }

    /// `None` when no such command is registered.
    pub fn run_command(
        &self,
        name: &str,
        args: &str,
        context: &CommandContext,
    ) -> Option<CommandOutcome> {
        let command = self.get_command(name)?;
        let mut context = context.clone();
        if context.cwd.as_os_str().is_empty() {
            if let Some(cwd) = self.snapshot.load().cwd.as_ref() {
                context.cwd = cwd.clone();
            }
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            command.handler.run(&command.name, args, &context)
        }));
        let error = match outcome {
            Ok(Ok(output)) => return Some(CommandOutcome::Completed { output }),
            Ok(Err(error)) => format!("command '/{}' failed: {error:#}", command.name),
            Err(_) => format!("command '/{}' panicked", command.name),
        };
        lock_unpoisoned(&self.runtime).record(
            format!("{} ({})", command.origin.source.display(), command.name),
            error.as_str(),
        );
        Some(CommandOutcome::Failed { error })
    }
}
