//! Extension discovery, trust admission and hook dispatch for Latch.
//!
//! Extensions are scripts found in a global and a project-local `extensions/`
//! directory. Each load cycle resolves the trust policy, admits the permitted
//! scripts, runs them as child processes to collect the commands and tool
//! hooks they register, and publishes the result as one immutable snapshot.
//! Tool calls are then evaluated against the registered hooks through
//! [`ExtensionManager::run_tool_hooks`].

pub mod admission;
pub mod diagnostics;
pub mod handler;
pub mod hooks;
pub mod loader;
pub mod manager;
pub mod matcher;
pub mod policy_overrides;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod safe_fs;
pub mod trust_policy;

pub use admission::{
    admitted_sha256, check_extension_admission, sha256_file_hex, sha256_hex, AdmissionRejection,
};
pub use diagnostics::{
    DiagnosticLog, DiagnosticPhase, ExtensionDiagnostic, RuntimeDiagnostics,
    RUNTIME_DIAGNOSTICS_CAPACITY,
};
pub use handler::{
    CommandContext, CommandHandler, CommandOutput, HookVerdict, ToolCall, ToolHookContext,
    ToolHookHandler, ToolResult, ToolResultHandler,
};
pub use hooks::ToolHookDecision;
pub use manager::{
    global_extensions_dir, project_extensions_dir, scope_extensions_dir, BuiltinRegistration,
    CommandOutcome, ExtensionManager, ExtensionManagerConfig, LoadSnapshot,
};
pub use policy_overrides::{write_policy_override, PolicyOverrides, POLICY_OVERRIDES_FILE_NAME};
pub use process::{
    ExtensionProcessConfig, HOOK_TIMEOUT_MS_DEFAULT, MAX_RESPONSE_BYTES_DEFAULT,
    REGISTRATION_TIMEOUT_MS_DEFAULT,
};
pub use registry::{
    CommandRegistration, ExtensionCommand, ExtensionInfo, ExtensionRegistry, HookPolicy,
    RegistrationError, ToolHook, ToolHookRegistration, ToolResultHook, ToolResultHookRegistration,
};
pub use safe_fs::{ExtensionFile, ExtensionScope, MAX_EXTENSION_FILE_BYTES};
pub use trust_policy::{write_pinned_hash, TrustEnv, TrustPolicy, TRUST_FILE_NAMES};
