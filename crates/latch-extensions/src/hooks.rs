//! Tool hook and tool result hook pipelines.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
};

use serde::Serialize;
use serde_json::Value;

use crate::{
    diagnostics::RuntimeDiagnostics,
    handler::{HookVerdict, ToolCall, ToolHookContext, ToolResult},
    matcher::tags_match,
    policy_overrides::PolicyOverrides,
    registry::{ExtensionRegistry, HookPolicy, ToolHook},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
/// Final outcome of the tool hook pipeline for one call.
pub enum ToolHookDecision {
    /// Continue with these (possibly rewritten) arguments.
    Allow { args: Value },
    Deny {
        reason: String,
        hook: String,
        source: PathBuf,
    },
    /// Skip the tool and return `content` as its result.
    Respond {
        content: Value,
        hook: String,
        source: PathBuf,
    },
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "handler panicked".to_string()
}

fn hook_source(hook: &ToolHook) -> String {
    format!("{} ({})", hook.origin.source.display(), hook.name)
}

fn deny(hook: &ToolHook, reason: String) -> ToolHookDecision {
    ToolHookDecision::Deny {
        reason,
        hook: hook.name.clone(),
        source: hook.origin.source.clone(),
    }
}

fn evaluate_hook(
    hook: &ToolHook,
    call: &ToolCall,
    context: &ToolHookContext,
    runtime: &mut RuntimeDiagnostics,
) -> Option<HookVerdict> {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        hook.handler.evaluate(&hook.name, call, context)
    }));
    match outcome {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(error)) => {
            runtime.record(hook_source(hook), format!("tool hook failed: {error:#}"));
            None
        }
        Err(payload) => {
            runtime.record(
                hook_source(hook),
                format!("tool hook panicked: {}", panic_message(payload.as_ref())),
            );
            None
        }
    }
}

/// Runs every hook matching the session tags and the tool name, in
/// registration order.
///
/// Overrides beat a hook's static policy, which beats its handler. The first
/// deny or respond ends the pipeline. `None` means no hook denied, responded or
/// rewrote the arguments.
pub fn run_tool_hooks(
    registry: &ExtensionRegistry,
    overrides: &PolicyOverrides,
    call: &ToolCall,
    context: &ToolHookContext,
    runtime: &mut RuntimeDiagnostics,
) -> Option<ToolHookDecision> {
    let mut current = call.clone();
    let mut rewritten = false;

    for hook in registry.tool_hooks() {
        if !tags_match(&hook.tags, &context.tags) || !hook.tools.matches(&call.tool_name) {
            continue;
        }
        if let Some(policy) = overrides.get(&hook.name) {
            match policy {
                HookPolicy::Allow => continue,
                HookPolicy::Deny => {
                    return Some(deny(
                        hook,
                        format!("blocked by policy override for hook '{}'", hook.name),
                    ))
                }
            }
        }
        if let Some(policy) = hook.policy {
            match policy {
                HookPolicy::Allow => continue,
                HookPolicy::Deny => {
                    return Some(deny(
                        hook,
                        format!("blocked by static policy of hook '{}'", hook.name),
                    ))
                }
            }
        }
        match evaluate_hook(hook, &current, context, runtime) {
            None | Some(HookVerdict::Allow { args: None }) => {}
            Some(HookVerdict::Allow { args: Some(args) }) => {
                tracing::debug!(hook = %hook.name, tool = %call.tool_name, "tool hook rewrote arguments");
                current.args = args;
                rewritten = true;
            }
            Some(HookVerdict::Deny { reason }) => {
                let reason = reason
                    .map(|reason| reason.trim().to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| format!("blocked by tool hook '{}'", hook.name));
                return Some(deny(hook, reason));
            }
            Some(HookVerdict::Respond { content }) => {
                return Some(ToolHookDecision::Respond {
                    content,
                    hook: hook.name.clone(),
                    source: hook.origin.source.clone(),
                });
            }
        }
    }

    rewritten.then(|| ToolHookDecision::Allow { args: current.args })
}

/// Fires every result hook matching the tool name. Failures are recorded and
/// never stop later hooks.
pub fn run_tool_result_hooks(
    registry: &ExtensionRegistry,
    result: &ToolResult,
    context: &ToolHookContext,
    runtime: &mut RuntimeDiagnostics,
) {
    for hook in registry.tool_result_hooks() {
        if !hook.tools.matches(&result.name) {
            continue;
        }
        let source = format!("{} ({})", hook.origin.source.display(), hook.name);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            hook.handler.observe(&hook.name, result, context)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                runtime.record(source, format!("tool result hook failed: {error:#}"))
            }
            Err(payload) => runtime.record(
                source,
                format!(
                    "tool result hook panicked: {}",
                    panic_message(payload.as_ref())
                ),
            ),
        }
    }
}
