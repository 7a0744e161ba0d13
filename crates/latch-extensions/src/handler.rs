//! Call payloads and the handler seams commands and hooks are dispatched through.

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize, PartialEq)]
/// One pending agent tool invocation.
pub struct ToolCall {
    pub tool_name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
/// Per-call context shared by tool hooks and tool result hooks.
pub struct ToolHookContext {
    pub session_id: Option<String>,
    pub tags: Vec<String>,
    pub cwd: PathBuf,
    pub allow_all: bool,
    pub redact: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
/// A completed tool execution as seen by result hooks.
pub struct ToolResult {
    pub name: String,
    pub args: Value,
    pub result_text: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// What one tool hook handler decided about a call.
pub enum HookVerdict {
    Allow { args: Option<Value> },
    Deny { reason: Option<String> },
    Respond { content: Value },
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CommandContext {
    pub session_id: Option<String>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
/// Result of a command handler.
pub enum CommandOutput {
    /// Nothing to show.
    Nothing,
    /// Text displayed to the user.
    Display { text: String },
    /// Text injected into the conversation as a chat message.
    Send { message: String },
    /// The command consumed the input; no further processing.
    Handled,
}

pub trait CommandHandler: Send + Sync {
    fn run(&self, command: &str, args: &str, context: &CommandContext) -> Result<CommandOutput>;
}

pub trait ToolHookHandler: Send + Sync {
    /// `Ok(None)` means the hook has no opinion about the call.
    fn evaluate(
        &self,
        hook: &str,
        call: &ToolCall,
        context: &ToolHookContext,
    ) -> Result<Option<HookVerdict>>;
}

pub trait ToolResultHandler: Send + Sync {
    fn observe(&self, hook: &str, result: &ToolResult, context: &ToolHookContext) -> Result<()>;
}
