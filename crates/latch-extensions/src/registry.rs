//! Name-keyed command and hook collections produced by one load cycle.

use std::{fmt, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    handler::{CommandHandler, ToolHookHandler, ToolResultHandler},
    matcher::ToolMatcher,
    safe_fs::ExtensionScope,
};

pub const MAX_REGISTRATION_NAME_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported `HookPolicy` values.
pub enum HookPolicy {
    Allow,
    Deny,
}

impl HookPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Which extension contributed a registration.
pub struct RegistrationOrigin {
    pub extension: String,
    pub source: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRegistration {
    pub name: String,
    pub description: Option<String>,
    pub usage: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolHookRegistration {
    pub name: String,
    pub description: Option<String>,
    pub tools: Vec<String>,
    pub policy: Option<HookPolicy>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolResultHookRegistration {
    pub name: String,
    pub description: Option<String>,
    pub tools: Vec<String>,
}

#[derive(Clone)]
pub struct ExtensionCommand {
    pub name: String,
    pub description: Option<String>,
    pub usage: Option<String>,
    pub origin: RegistrationOrigin,
    pub handler: Arc<dyn CommandHandler>,
}

impl fmt::Debug for ExtensionCommand {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ExtensionCommand")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("usage", &self.usage)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ToolHook {
    pub name: String,
    pub description: Option<String>,
    pub tools: ToolMatcher,
    pub policy: Option<HookPolicy>,
    pub tags: Vec<String>,
    pub origin: RegistrationOrigin,
    pub handler: Arc<dyn ToolHookHandler>,
}

impl fmt::Debug for ToolHook {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ToolHook")
            .field("name", &self.name)
            .field("tools", &self.tools.patterns())
            .field("policy", &self.policy)
            .field("tags", &self.tags)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ToolResultHook {
    pub name: String,
    pub description: Option<String>,
    pub tools: ToolMatcher,
    pub origin: RegistrationOrigin,
    pub handler: Arc<dyn ToolResultHandler>,
}

impl fmt::Debug for ToolResultHook {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ToolResultHook")
            .field("name", &self.name)
            .field("tools", &self.tools.patterns())
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// An extension that contributed at least one registration.
pub struct ExtensionInfo {
    pub name: String,
    pub path: PathBuf,
    pub scope: ExtensionScope,
    pub commands: Vec<String>,
    pub tool_hooks: Vec<String>,
    pub tool_result_hooks: Vec<String>,
}

impl ExtensionInfo {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, scope: ExtensionScope) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            scope,
            commands: Vec::new(),
            tool_hooks: Vec::new(),
            tool_result_hooks: Vec::new(),
        }
    }

    pub fn registration_count(&self) -> usize {
        self.commands.len() + self.tool_hooks.len() + self.tool_result_hooks.len()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error(
        "{kind} name '{name}' must be 1-64 characters of letters, digits, '-' or '_'"
    )]
    InvalidName { kind: &'static str, name: String },
    #[error("{kind} '{name}' is already registered by extension '{owner}'")]
    Duplicate {
        kind: &'static str,
        name: String,
        owner: String,
    },
    #[error("{kind} '{name}' has invalid tool pattern '{pattern}': {reason}")]
    InvalidToolPattern {
        kind: &'static str,
        name: String,
        pattern: String,
        reason: String,
    },
}

const COMMAND_KIND: &str = "command";
const TOOL_HOOK_KIND: &str = "tool hook";
const TOOL_RESULT_HOOK_KIND: &str = "tool result hook";

fn is_valid_registration_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().count() <= MAX_REGISTRATION_NAME_CHARS
        && name
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || character == '-' || character == '_')
}

/// Strips an optional leading `/` and lower-cases a command name.
pub fn normalize_command_name(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('/')
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

fn validate_name(kind: &'static str, name: &str) -> Result<(), RegistrationError> {
    if is_valid_registration_name(name) {
        Ok(())
    } else {
        Err(RegistrationError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

fn compile_tools(
    kind: &'static str,
    name: &str,
    tools: &[String],
) -> Result<ToolMatcher, RegistrationError> {
    ToolMatcher::new(tools).map_err(|(pattern, reason)| RegistrationError::InvalidToolPattern {
        kind,
        name: name.to_string(),
        pattern,
        reason,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Default)]
/// Commands, tool hooks and tool result hooks in registration order.
pub struct ExtensionRegistry {
    commands: Vec<ExtensionCommand>,
    tool_hooks: Vec<ToolHook>,
    tool_result_hooks: Vec<ToolResultHook>,
    extensions: Vec<ExtensionInfo>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the normalized command name on success.
    pub fn register_command(
        &mut self,
        registration: CommandRegistration,
        origin: RegistrationOrigin,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<String, RegistrationError> {
        let name = normalize_command_name(&registration.name);
        validate_name(COMMAND_KIND, &name)?;
        if let Some(existing) = self.command(&name) {
            return Err(RegistrationError::Duplicate {
                kind: COMMAND_KIND,
                name,
                owner: existing.origin.extension.clone(),
            });
        }
        self.commands.push(ExtensionCommand {
            name: name.clone(),
            description: non_empty(registration.description),
            usage: non_empty(registration.usage),
            origin,
            handler,
        });
        Ok(name)
    }

    pub fn register_tool_hook(
        &mut self,
        registration: ToolHookRegistration,
        origin: RegistrationOrigin,
        handler: Arc<dyn ToolHookHandler>,
    ) -> Result<String, RegistrationError> {
        let name = registration.name.trim().to_string();
        validate_name(TOOL_HOOK_KIND, &name)?;
        if let Some(existing) = self.tool_hook(&name) {
            return Err(RegistrationError::Duplicate {
                kind: TOOL_HOOK_KIND,
                name,
                owner: existing.origin.extension.clone(),
            });
        }
        let tools = compile_tools(TOOL_HOOK_KIND, &name, &registration.tools)?;
        let tags = registration
            .tags
            .iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        self.tool_hooks.push(ToolHook {
            name: name.clone(),
            description: non_empty(registration.description),
            tools,
            policy: registration.policy,
            tags,
            origin,
            handler,
        });
        Ok(name)
    }

    pub fn register_tool_result_hook(
        &mut self,
        registration: ToolResultHookRegistration,
        origin: RegistrationOrigin,
        handler: Arc<dyn ToolResultHandler>,
    ) -> Result<String, RegistrationError> {
        let name = registration.name.trim().to_string();
        validate_name(TOOL_RESULT_HOOK_KIND, &name)?;
        if let Some(existing) = self
            .tool_result_hooks
            .iter()
            .find(|hook| hook.name == name)
        {
            return Err(RegistrationError::Duplicate {
                kind: TOOL_RESULT_HOOK_KIND,
                name,
                owner: existing.origin.extension.clone(),
            });
        }
        let tools = compile_tools(TOOL_RESULT_HOOK_KIND, &name, &registration.tools)?;
        self.tool_result_hooks.push(ToolResultHook {
            name: name.clone(),
            description: non_empty(registration.description),
            tools,
            origin,
            handler,
        });
        Ok(name)
    }

    pub fn record_extension(&mut self, info: ExtensionInfo) {
        self.extensions.push(info);
    }

    /// Looks a command up by name; a leading `/` and letter case are ignored.
    pub fn command(&self, name: &str) -> Option<&ExtensionCommand> {
        let name = normalize_command_name(name);
        self.commands.iter().find(|command| command.name == name)
    }

    pub fn tool_hook(&self, name: &str) -> Option<&ToolHook> {
        self.tool_hooks.iter().find(|hook| hook.name == name)
    }

    pub fn commands(&self) -> &[ExtensionCommand] {
        &self.commands
    }

    pub fn tool_hooks(&self) -> &[ToolHook] {
        &self.tool_hooks
    }

    pub fn tool_result_hooks(&self) -> &[ToolResultHook] {
        &self.tool_result_hooks
    }

    pub fn extensions(&self) -> &[ExtensionInfo] {
        &self.extensions
    }
}
