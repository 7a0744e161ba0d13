//! JSON wire format spoken with extension processes.
//!
//! Registration output is line-delimited: each non-empty stdout line is either
//! one `{"call": ...}` object or a static `{"commands": [...]}` manifest.
//! Handler requests get exactly one JSON object back.

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use crate::{
    handler::{CommandContext, CommandOutput, HookVerdict, ToolCall, ToolHookContext, ToolResult},
    registry::{CommandRegistration, HookPolicy, ToolHookRegistration, ToolResultHookRegistration},
    safe_fs::ExtensionScope,
};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One registration call an extension made while loading.
pub enum RegistrationCall {
    Command(CommandRegistration),
    ToolHook(ToolHookRegistration),
    ToolResultHook(ToolResultHookRegistration),
}

pub fn registration_request(extension: &str, scope: ExtensionScope) -> Value {
    json!({
        "protocol": PROTOCOL_VERSION,
        "kind": "register",
        "extension": {
            "name": extension,
            "scope": scope.as_str(),
        },
    })
}

pub fn command_request(command: &str, args: &str, context: &CommandContext) -> Value {
    json!({
        "protocol": PROTOCOL_VERSION,
        "kind": "command",
        "command": command,
        "args": args,
        "context": context,
    })
}

pub fn tool_hook_request(hook: &str, call: &ToolCall, context: &ToolHookContext) -> Value {
    json!({
        "protocol": PROTOCOL_VERSION,
        "kind": "tool-hook",
        "hook": hook,
        "call": call,
        "context": context,
    })
}

pub fn tool_result_hook_request(hook: &str, result: &ToolResult, context: &ToolHookContext) -> Value {
    json!({
        "protocol": PROTOCOL_VERSION,
        "kind": "tool-result-hook",
        "hook": hook,
        "result": result,
        "context": context,
    })
}

/// Parses one stdout line of registration output. Blank lines yield nothing;
/// each malformed entry yields its own error message.
pub fn parse_registration_line(line: &str) -> Vec<Result<RegistrationCall, String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(error) => {
            return vec![Err(format!(
                "registration output line is not valid JSON: {error}"
            ))]
        }
    };
    let Some(object) = value.as_object() else {
        return vec![Err(
            "registration output line must be a JSON object".to_string()
        )];
    };

    if let Some(commands) = object.get("commands") {
        let Some(commands) = commands.as_array() else {
            return vec![Err("field 'commands' must be an array".to_string())];
        };
        return commands
            .iter()
            .map(|entry| match entry.as_object() {
                Some(entry) => parse_command_registration(entry).map(RegistrationCall::Command),
                None => Err("each entry in 'commands' must be an object".to_string()),
            })
            .collect();
    }

    let call = match object.get("call").and_then(Value::as_str) {
        Some(call) => call,
        None => {
            return vec![Err(
                "registration output line must contain a 'call' string or a 'commands' array"
                    .to_string(),
            )]
        }
    };
    let parsed = match call {
        "registerCommand" => parse_command_registration(object).map(RegistrationCall::Command),
        "registerToolHook" => parse_tool_hook_registration(object).map(RegistrationCall::ToolHook),
        "registerToolResultHook" => {
            parse_tool_result_hook_registration(object).map(RegistrationCall::ToolResultHook)
        }
        other => Err(format!("unsupported registration call '{other}'")),
    };
    vec![parsed]
}

fn required_name(object: &Map<String, Value>) -> Result<String, String> {
    match object.get("name") {
        Some(Value::String(name)) => Ok(name.clone()),
        Some(_) => Err("field 'name' must be a string".to_string()),
        None => Err("registration is missing field 'name'".to_string()),
    }
}

fn optional_string(object: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(format!("field '{key}' must be a string")),
    }
}

fn string_list(object: &Map<String, Value>, key: &str) -> Result<Vec<String>, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(single)) => Ok(vec![single.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("field '{key}' must contain only strings"))
            })
            .collect(),
        Some(_) => Err(format!("field '{key}' must be a string or an array of strings")),
    }
}

fn parse_command_registration(object: &Map<String, Value>) -> Result<CommandRegistration, String> {
    Ok(CommandRegistration {
        name: required_name(object)?,
        description: optional_string(object, "description")?,
        usage: optional_string(object, "usage")?,
    })
}

fn parse_tool_hook_registration(object: &Map<String, Value>) -> Result<ToolHookRegistration, String> {
    let name = required_name(object)?;
    let policy = match optional_string(object, "policy")? {
        None => None,
        Some(raw) => Some(HookPolicy::parse(&raw).ok_or_else(|| {
            format!("tool hook '{name}' has unsupported policy '{raw}' (expected allow or deny)")
        })?),
    };
    Ok(ToolHookRegistration {
        description: optional_string(object, "description")?,
        tools: string_list(object, "tools")?,
        policy,
        tags: string_list(object, "tags")?,
        name,
    })
}

fn parse_tool_result_hook_registration(
    object: &Map<String, Value>,
) -> Result<ToolResultHookRegistration, String> {
    Ok(ToolResultHookRegistration {
        name: required_name(object)?,
        description: optional_string(object, "description")?,
        tools: string_list(object, "tools")?,
    })
}

/// `{"handled": true}` wins over `send`, which wins over `text`.
pub fn parse_command_response(response: &Value) -> Result<CommandOutput> {
    let Some(object) = response.as_object() else {
        bail!("command response must be a JSON object");
    };
    match object.get("handled") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => {}
        Some(Value::Bool(true)) => return Ok(CommandOutput::Handled),
        Some(_) => bail!("command response field 'handled' must be a boolean"),
    }
    match object.get("send") {
        None | Some(Value::Null) => {}
        Some(Value::String(message)) => {
            return Ok(CommandOutput::Send {
                message: message.clone(),
            })
        }
        Some(_) => bail!("command response field 'send' must be a string"),
    }
    match object.get("text") {
        None | Some(Value::Null) => Ok(CommandOutput::Nothing),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(CommandOutput::Nothing),
        Some(Value::String(text)) => Ok(CommandOutput::Display { text: text.clone() }),
        Some(_) => bail!("command response field 'text' must be a string"),
    }
}

/// Reads a tool hook response. A missing or null `decision` means no opinion.
pub fn parse_tool_hook_response(response: &Value) -> Result<Option<HookVerdict>> {
    let Some(object) = response.as_object() else {
        bail!("tool hook response must be a JSON object");
    };
    let decision = match object.get("decision") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(decision)) => decision.trim().to_ascii_lowercase(),
        Some(_) => bail!("tool hook response field 'decision' must be a string"),
    };
    match decision.as_str() {
        "allow" => {
            let args = object.get("args").filter(|args| !args.is_null()).cloned();
            Ok(Some(HookVerdict::Allow { args }))
        }
        "deny" => {
            let reason = match object.get("reason") {
                None | Some(Value::Null) => None,
                Some(Value::String(reason)) => Some(reason.clone()),
                Some(_) => bail!("tool hook response field 'reason' must be a string"),
            };
            Ok(Some(HookVerdict::Deny { reason }))
        }
        "respond" => match object.get("content") {
            None | Some(Value::Null) => {
                bail!("tool hook response with decision 'respond' requires 'content'")
            }
            Some(content) => Ok(Some(HookVerdict::Respond {
                content: content.clone(),
            })),
        },
        other => bail!("unsupported tool hook decision '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        parse_command_response, parse_registration_line, parse_tool_hook_response,
        registration_request, tool_hook_request, RegistrationCall,
    };
    use crate::{
        handler::{CommandOutput, HookVerdict, ToolCall, ToolHookContext},
        registry::HookPolicy,
        safe_fs::ExtensionScope,
    };

    #[test]
    fn unit_requests_carry_protocol_and_kind() {
        let request = registration_request("guard", ExtensionScope::Project);
        assert_eq!(request["protocol"], 1);
        assert_eq!(request["kind"], "register");
        assert_eq!(request["extension"]["scope"], "project");

        let request = tool_hook_request(
            "guard",
            &ToolCall::new("bash", json!({"command": "ls"})),
            &ToolHookContext {
                tags: vec!["prod".to_string()],
                ..ToolHookContext::default()
            },
        );
        let rendered = serde_json::to_string(&request).expect("serialize");
        assert!(rendered.contains("\"kind\":\"tool-hook\""));
        assert_eq!(request["call"]["tool_name"], "bash");
        assert_eq!(request["context"]["tags"][0], "prod");
    }

    #[test]
    fn functional_parse_registration_line_reads_calls() {
        let calls = parse_registration_line(
            r#"{"call":"registerToolHook","name":"guard","tools":["shopify_*"],"policy":"deny","tags":"prod"}"#,
        );
        assert_eq!(calls.len(), 1);
        let Ok(RegistrationCall::ToolHook(hook)) = &calls[0] else {
            panic!("expected tool hook, got {calls:?}");
        };
        assert_eq!(hook.name, "guard");
        assert_eq!(hook.tools, vec!["shopify_*"]);
        assert_eq!(hook.policy, Some(HookPolicy::Deny));
        assert_eq!(hook.tags, vec!["prod"]);

        let calls = parse_registration_line(
            r#"{"commands":[{"name":"deploy","description":"ship"},{"name":"rollback"},3]}"#,
        );
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], Ok(RegistrationCall::Command(command)) if command.name == "deploy"));
        assert!(calls[2].is_err());
        assert!(parse_registration_line("   ").is_empty());
    }

    #[test]
    fn regression_parse_registration_line_reports_malformed_input() {
        for (line, needle) in [
            ("not json", "not valid JSON"),
            ("[1]", "must be a JSON object"),
            (r#"{"call":"registerTheme","name":"x"}"#, "unsupported registration call"),
            (r#"{"call":"registerCommand"}"#, "missing field 'name'"),
            (r#"{"call":"registerToolHook","name":"g","policy":"maybe"}"#, "unsupported policy"),
            (r#"{"call":"registerToolHook","name":"g","tools":[1]}"#, "only strings"),
            (r#"{"name":"g"}"#, "'call' string"),
        ] {
            let calls = parse_registration_line(line);
            let error = calls[0].as_ref().expect_err(line);
            assert!(error.contains(needle), "{line}: {error}");
        }
    }

    #[test]
    fn unit_parse_command_response_prefers_handled_then_send_then_text() {
        assert_eq!(
            parse_command_response(&json!({})).expect("empty"),
            CommandOutput::Nothing
        );
        assert_eq!(
            parse_command_response(&json!({"text": "hi"})).expect("text"),
            CommandOutput::Display {
                text: "hi".to_string()
            }
        );
        assert_eq!(
            parse_command_response(&json!({"text": "hi", "send": "go"})).expect("send"),
            CommandOutput::Send {
                message: "go".to_string()
            }
        );
        assert_eq!(
            parse_command_response(&json!({"handled": true, "send": "go"})).expect("handled"),
            CommandOutput::Handled
        );
        assert!(parse_command_response(&json!({"text": 3})).is_err());
    }

    #[test]
    fn unit_parse_tool_hook_response_maps_decisions() {
        assert_eq!(parse_tool_hook_response(&json!({})).expect("none"), None);
        assert_eq!(
            parse_tool_hook_response(&json!({"decision": "allow", "args": {"a": 1}}))
                .expect("allow"),
            Some(HookVerdict::Allow {
                args: Some(json!({"a": 1}))
            })
        );
        assert_eq!(
            parse_tool_hook_response(&json!({"decision": "DENY"})).expect("deny"),
            Some(HookVerdict::Deny { reason: None })
        );
        assert_eq!(
            parse_tool_hook_response(&json!({"decision": "respond", "content": "cached"}))
                .expect("respond"),
            Some(HookVerdict::Respond {
                content: json!("cached")
            })
        );
        assert!(parse_tool_hook_response(&json!({"decision": "respond"})).is_err());
        assert!(parse_tool_hook_response(&json!({"decision": "maybe"})).is_err());
        assert!(parse_tool_hook_response(&json!("deny")).is_err());
    }
}
