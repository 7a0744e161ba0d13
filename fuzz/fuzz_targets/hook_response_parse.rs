#![no_main]

use latch_extensions::{
    protocol::{parse_command_response, parse_registration_line, parse_tool_hook_response},
    HookVerdict,
};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);

    for line in raw.lines() {
        for parsed in parse_registration_line(line) {
            if let Err(message) = parsed {
                assert!(!message.trim().is_empty());
            }
        }
    }

    let Ok(response) = serde_json::from_str::<Value>(&raw) else {
        return;
    };
    match parse_tool_hook_response(&response) {
        Ok(Some(HookVerdict::Respond { content })) => assert!(!content.is_null()),
        Ok(Some(HookVerdict::Allow { args: Some(args) })) => assert!(!args.is_null()),
        Ok(_) => assert!(response.is_object()),
        Err(error) => assert!(!error.to_string().is_empty()),
    }
    let _ = parse_command_response(&response);
});
