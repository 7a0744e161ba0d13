//! Runs the registration request for one admitted extension and applies the
//! calls it makes to the registry.

use std::sync::Arc;

use crate::{
    diagnostics::DiagnosticLog,
    process::{run_extension_process, ExtensionProcessConfig, ProcessExtension},
    protocol::{parse_registration_line, registration_request, RegistrationCall},
    registry::{ExtensionInfo, ExtensionRegistry, RegistrationError, RegistrationOrigin},
    safe_fs::ExtensionFile,
};

/// Loads one extension. Calls applied before a timeout or crash stay
/// registered. The extension is recorded as visible only when at least one
/// registration succeeded; the count of successful registrations is returned.
///
/// With `pinned_sha256` set, the script is re-hashed before registration and
/// before every later invocation.
pub fn load_extension(
    file: &ExtensionFile,
    pinned_sha256: Option<&str>,
    config: &ExtensionProcessConfig,
    registry: &mut ExtensionRegistry,
    log: &mut DiagnosticLog,
) -> usize {
    let source = file.path.display().to_string();
    let handler = Arc::new(
        ProcessExtension::new(file.name.clone(), file.path.clone(), config.clone())
            .with_pinned_sha256(pinned_sha256),
    );
    let origin = RegistrationOrigin {
        extension: file.name.clone(),
        source: file.path.clone(),
    };
    let mut info = ExtensionInfo::new(file.name.clone(), file.path.clone(), file.scope);
    let request = registration_request(&file.name, file.scope);

    let outcome = match handler.verify_integrity() {
        Ok(()) => run_extension_process(
            &file.path,
            &file.name,
            config,
            &request,
            config.registration_timeout_ms,
            &mut |line| {
                for parsed in parse_registration_line(line) {
                    let call = match parsed {
                        Ok(call) => call,
                        Err(message) => {
                            log.record(source.as_str(), message);
                            continue;
                        }
                    };
                    if let Err(error) =
                        apply_registration(call, &origin, &handler, registry, &mut info)
                    {
                        log.record(source.as_str(), error.to_string());
                    }
                }
            },
        ),
        Err(error) => Err(error),
    };
    if let Err(error) = outcome {
        log.record(
            source.as_str(),
            format!("extension registration failed: {error:#}"),
        );
    }

    let registered = info.registration_count();
    if registered == 0 {
        log.record(
            source,
            "extension registered no commands or hooks and will not be listed",
        );
    } else {
        tracing::debug!(
            extension = %file.name,
            commands = info.commands.len(),
            tool_hooks = info.tool_hooks.len(),
            tool_result_hooks = info.tool_result_hooks.len(),
            "extension loaded"
        );
        registry.record_extension(info);
    }
    registered
}

fn apply_registration(
    call: RegistrationCall,
    origin: &RegistrationOrigin,
    handler: &Arc<ProcessExtension>,
    registry: &mut ExtensionRegistry,
    info: &mut ExtensionInfo,
) -> Result<(), RegistrationError> {
    match call {
        RegistrationCall::Command(registration) => {
            let name = registry.register_command(registration, origin.clone(), handler.clone())?;
            info.commands.push(name);
        }
        RegistrationCall::ToolHook(registration) => {
            let name =
                registry.register_tool_hook(registration, origin.clone(), handler.clone())?;
            info.tool_hooks.push(name);
        }
        RegistrationCall::ToolResultHook(registration) => {
            let name =
                registry.register_tool_result_hook(registration, origin.clone(), handler.clone())?;
            info.tool_result_hooks.push(name);
        }
    }
    Ok(())
}
