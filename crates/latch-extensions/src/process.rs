//! Child-process execution of extension scripts under a deadline.
//!
//! Every request is one JSON line on stdin. Output is consumed line by line so
//! registration calls emitted before a timeout still count.

use std::{
    io::{BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use wait_timeout::ChildExt;

use crate::{
    admission::sha256_file_hex,
    handler::{
        CommandContext, CommandHandler, CommandOutput, HookVerdict, ToolCall, ToolHookContext,
        ToolHookHandler, ToolResult, ToolResultHandler,
    },
    protocol::{
        command_request, parse_command_response, parse_tool_hook_response,
        tool_hook_request, tool_result_hook_request, PROTOCOL_VERSION,
    },
};

pub const REGISTRATION_TIMEOUT_MS_DEFAULT: u64 = 10_000;
pub const HOOK_TIMEOUT_MS_DEFAULT: u64 = 5_000;
pub const MAX_RESPONSE_BYTES_DEFAULT: usize = 1024 * 1024;
/// Fallback interpreter when a script cannot be executed directly.
pub const DEFAULT_SCRIPT_INTERPRETER: &str = "node";
pub const ENV_EXTENSION_NAME: &str = "LATCH_EXTENSION_NAME";
pub const ENV_EXTENSION_PROTOCOL: &str = "LATCH_EXTENSION_PROTOCOL";
const STDERR_CAPTURE_BYTES: u64 = 16 * 1024;
const STDERR_COLLECT_GRACE: Duration = Duration::from_millis(200);
const INHERITED_ENV_KEYS: [&str; 2] = ["PATH", "HOME"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionProcessConfig {
    /// Always run scripts through this program instead of executing them.
    pub interpreter: Option<PathBuf>,
    pub registration_timeout_ms: u64,
    pub hook_timeout_ms: u64,
    pub max_response_bytes: usize,
}

impl Default for ExtensionProcessConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            registration_timeout_ms: REGISTRATION_TIMEOUT_MS_DEFAULT,
            hook_timeout_ms: HOOK_TIMEOUT_MS_DEFAULT,
            max_response_bytes: MAX_RESPONSE_BYTES_DEFAULT,
        }
    }
}

enum StdoutEvent {
    Line(String),
    Overflow,
    ReadFailed(std::io::Error),
}

#[cfg(test)]
fn extension_process_test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn format_extension_process_stdin_payload(request_json: &str) -> String {
    let mut payload = String::with_capacity(request_json.len() + 1);
    payload.push_str(request_json);
    payload.push('\n');
    payload
}

fn configure_extension_command(command: &mut Command, script: &Path, name: &str) {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .env(ENV_EXTENSION_NAME, name)
        .env(ENV_EXTENSION_PROTOCOL, PROTOCOL_VERSION.to_string());
    for key in INHERITED_ENV_KEYS {
        if let Some(value) = std::env::var_os(key) {
            command.env(key, value);
        }
    }
    if let Some(dir) = script.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        command.current_dir(dir);
    }
}

fn spawn_extension_child(script: &Path, name: &str, config: &ExtensionProcessConfig) -> Result<Child> {
    if let Some(interpreter) = config.interpreter.as_ref() {
        let mut command = Command::new(interpreter);
        command.arg(script);
        configure_extension_command(&mut command, script, name);
        return command.spawn().with_context(|| {
            format!(
                "failed to spawn extension {} with interpreter {}",
                script.display(),
                interpreter.display()
            )
        });
    }

    let mut direct = Command::new(script);
    configure_extension_command(&mut direct, script, name);
    match direct.spawn() {
        Ok(child) => Ok(child),
        Err(direct_error) => {
            let mut fallback = Command::new(DEFAULT_SCRIPT_INTERPRETER);
            fallback.arg(script);
            configure_extension_command(&mut fallback, script, name);
            fallback.spawn().map_err(|fallback_error| {
                anyhow!(
                    "failed to spawn extension process {}: {} (fallback {}: {})",
                    script.display(),
                    direct_error,
                    DEFAULT_SCRIPT_INTERPRETER,
                    fallback_error
                )
            })
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_stdout_reader(child: &mut Child, max_bytes: usize) -> Result<mpsc::Receiver<StdoutEvent>> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to open extension process stdout"))?;
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut total = 0usize;
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(read) => {
                    total = total.saturating_add(read);
                    if total > max_bytes {
                        let _ = sender.send(StdoutEvent::Overflow);
                        break;
                    }
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if sender.send(StdoutEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    let _ = sender.send(StdoutEvent::ReadFailed(error));
                    break;
                }
            }
        }
    });
    Ok(receiver)
}

fn spawn_stderr_collector(child: &mut Child) -> Option<mpsc::Receiver<String>> {
    let stderr = child.stderr.take()?;
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut captured = Vec::new();
        let mut stderr = stderr;
        let _ = (&mut stderr)
            .take(STDERR_CAPTURE_BYTES)
            .read_to_end(&mut captured);
        let _ = std::io::copy(&mut stderr, &mut std::io::sink());
        let _ = sender.send(String::from_utf8_lossy(&captured).trim().to_string());
    });
    Some(receiver)
}

/// Writes the request on its own thread; the caller's deadline also covers a
/// child that never drains stdin. A broken pipe is ignored since the child may
/// exit without reading its request.
fn spawn_stdin_writer(child: &mut Child, payload: String) -> Option<mpsc::Receiver<std::io::Error>> {
    let mut stdin = child.stdin.take()?;
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        match stdin.write_all(payload.as_bytes()).and_then(|()| stdin.flush()) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(error) => {
                let _ = sender.send(error);
            }
        }
    });
    Some(receiver)
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Runs one request against the extension script, streaming each stdout line
/// to `on_line` until the process exits or `timeout_ms` elapses.
///
/// Lines delivered before a failure are not retracted.
pub fn run_extension_process(
    script: &Path,
    name: &str,
    config: &ExtensionProcessConfig,
    request: &Value,
    timeout_ms: u64,
    on_line: &mut dyn FnMut(&str),
) -> Result<()> {
    #[cfg(test)]
    let _guard = extension_process_test_guard();

    let request_json =
        serde_json::to_string(request).context("failed to serialize extension request")?;
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut child = spawn_extension_child(script, name, config)?;

    let stdout = match spawn_stdout_reader(&mut child, config.max_response_bytes) {
        Ok(stdout) => stdout,
        Err(error) => {
            kill_and_reap(&mut child);
            return Err(error);
        }
    };
    let stderr = spawn_stderr_collector(&mut child);
    let stdin = spawn_stdin_writer(
        &mut child,
        format_extension_process_stdin_payload(&request_json),
    );

    loop {
        match stdout.recv_timeout(remaining(deadline)) {
            Ok(StdoutEvent::Line(line)) => on_line(&line),
            Ok(StdoutEvent::Overflow) => {
                kill_and_reap(&mut child);
                bail!(
                    "extension process output exceeded {} bytes",
                    config.max_response_bytes
                );
            }
            Ok(StdoutEvent::ReadFailed(error)) => {
                kill_and_reap(&mut child);
                return Err(error).context("failed to read extension process output");
            }
            Err(RecvTimeoutError::Timeout) => {
                kill_and_reap(&mut child);
                bail!("extension process timed out after {} ms", timeout_ms);
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = match child
        .wait_timeout(remaining(deadline))
        .context("failed while waiting for extension process")?
    {
        Some(status) => status,
        None => {
            kill_and_reap(&mut child);
            bail!("extension process timed out after {} ms", timeout_ms);
        }
    };
    if let Some(error) = stdin.and_then(|receiver| receiver.try_recv().ok()) {
        return Err(error).context("failed to write request to extension process stdin");
    }
    if !status.success() {
        let stderr = stderr
            .and_then(|receiver| receiver.recv_timeout(STDERR_COLLECT_GRACE).ok())
            .unwrap_or_default();
        if stderr.is_empty() {
            bail!("extension process exited with non-zero status {}", status);
        }
        bail!(
            "extension process exited with non-zero status {}: {}",
            status,
            stderr
        );
    }
    Ok(())
}

/// Runs one request and parses the complete stdout as a single JSON object.
/// Empty output is read as `{}`.
pub fn request_extension_response(
    script: &Path,
    name: &str,
    config: &ExtensionProcessConfig,
    request: &Value,
) -> Result<Value> {
    let mut output = String::new();
    run_extension_process(script, name, config, request, config.hook_timeout_ms, &mut |line| {
        output.push_str(line);
        output.push('\n');
    })?;
    if output.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let response = serde_json::from_str::<Value>(&output)
        .context("extension process response must be valid JSON")?;
    if !response.is_object() {
        bail!("extension process response must be a JSON object");
    }
    Ok(response)
}

#[derive(Debug, Clone)]
/// A loaded extension script acting as the handler for everything it registered.
pub struct ProcessExtension {
    pub name: String,
    pub path: PathBuf,
    pub config: ExtensionProcessConfig,
    /// Digest verified at admission; the file is re-hashed before every spawn.
    pub pinned_sha256: Option<String>,
}

impl ProcessExtension {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, config: ExtensionProcessConfig) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            config,
            pinned_sha256: None,
        }
    }

    pub fn with_pinned_sha256(mut self, digest: Option<&str>) -> Self {
        self.pinned_sha256 = digest.map(str::to_string);
        self
    }

    /// Fails when the script no longer matches the digest it was admitted with.
    pub fn verify_integrity(&self) -> Result<()> {
        let Some(expected) = self.pinned_sha256.as_deref() else {
            return Ok(());
        };
        let actual = sha256_file_hex(&self.path)
            .map_err(|error| anyhow!("integrity hash mismatch (unable to hash file: {error:#})"))?;
        if actual != expected {
            bail!("integrity hash mismatch (expected {expected}, found {actual})");
        }
        Ok(())
    }

    fn request(&self, request: &Value) -> Result<Value> {
        self.verify_integrity()?;
        request_extension_response(&self.path, &self.name, &self.config, request)
    }
}

impl CommandHandler for ProcessExtension {
    fn run(&self, command: &str, args: &str, context: &CommandContext) -> Result<CommandOutput> {
        let response = self.request(&command_request(command, args, context))?;
        parse_command_response(&response)
    }
}

impl ToolHookHandler for ProcessExtension {
    fn evaluate(
        &self,
        hook: &str,
        call: &ToolCall,
        context: &ToolHookContext,
    ) -> Result<Option<HookVerdict>> {
        let response = self.request(&tool_hook_request(hook, call, context))?;
        parse_tool_hook_response(&response)
    }
}

impl ToolResultHandler for ProcessExtension {
    fn observe(&self, hook: &str, result: &ToolResult, context: &ToolHookContext) -> Result<()> {
        self.request(&tool_result_hook_request(hook, result, context))?;
        Ok(())
    }
}
