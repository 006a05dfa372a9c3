//! Shell command execution tool. Adapted field-for-field from
//! `km_tools::tools::bash::BashTool`: same timeout/working-dir knobs, same
//! platform-aware shell selection and stdout/stderr capture, rewired onto
//! the crate's [`super::Tool`] trait instead of the teacher's bespoke
//! `as_tool`/`execute` pair.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::model::ToolResultContent;

use super::{Annotations, Tool, ToolError};

/// Executes a shell command and returns its combined stdout/stderr.
#[derive(Clone)]
pub struct BashTool {
    timeout_secs: u64,
    working_dir: Option<std::path::PathBuf>,
}

impl BashTool {
    pub fn new() -> Self {
        Self { timeout_secs: 30, working_dir: None }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_working_dir(mut self, dir: std::path::PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn error_context(&self, command: &str) -> String {
        let shell = if cfg!(target_os = "windows") { "powershell" } else { "sh" };
        let cwd = if let Some(dir) = &self.working_dir {
            dir.display().to_string()
        } else {
            std::env::current_dir().map(|dir| dir.display().to_string()).unwrap_or_else(|_| "(unknown)".to_string())
        };
        format!("shell={shell}\ncwd={cwd}\ncommand={command}")
    }

    fn combine_output(stdout: &str, stderr: &str) -> String {
        let mut result = String::new();
        if !stdout.is_empty() {
            result.push_str(stdout);
        }
        if !stderr.is_empty() {
            if !result.is_empty() {
                result.push_str("\n---STDERR---\n");
            }
            result.push_str(stderr);
        }
        result
    }

    /// Run a raw command string, returning its captured output or a
    /// user-facing error message including the failing command's context.
    pub async fn execute_command(&self, command: &str) -> Result<String, String> {
        if command.trim().is_empty() {
            return Err(format!("Command cannot be empty\n{}", self.error_context(command)));
        }

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("powershell");
            c.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| format!("Failed to spawn command: {e}\n{}", self.error_context(command)))?;

        let stdout = child.stdout.take().ok_or_else(|| format!("Failed to capture stdout\n{}", self.error_context(command)))?;
        let stderr = child.stderr.take().ok_or_else(|| format!("Failed to capture stderr\n{}", self.error_context(command)))?;

        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            tokio::io::BufReader::new(stdout).read_to_end(&mut buf).await.map(|_| buf).map_err(|e| e.to_string())
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            tokio::io::BufReader::new(stderr).read_to_end(&mut buf).await.map(|_| buf).map_err(|e| e.to_string())
        });

        let timeout = Duration::from_secs(self.timeout_secs);
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result.map_err(|e| format!("Command execution failed: {e}\n{}", self.error_context(command)))?,
            Err(_) => {
                let kill_result = match child.kill().await {
                    Ok(_) => "killed".to_string(),
                    Err(e) => format!("kill failed: {e}"),
                };
                let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
                let stdout_text = stdout_handle.await.ok().and_then(Result::ok).map(|b| String::from_utf8_lossy(&b).to_string()).unwrap_or_default();
                let stderr_text = stderr_handle.await.ok().and_then(Result::ok).map(|b| String::from_utf8_lossy(&b).to_string()).unwrap_or_default();
                let output = Self::combine_output(&stdout_text, &stderr_text);
                return Err(format!(
                    "Command timed out after {} seconds (kill: {kill_result})\n{}\n{}",
                    self.timeout_secs,
                    if output.is_empty() { "(no output)".to_string() } else { output },
                    self.error_context(command)
                ));
            }
        };

        let stdout_bytes = stdout_handle.await.map_err(|e| format!("Failed to join stdout reader: {e}"))?.map_err(|e| format!("Failed to read stdout: {e}"))?;
        let stderr_bytes = stderr_handle.await.map_err(|e| format!("Failed to join stderr reader: {e}"))?.map_err(|e| format!("Failed to read stderr: {e}"))?;

        let stdout = String::from_utf8_lossy(&stdout_bytes);
        let stderr = String::from_utf8_lossy(&stderr_bytes);
        let result = Self::combine_output(&stdout, &stderr);

        if status.success() {
            Ok(if result.is_empty() { "(Command completed successfully with no output)".to_string() } else { result })
        } else {
            let exit_code = status.code().unwrap_or(-1);
            Err(format!(
                "Command failed with exit code {exit_code}\n{}\n{}",
                if result.is_empty() { "(no output)".to_string() } else { result },
                self.error_context(command)
            ))
        }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its combined stdout/stderr output."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command to execute." }
            },
            "required": ["command"]
        })
    }

    fn annotations(&self) -> Annotations {
        Annotations { read_only: false, destructive: true, idempotent: false, open_world: true }
    }

    async fn call(&self, input: Value) -> Result<ToolResultContent, ToolError> {
        let command = input
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::CallFailed { name: self.name().to_string(), message: "missing 'command' argument".into() })?;
        self.execute_command(command)
            .await
            .map(ToolResultContent::text)
            .map_err(|message| ToolError::CallFailed { name: self.name().to_string(), message })
    }
}
