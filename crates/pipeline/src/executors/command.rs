//! Stage executor backed by an external command.
//!
//! The command is spawned once per stage. It receives the serialized
//! [`StageContext`] on stdin and the stage coordinates as environment
//! variables, and must print a single JSON document to stdout. A non-zero
//! exit fails the stage with the tail of stderr as the reason.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use forge_core::executor::{StageContext, StageError, StageExecutor, StageOutput};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Characters of stderr kept in a failure reason.
const MAX_REASON_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_directory: None,
        }
    }

    /// Build from a whitespace-separated command line such as
    /// `"python3 stages.py --verbose"`. Returns `None` for a blank line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    async fn execute(&self, context: StageContext) -> Result<StageOutput, StageError> {
        let input = serde_json::to_vec(&context)
            .map_err(|e| StageError::InvalidOutput(format!("Cannot encode stage context: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("FORGE_JOB_ID", context.job_id.to_string())
            .env("FORGE_JOB_TYPE", context.job_type.as_str())
            .env("FORGE_STAGE", &context.stage)
            .env("FORGE_ITERATION", context.iteration.to_string())
            .env("FORGE_MAX_ITERATIONS", context.max_iterations.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The scheduler drops this future on timeout; the child goes with it.
            .kill_on_drop(true);
        if let Some(stage) = &context.autonomous_stage {
            cmd.env("FORGE_AUTONOMOUS_STAGE", stage);
        }
        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| StageError::Failed(format!("Failed to spawn '{}': {e}", self.program)))?;

        // stdout/stderr are drained while stdin is written; a command that
        // answers before reading all its input would otherwise stall on full pipes.
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));
        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // The command may exit without reading its input.
                let _ = stdin.write_all(&input).await;
            })
        });

        let status = child
            .wait()
            .await
            .map_err(|e| StageError::Failed(format!("Failed to wait for '{}': {e}", self.program)))?;
        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        tracing::debug!(
            job_id = %context.job_id,
            stage = %context.stage,
            exit_code = status.code().unwrap_or(-1),
            duration_ms = start.elapsed().as_millis() as u64,
            "Stage command exited",
        );

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let reason = tail(stderr.trim(), MAX_REASON_CHARS);
            return Err(StageError::Failed(if reason.is_empty() {
                format!(
                    "Stage '{}' exited with code {}",
                    context.stage,
                    status.code().unwrap_or(-1)
                )
            } else {
                reason.to_string()
            }));
        }

        let payload = serde_json::from_slice(trim_ascii(&stdout)).map_err(|e| {
            StageError::InvalidOutput(format!("Stage '{}' did not print JSON: {e}", context.stage))
        })?;
        Ok(StageOutput::new(payload))
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    let offset = s.char_indices().nth(skip).map_or(0, |(i, _)| i);
    &s[offset..]
}
