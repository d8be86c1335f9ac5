//! External audio tool invocation (ffmpeg / ffprobe)

use super::mixdown::PipelineError;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

/// Which pipeline step an invocation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStep {
    Probe,
    Normalize,
    Pad,
    Transcode,
    Mix,
}

impl ToolStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStep::Probe => "probe",
            ToolStep::Normalize => "normalize",
            ToolStep::Pad => "pad",
            ToolStep::Transcode => "transcode",
            ToolStep::Mix => "mix",
        }
    }
}

impl fmt::Display for ToolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single subprocess call
#[derive(Debug, Clone)]
pub struct Invocation {
    pub step: ToolStep,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(step: ToolStep, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            step,
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Output of a successful invocation
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
}

/// Runs external tools on behalf of the mixdown pipeline
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput, PipelineError>;
}

/// Runs tools as real child processes.
///
/// Children are spawned with `kill_on_drop`, so a timed-out or cancelled
/// invocation never leaves a stray ffmpeg behind.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl ToolRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput, PipelineError> {
        debug!(
            "Running {} ({}): {}",
            invocation.program,
            invocation.step,
            invocation.args.join(" ")
        );

        let child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => PipelineError::ToolMissing(invocation.program.clone()),
                _ => PipelineError::Io(e),
            })?;

        let output = match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(PipelineError::Timeout {
                    step: invocation.step,
                    seconds: invocation.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PipelineError::ProcessFailed {
                step: invocation.step,
                code: output.status.code(),
                stderr: if stderr.is_empty() {
                    "Unknown error".to_string()
                } else {
                    stderr
                },
            });
        }

        Ok(ToolOutput {
            stdout: output.stdout,
        })
    }
}

/// Check whether a tool binary can be found on PATH
pub fn tool_available(program: &str) -> bool {
    which::which(program).is_ok()
}
