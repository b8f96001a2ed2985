//! PowerShell command execution.
//!
//! Firewall management shells out to PowerShell. The [`ShellRunner`] trait is
//! the seam between the firewall manager and the host so tests can record
//! commands instead of running them.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("no PowerShell executable found (tried {0})")]
    NotInstalled(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("command cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Output of a successful command.
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a single command line.
#[async_trait]
pub trait ShellRunner: Send + Sync {
    /// Run `command` to completion. A non-zero exit is an error carrying the
    /// command's stderr. Cancelling `cancel` kills the shell.
    async fn execute(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, ShellError>;
}

/// Production runner: `powershell.exe`, falling back to `pwsh`.
#[derive(Debug, Clone)]
pub struct PowerShell {
    candidates: Vec<String>,
    flags: Vec<String>,
}

impl Default for PowerShell {
    fn default() -> Self {
        Self {
            candidates: vec!["powershell.exe".to_string(), "pwsh".to_string()],
            flags: ["-NoLogo", "-NonInteractive", "-WindowStyle", "Hidden", "-Command"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PowerShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use other executables, tried in order, each invoked as
    /// `<program> <flags...> <command>`.
    pub fn with_program(candidates: Vec<String>, flags: Vec<String>) -> Self {
        Self { candidates, flags }
    }

    fn spawn(&self, command: &str) -> Result<tokio::process::Child, ShellError> {
        for program in &self.candidates {
            let mut cmd = tokio::process::Command::new(program);
            cmd.args(&self.flags)
                .arg(command)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            match cmd.spawn() {
                Ok(child) => return Ok(child),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{program} not found, trying next shell");
                }
                Err(source) => {
                    return Err(ShellError::Spawn {
                        program: program.clone(),
                        source,
                    });
                }
            }
        }
        Err(ShellError::NotInstalled(self.candidates.join(", ")))
    }
}

#[async_trait]
impl ShellRunner for PowerShell {
    async fn execute(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, ShellError> {
        debug!("[Shell] {command}");
        let mut child = self.spawn(command)?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                let status = status?;
                let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                if status.success() {
                    Ok(ShellOutput { stdout, stderr })
                } else {
                    Err(ShellError::Failed {
                        status: status.to_string(),
                        stderr,
                    })
                }
            } => result,
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(ShellError::Cancelled)
            }
        }
    }
}
