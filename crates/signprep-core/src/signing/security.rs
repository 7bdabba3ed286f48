//! Seam to the macOS `security` command line tool.
//!
//! Every keychain primitive is a `security` subcommand. Going through a
//! trait object lets the keychain logic run against a scripted fake on
//! machines without a login keychain.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{Result, SignprepError};

/// Captured result of one `security` invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turns a failed invocation into a keychain error naming the action.
    pub fn check(self, action: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(SignprepError::Keychain(format!(
                "Failed to {}: {}",
                action,
                self.stderr.trim()
            )))
        }
    }
}

/// Runs `security` subcommands.
#[async_trait]
pub trait SecurityTool: Send + Sync + std::fmt::Debug {
    /// Runs `security <args...>` to completion.
    ///
    /// Returns `Err` only when the process could not be run at all; a
    /// non-zero exit is reported through [`CommandOutput::success`].
    async fn run(&self, args: &[&str]) -> Result<CommandOutput>;
}

/// The real `security` binary.
#[derive(Debug, Clone)]
pub struct SecurityCli {
    program: PathBuf,
}

impl SecurityCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SecurityCli {
    fn default() -> Self {
        Self::new("/usr/bin/security")
    }
}

#[async_trait]
impl SecurityTool for SecurityCli {
    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let subcommand = args.first().copied().unwrap_or_default();
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                SignprepError::Keychain(format!(
                    "Failed to run {} {}: {}",
                    self.program.display(),
                    subcommand,
                    e
                ))
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Converts a path into an argument for the `security` tool.
pub(crate) fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        SignprepError::InvalidInput(format!("Path is not valid UTF-8: {}", path.display()))
    })
}
