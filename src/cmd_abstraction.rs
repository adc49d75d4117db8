//! Command execution abstraction for testability.
//!
//! The OpenSSH transport shells out to `ssh`, `scp` and `sshpass`; going
//! through this trait lets unit tests script those calls without a router.

use anyhow::Result;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

/// Runs external programs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute `cmd` with `args` and extra environment variables.
    ///
    /// Secrets travel through `envs` (e.g. `SSHPASS`) so that they never
    /// show up in the process list.
    async fn execute(&self, cmd: &str, args: &[String], envs: &[(String, String)]) -> Result<CommandOutput>;
}

/// Real implementation that spawns processes.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for RealCommandExecutor {
    async fn execute(&self, cmd: &str, args: &[String], envs: &[(String, String)]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Convert a slice of &str to Vec<String>.
///
/// mockall has trouble with the lifetimes in `&[&str]`, so the trait takes
/// `&[String]`.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
