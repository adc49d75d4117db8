//! Device transport over the system OpenSSH client.
//!
//! Password authentication goes through `sshpass -e`, which reads the
//! secret from `SSHPASS` instead of the command line.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::prompt::{drive_session, PromptTable};
use super::DeviceTransport;
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, CommandOutput, RealCommandExecutor};
use crate::config::RouterConfig;
use crate::error::RtbhError;
use crate::utils::truncate;

const SSHPASS_ENV: &str = "SSHPASS";
/// sshpass exit status for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;

pub struct OpenSshTransport<E: CommandExecutor = RealCommandExecutor> {
    router: RouterConfig,
    executor: E,
}

impl OpenSshTransport<RealCommandExecutor> {
    pub fn new(router: &RouterConfig) -> Self {
        Self::with_executor(router, RealCommandExecutor::new())
    }
}

impl<E: CommandExecutor> OpenSshTransport<E> {
    pub fn with_executor(router: &RouterConfig, executor: E) -> Self {
        Self {
            router: router.clone(),
            executor,
        }
    }

    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", self.router.host_key_checking),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.router.timeouts.connect_secs),
        ];
        if let Some(ref key) = self.router.key_file {
            opts.push("-i".to_string());
            opts.push(key.display().to_string());
            opts.extend(args_to_strings(&["-o", "BatchMode=yes"]));
        }
        opts
    }

    /// Prefix `program` with sshpass when no key file is configured.
    fn wrap(&self, program: &str, args: Vec<String>) -> (String, Vec<String>, Vec<(String, String)>) {
        if self.router.key_file.is_some() {
            return (program.to_string(), args, Vec::new());
        }
        let mut wrapped = args_to_strings(&["-e", program]);
        wrapped.extend(args);
        let envs = vec![(
            SSHPASS_ENV.to_string(),
            self.router.get_password().as_str().to_string(),
        )];
        ("sshpass".to_string(), wrapped, envs)
    }

    fn ssh_args(&self, extra: &[&str], command: &str) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.router.port.to_string()];
        args.extend(self.common_options());
        args.extend(args_to_strings(extra));
        args.push(self.router.destination());
        args.push(command.to_string());
        args
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<CommandOutput, RtbhError> {
        let (cmd, args, envs) = self.wrap(program, args);
        debug!("Running {} {}", cmd, args.join(" "));
        let output = self
            .executor
            .execute(&cmd, &args, &envs)
            .await
            .map_err(|e| RtbhError::Transfer(format!("cannot run {}: {:#}", cmd, e)))?;
        if output.success {
            Ok(output)
        } else {
            Err(classify_failure(program, &output))
        }
    }
}

/// Map a failed ssh/scp run onto the error taxonomy.
fn classify_failure(program: &str, output: &CommandOutput) -> RtbhError {
    let stderr = output.stderr.trim();
    if output.code == Some(SSHPASS_BAD_PASSWORD) || stderr.contains("Permission denied") {
        return RtbhError::Auth(truncate(stderr, 200));
    }
    RtbhError::Transfer(format!(
        "{} exited with {}: {}",
        program,
        output
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string()),
        truncate(stderr, 200)
    ))
}

#[async_trait]
impl<E: CommandExecutor> DeviceTransport for OpenSshTransport<E> {
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), RtbhError> {
        // IOS speaks the legacy scp protocol only (-O).
        let mut args = args_to_strings(&["-O", "-P"]);
        args.push(self.router.port.to_string());
        args.extend(self.common_options());
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.router.destination(), remote));
        self.run("scp", args).await?;
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<String, RtbhError> {
        let output = self.run("ssh", self.ssh_args(&[], command)).await?;
        Ok(output.stdout)
    }

    async fn exec_interactive(
        &self,
        command: &str,
        prompts: &PromptTable,
        silence: Duration,
    ) -> Result<String, RtbhError> {
        // A forced tty makes IOS ask its questions on the channel.
        let (cmd, args, envs) = self.wrap("ssh", self.ssh_args(&["-tt"], command));
        debug!("Running {} {} (interactive)", cmd, args.join(" "));

        let mut child = Command::new(&cmd)
            .args(&args)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RtbhError::Transfer(format!("cannot run {}: {}", cmd, e)))?;

        let (mut stdout, mut stdin) = match (child.stdout.take(), child.stdin.take()) {
            (Some(out), Some(inp)) => (out, inp),
            _ => return Err(RtbhError::Transfer("ssh stdio not captured".to_string())),
        };

        let result = drive_session(&mut stdout, &mut stdin, prompts, silence, command).await;
        drop(stdin);

        match result {
            Ok(transcript) => {
                let _ = child.kill().await;
                Ok(transcript)
            }
            Err(e) => {
                // A closed channel without completion is usually an ssh-level
                // failure; prefer ssh's own diagnosis when it has one.
                let _ = child.kill().await;
                let output = child.wait_with_output().await?;
                if !output.status.success() && !output.stderr.is_empty() {
                    let failed = CommandOutput {
                        stdout: String::new(),
                        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                        success: false,
                        code: output.status.code(),
                    };
                    if let err @ RtbhError::Auth(_) = classify_failure("ssh", &failed) {
                        return Err(err);
                    }
                }
                Err(e)
            }
        }
    }
}
