//! Push a rendered artifact to the router and confirm the result.
//!
//! A deployment walks `Idle → Uploaded → Verified → Applied → Confirmed`.
//! Before the upload the device's tagged routes are read once, so IPv6
//! routes the clear line cannot reach are withdrawn explicitly.
//! Any failure ends it: in `RolledBack` when the apply step failed and a
//! snapshot was taken, in `Failed` otherwise. Nothing is retried.

mod prompt;
mod ssh;

pub use prompt::{drive_session, PromptEvent, PromptRule, PromptSession, PromptTable};
pub use ssh::OpenSshTransport;

use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{MaskFormat, RenderConfig, RouterConfig};
use crate::error::RtbhError;
use crate::netset::DualStackSet;
use crate::render::{parse_routes, Artifact};

/// Operations the deployer needs from a router connection.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Copy a local file to `remote` on the device.
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), RtbhError>;

    /// Run a non-interactive command and return its output.
    async fn exec(&self, command: &str) -> Result<String, RtbhError>;

    /// Run a command that may ask questions, answering from `prompts`.
    /// `silence` bounds the wait for each piece of output.
    async fn exec_interactive(
        &self,
        command: &str,
        prompts: &PromptTable,
        silence: Duration,
    ) -> Result<String, RtbhError>;
}

/// Borrowed transports work too, so callers can inspect them afterwards.
#[async_trait]
impl<T: DeviceTransport> DeviceTransport for &T {
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), RtbhError> {
        (**self).upload(local, remote).await
    }

    async fn exec(&self, command: &str) -> Result<String, RtbhError> {
        (**self).exec(command).await
    }

    async fn exec_interactive(
        &self,
        command: &str,
        prompts: &PromptTable,
        silence: Duration,
    ) -> Result<String, RtbhError> {
        (**self).exec_interactive(command, prompts, silence).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Idle,
    Uploaded,
    Verified,
    Applied,
    Confirmed,
    RolledBack,
    Failed,
}

impl DeploymentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Uploaded => "uploaded",
            Self::Verified => "verified",
            Self::Applied => "applied",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Final state of one deployment and the error that ended it, if any.
#[derive(Debug)]
pub struct DeployOutcome {
    pub state: DeploymentState,
    pub error: Option<RtbhError>,
    /// Every state entered, in order, starting with `Idle`
    pub history: Vec<DeploymentState>,
}

impl DeployOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.state == DeploymentState::Confirmed
    }
}

fn snapshot_command(snapshot: &str) -> String {
    format!("copy running-config {}", snapshot)
}

fn apply_command(staging: &str) -> String {
    format!("copy {} running-config", staging)
}

fn rollback_command(snapshot: &str) -> String {
    format!("configure replace {} force", snapshot)
}

fn verify_command(staging: &str) -> String {
    format!("more {}", staging)
}

fn readback_command(template: &RenderConfig) -> String {
    format!("show running-config | include {}", template.route_suffix())
}

/// Compare file contents the way the device returns them: line endings
/// and trailing whitespace may differ, blank lines are dropped.
fn same_content(device: &str, sent: &str) -> bool {
    let normalize = |text: &str| -> Vec<String> {
        text.lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    };
    normalize(device) == normalize(sent)
}

/// Tagged IPv6 routes on the device that are not part of `intended`.
fn stale_ipv6(intended: &DualStackSet, device: &[IpNet]) -> Vec<IpNet> {
    let want: BTreeSet<&IpNet> = intended.v6().iter().collect();
    let stale: BTreeSet<IpNet> = device
        .iter()
        .filter(|net| matches!(net, IpNet::V6(_)) && !want.contains(net))
        .copied()
        .collect();
    stale.into_iter().collect()
}

/// Write the file actually uploaded when it differs from the saved artifact.
fn write_scratch(upload: &Artifact, local_path: &Path) -> std::io::Result<NamedTempFile> {
    let dir = match local_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut file = tempfile::Builder::new()
        .prefix("rtbh-upload-")
        .suffix(".txt")
        .tempfile_in(dir)?;
    file.write_all(upload.text.as_bytes())?;
    file.as_file().sync_all()?;
    Ok(file)
}

/// Differences between the routes on the device and the intended set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub missing: Vec<IpNet>,
    pub extra: Vec<IpNet>,
}

impl RouteDiff {
    pub fn compute(intended: &DualStackSet, device: &[IpNet]) -> Self {
        let want: BTreeSet<IpNet> = intended.iter().copied().collect();
        let have: BTreeSet<IpNet> = device.iter().copied().collect();
        Self {
            missing: want.difference(&have).copied().collect(),
            extra: have.difference(&want).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

impl fmt::Display for RouteDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} missing, {} unexpected", self.missing.len(), self.extra.len())?;
        if let Some(net) = self.missing.first() {
            write!(f, " (first missing {})", net)?;
        }
        if let Some(net) = self.extra.first() {
            write!(f, " (first unexpected {})", net)?;
        }
        Ok(())
    }
}

/// Drives one deployment over a [`DeviceTransport`].
pub struct Deployer<T: DeviceTransport> {
    transport: T,
    router: RouterConfig,
    template: RenderConfig,
    state: DeploymentState,
    history: Vec<DeploymentState>,
}

impl<T: DeviceTransport> Deployer<T> {
    pub fn new(transport: T, router: &RouterConfig, template: &RenderConfig) -> Self {
        Self {
            transport,
            router: router.clone(),
            template: template.clone(),
            state: DeploymentState::Idle,
            history: vec![DeploymentState::Idle],
        }
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    fn advance(&mut self, next: DeploymentState) {
        info!("Deployment to {}: {} -> {}", self.router.host, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    fn finish(mut self, state: DeploymentState, err: Option<RtbhError>) -> DeployOutcome {
        if self.state != state {
            self.advance(state);
        }
        DeployOutcome {
            state,
            error: err,
            history: self.history,
        }
    }

    fn fail(self, err: RtbhError) -> DeployOutcome {
        error!("Deployment to {} failed: {}", self.router.host, err);
        self.finish(DeploymentState::Failed, Some(err))
    }

    /// Run `fut` with a hard limit; overrunning counts as a device failure.
    async fn bounded<R, F>(&self, operation: &str, limit: Duration, fut: F) -> Result<R, RtbhError>
    where
        F: Future<Output = Result<R, RtbhError>>,
    {
        debug!("{} (limit {:?})", operation, limit);
        match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RtbhError::Timeout {
                operation: operation.to_string(),
                secs: limit.as_secs(),
            }),
        }
    }

    /// Upload `artifact` (already written to `local_path`), apply it and
    /// confirm the device now carries exactly `intended`.
    pub async fn deploy(mut self, artifact: &Artifact, local_path: &Path, intended: &DualStackSet) -> DeployOutcome {
        let timeouts = self.router.timeouts.clone();
        let staging = self.router.staging_path.clone();
        let snapshot = self.router.snapshot_path.clone();

        // The clear line leaves IPv6 routes alone: withdraw the stale ones explicitly.
        let installed = self
            .bounded("survey", timeouts.verify(), self.transport.exec(&readback_command(&self.template)))
            .await;
        let stale = match installed {
            Ok(output) => stale_ipv6(intended, &parse_routes(&output, &self.template, MaskFormat::Netmask)),
            Err(e) => return self.fail(e),
        };
        let (upload, scratch) = if stale.is_empty() {
            (artifact.clone(), None)
        } else {
            info!("Withdrawing {} stale IPv6 routes from {}", stale.len(), self.router.host);
            let upload = artifact.with_withdrawals(&stale, &self.template);
            match write_scratch(&upload, local_path) {
                Ok(file) => (upload, Some(file)),
                Err(e) => return self.fail(e.into()),
            }
        };
        let upload_path = scratch.as_ref().map_or(local_path, |f| f.path());

        // Idle -> Uploaded
        let uploaded = self
            .bounded("upload", timeouts.transfer(), self.transport.upload(upload_path, &staging))
            .await;
        if let Err(e) = uploaded {
            return self.fail(e);
        }
        self.advance(DeploymentState::Uploaded);

        // Uploaded -> Verified
        if self.router.verify_upload {
            let staged = self
                .bounded("verify", timeouts.verify(), self.transport.exec(&verify_command(&staging)))
                .await;
            match staged {
                Ok(content) if same_content(&content, &upload.text) => {}
                Ok(_) => {
                    return self.fail(RtbhError::VerificationMismatch(format!(
                        "staged copy of {} differs from the artifact sent",
                        staging
                    )))
                }
                Err(e) => return self.fail(e),
            }
        } else {
            debug!("Upload verification disabled");
        }
        self.advance(DeploymentState::Verified);

        // Verified -> Applied
        let has_snapshot = if self.router.profile.supports_rollback() {
            let saved = self
                .bounded(
                    "snapshot",
                    timeouts.apply(),
                    self.transport.exec_interactive(
                        &snapshot_command(&snapshot),
                        &PromptTable::save_snapshot(),
                        timeouts.prompt(),
                    ),
                )
                .await;
            if let Err(e) = saved {
                return self.fail(e);
            }
            true
        } else {
            warn!("Device profile {:?} cannot roll back; a failed apply needs manual repair", self.router.profile);
            false
        };

        let applied = self
            .bounded(
                "apply",
                timeouts.apply(),
                self.transport.exec_interactive(
                    &apply_command(&staging),
                    &PromptTable::copy_to_running_config(),
                    timeouts.prompt(),
                ),
            )
            .await;
        if let Err(e) = applied {
            return if has_snapshot {
                self.rollback(e, &snapshot).await
            } else {
                self.fail(e)
            };
        }
        self.advance(DeploymentState::Applied);

        // Applied -> Confirmed
        let shown = self
            .bounded("confirm", timeouts.verify(), self.transport.exec(&readback_command(&self.template)))
            .await;
        let device_routes = match shown {
            Ok(output) => parse_routes(&output, &self.template, MaskFormat::Netmask),
            Err(e) => return self.fail(e),
        };
        let diff = RouteDiff::compute(intended, &device_routes);
        if !diff.is_empty() {
            return self.fail(RtbhError::VerificationMismatch(format!(
                "device routes differ from intended set: {}",
                diff
            )));
        }

        info!(
            "Deployment to {} confirmed: {} routes (sha256 {})",
            self.router.host,
            artifact.route_count,
            &artifact.sha256[..12]
        );
        self.finish(DeploymentState::Confirmed, None)
    }

    async fn rollback(self, cause: RtbhError, snapshot: &str) -> DeployOutcome {
        error!("Apply failed on {}: {}; restoring {}", self.router.host, cause, snapshot);
        let timeouts = self.router.timeouts.clone();
        let restored = self
            .bounded(
                "rollback",
                timeouts.apply(),
                self.transport.exec_interactive(
                    &rollback_command(snapshot),
                    &PromptTable::configure_replace(),
                    timeouts.prompt(),
                ),
            )
            .await;
        match restored {
            Ok(_) => {
                warn!("Configuration of {} restored from {}", self.router.host, snapshot);
                self.finish(DeploymentState::RolledBack, Some(cause))
            }
            Err(e) => {
                error!("Rollback of {} failed: {}; manual intervention required", self.router.host, e);
                self.finish(DeploymentState::Failed, Some(cause))
            }
        }
    }
}
