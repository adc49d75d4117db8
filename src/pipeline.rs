//! One complete run: fetch, aggregate, exclude, render, deploy.
//!
//! Stages hand immutable values to each other. Everything up to the
//! rendered artifact happens without touching the router; an error there
//! ends the run before any device I/O.

use anyhow::{Context, Result};
use ipnet::IpNet;
use std::fmt;
use tracing::{info, warn};

use crate::aggregator::{aggregate, Aggregation, SourceBlob};
use crate::config::Config;
use crate::deployer::{Deployer, DeploymentState, DeviceTransport};
use crate::error::{exit_code_for, RtbhError, EXIT_DEPLOY_FAILED, EXIT_NO_CHANGES, EXIT_OK};
use crate::exclusion::{apply_exclusions, ExclusionSet};
use crate::fetcher::{load_local_entries, Fetcher};
use crate::lock::LockGuard;
use crate::netset::DualStackSet;
use crate::render::{render, Artifact};
use crate::state::DeployRecord;
use crate::utils::{format_count, truncate};

/// Parse errors logged individually before the rest are only counted.
const MAX_LOGGED_PARSE_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct PushOptions {
    /// Render the artifact but do not contact the device
    pub dry_run: bool,
    /// Deploy even when the artifact matches the last confirmed one
    pub force: bool,
}

/// How far a run got.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stopped before an artifact existed
    #[default]
    Incomplete,
    DryRun,
    NoChanges,
    Deployment(DeploymentState),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Incomplete => f.write_str("pipeline failed"),
            RunOutcome::DryRun => f.write_str("dry run, device not contacted"),
            RunOutcome::NoChanges => f.write_str("no changes to apply"),
            RunOutcome::Deployment(state) => write!(f, "deployment {}", state),
        }
    }
}

impl RunOutcome {
    /// Exit code a deployment that did not confirm imposes on the run.
    pub fn deployment_exit_code(&self) -> Option<i32> {
        match self {
            RunOutcome::Deployment(DeploymentState::Confirmed) => None,
            RunOutcome::Deployment(_) => Some(EXIT_DEPLOY_FAILED),
            _ => None,
        }
    }
}

/// Exit code for a run that ended in `err`.
///
/// Once the device was contacted the deployment state decides, whatever
/// kind of error stopped it.
pub fn failure_exit_code(summary: &RunSummary, err: &anyhow::Error) -> i32 {
    summary
        .outcome
        .deployment_exit_code()
        .unwrap_or_else(|| exit_code_for(err))
}

/// Report printed at the end of every run, whether it succeeded or not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sources_configured: usize,
    pub sources_fetched: usize,
    pub failed_sources: Vec<String>,
    pub empty_sources: Vec<String>,
    pub local_files: usize,
    pub parse_errors: usize,
    pub aggregate_blocks: usize,
    pub exclusion_blocks: usize,
    pub final_blocks: usize,
    pub artifact_sha256: Option<String>,
    pub outcome: RunOutcome,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Sources:     {}/{} fetched, {} local files",
            self.sources_fetched, self.sources_configured, self.local_files
        )?;
        if !self.failed_sources.is_empty() {
            writeln!(f, "  failed:    {}", self.failed_sources.join(", "))?;
        }
        if !self.empty_sources.is_empty() {
            writeln!(f, "  empty:     {}", self.empty_sources.join(", "))?;
        }
        writeln!(f, "Parse errors: {}", self.parse_errors)?;
        writeln!(
            f,
            "Networks:    {} aggregated, {} exclusions, {} final",
            format_count(self.aggregate_blocks),
            self.exclusion_blocks,
            format_count(self.final_blocks)
        )?;
        if let Some(ref sha) = self.artifact_sha256 {
            writeln!(f, "Artifact:    sha256 {}", sha)?;
        }
        write!(f, "Result:      {}", self.outcome)
    }
}

/// Everything computed before the device is contacted.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub aggregation: Aggregation,
    pub exclusions: ExclusionSet,
    pub final_set: DualStackSet,
    pub artifact: Artifact,
}

/// Fetch every enabled source and read local entry files.
async fn collect_sources(
    config: &Config,
    fetcher: &Fetcher,
    summary: &mut RunSummary,
) -> Result<Vec<SourceBlob>> {
    let enabled = config.enabled_sources();
    summary.sources_configured = enabled.len();

    let mut blobs = Vec::with_capacity(enabled.len());
    for result in fetcher.fetch_sources(&enabled).await {
        match result {
            Ok(blob) => blobs.push(blob),
            Err(e) => {
                warn!("{}", e);
                let id = match e {
                    RtbhError::Fetch { source_id, .. } => source_id,
                    _ => "unknown".to_string(),
                };
                summary.failed_sources.push(id);
            }
        }
    }
    summary.failed_sources.sort();
    summary.sources_fetched = blobs.len();

    if !enabled.is_empty() && blobs.is_empty() {
        anyhow::bail!("No source could be fetched");
    }

    let local = load_local_entries(&config.local_dir, &config.local_suffix)?;
    summary.local_files = local.len();
    blobs.extend(local);
    Ok(blobs)
}

/// Run every stage up to the rendered artifact.
pub async fn prepare(config: &Config, fetcher: &Fetcher, summary: &mut RunSummary) -> Result<Prepared> {
    // Exclusions first: a broken trust list must stop the run before any download.
    let exclusions = ExclusionSet::load(config)?;
    summary.exclusion_blocks = exclusions.len();

    let blobs = collect_sources(config, fetcher, summary).await?;
    let inline: Vec<IpNet> = config.local_entry_blocks()?;

    let aggregation = aggregate(&blobs, &inline)?;
    summary.parse_errors = aggregation.parse_errors.len();
    summary.empty_sources = aggregation.empty_sources().map(|s| s.id.clone()).collect();
    summary.aggregate_blocks = aggregation.set.len();

    for err in aggregation.parse_errors.iter().take(MAX_LOGGED_PARSE_ERRORS) {
        warn!("Skipping line {}:{}: '{}'", err.source_id, err.line, truncate(&err.text, 60));
    }
    if aggregation.parse_errors.len() > MAX_LOGGED_PARSE_ERRORS {
        warn!(
            "... and {} more unparsable lines",
            aggregation.parse_errors.len() - MAX_LOGGED_PARSE_ERRORS
        );
    }

    if aggregation.set.is_empty() {
        anyhow::bail!("No valid network found in any source");
    }

    let final_set = apply_exclusions(&aggregation.set, &exclusions)?;
    summary.final_blocks = final_set.len();
    if final_set.is_empty() {
        // Pushing an empty set would clear every black-hole route on the device.
        anyhow::bail!("Nothing left to block after exclusions");
    }
    info!(
        "Final set: {} blocks ({} IPv4, {} IPv6)",
        format_count(final_set.len()),
        final_set.v4().len(),
        final_set.v6().len()
    );

    let artifact = Artifact::from_commands(&render(&final_set, &config.render));
    summary.artifact_sha256 = Some(artifact.sha256.clone());

    Ok(Prepared {
        aggregation,
        exclusions,
        final_set,
        artifact,
    })
}

/// Full push: prepare, then (unless dry run or unchanged) deploy over
/// `transport`. Returns the process exit code for non-error endings.
pub async fn push<T: DeviceTransport>(
    config: &Config,
    options: PushOptions,
    fetcher: &Fetcher,
    transport: T,
    summary: &mut RunSummary,
) -> Result<i32> {
    let prepared = prepare(config, fetcher, summary).await?;
    let artifact_path = &config.output.artifact;

    let deployer = Deployer::new(transport, &config.router, &config.render);

    if options.dry_run {
        prepared.artifact.write_to(artifact_path)?;
        info!(
            "Dry run: artifact written to {:?}, deployer left {}",
            artifact_path,
            deployer.state()
        );
        summary.outcome = RunOutcome::DryRun;
        return Ok(EXIT_OK);
    }

    let device = config.router.host.as_str();
    let _lock = LockGuard::acquire(&config.output.lock_dir, device)?;
    prepared.artifact.write_to(artifact_path)?;

    let state_file = &config.output.state_file;
    let mut record = DeployRecord::load(state_file).unwrap_or_else(|e| {
        warn!("Ignoring unreadable state: {:#}", e);
        DeployRecord::default()
    });

    if !options.force && record.is_unchanged(device, &prepared.artifact.sha256) {
        info!("Artifact matches the last confirmed deployment to {}", device);
        summary.outcome = RunOutcome::NoChanges;
        return Ok(EXIT_NO_CHANGES);
    }

    let outcome = deployer
        .deploy(&prepared.artifact, artifact_path, &prepared.final_set)
        .await;
    summary.outcome = RunOutcome::Deployment(outcome.state);

    match outcome.error {
        None => {
            record.record(
                device,
                &prepared.artifact.sha256,
                prepared.artifact.route_count,
                &prepared.aggregation.summaries,
            );
            record
                .save(state_file)
                .with_context(|| format!("Deployment confirmed but state not saved to {:?}", state_file))?;
            Ok(EXIT_OK)
        }
        Some(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::deployer::PromptTable;
    use crate::error::RtbhError;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Records every call. Reads see no tagged routes, uploads fail.
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<String>>,
        /// Upload fails with this I/O error instead of an auth refusal
        upload_io_error: Option<std::io::ErrorKind>,
    }

    impl RecordingTransport {
        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl DeviceTransport for RecordingTransport {
        async fn upload(&self, _local: &Path, remote: &str) -> Result<(), RtbhError> {
            self.calls.lock().unwrap().push(format!("upload {}", remote));
            match self.upload_io_error {
                Some(kind) => Err(std::io::Error::from(kind).into()),
                None => Err(RtbhError::Auth("Permission denied".to_string())),
            }
        }
        async fn exec(&self, command: &str) -> Result<String, RtbhError> {
            self.calls.lock().unwrap().push(command.to_string());
            Ok(String::new())
        }
        async fn exec_interactive(
            &self,
            command: &str,
            _prompts: &PromptTable,
            _silence: Duration,
        ) -> Result<String, RtbhError> {
            self.calls.lock().unwrap().push(command.to_string());
            Err(RtbhError::Transfer("unexpected".to_string()))
        }
    }

    struct Workspace {
        dir: TempDir,
        config: Config,
    }

    impl Workspace {
        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    fn workspace(lists: &[(&str, &str)], exclusions: &[&str]) -> Workspace {
        let dir = tempfile::tempdir().unwrap();
        let mut sources = Vec::new();
        for (name, content) in lists {
            let path = dir.path().join(format!("{}.txt", name));
            std::fs::write(&path, content).unwrap();
            sources.push(SourceConfig::file(name, path));
        }
        let mut config = Config {
            sources,
            exclusions: exclusions.iter().map(|s| s.to_string()).collect(),
            local_dir: dir.path().join("local"),
            ..Default::default()
        };
        config.router.host = "edge1".to_string();
        config.router.username = "rtbh".to_string();
        config.output.artifact = dir.path().join("out/rtbh_commands.txt");
        config.output.state_file = dir.path().join("state/state.json");
        config.output.lock_dir = dir.path().join("lock");
        Workspace { dir, config }
    }

    fn fetcher() -> Fetcher {
        Fetcher::new().unwrap().with_retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_dry_run_writes_artifact_without_device_io() {
        let ws = workspace(
            &[("a", "10.0.0.0/24\n10.0.0.128/25\n"), ("b", "5.6.7.8\n")],
            &[],
        );
        let transport = RecordingTransport::default();
        let mut summary = RunSummary::default();
        let options = PushOptions {
            dry_run: true,
            force: false,
        };

        let code = push(&ws.config, options, &fetcher(), &transport, &mut summary)
            .await
            .unwrap();

        assert_eq!(code, EXIT_OK);
        assert_eq!(transport.count(), 0);
        assert_eq!(summary.outcome, RunOutcome::DryRun);
        let text = std::fs::read_to_string(ws.path("out/rtbh_commands.txt")).unwrap();
        assert_eq!(
            text,
            "no ip route * Null0 tag 66\n\
             ip route 5.6.7.8 255.255.255.255 Null0 tag 66\n\
             ip route 10.0.0.0 255.255.255.0 Null0 tag 66\n\
             end\n"
        );
        assert_eq!(summary.sources_fetched, 2);
        assert_eq!(summary.final_blocks, 2);
    }

    #[tokio::test]
    async fn test_local_entries_and_exclusions_applied() {
        let mut ws = workspace(&[("feed", "1.2.3.0/24\n# note\nbogus\n")], &["1.2.3.128/25"]);
        std::fs::create_dir(ws.path("local")).unwrap();
        std::fs::write(ws.path("local/extra.myset"), "198.51.100.0/24\n").unwrap();
        ws.config.local_entries = vec!["203.0.113.9".to_string()];

        let mut summary = RunSummary::default();
        let prepared = prepare(&ws.config, &fetcher(), &mut summary).await.unwrap();
        let blocks: Vec<String> = prepared.final_set.iter().map(|n| n.to_string()).collect();
        assert_eq!(blocks, vec!["1.2.3.0/25", "198.51.100.0/24", "203.0.113.9/32"]);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.local_files, 1);
        assert_eq!(summary.exclusion_blocks, 1);
    }

    #[tokio::test]
    async fn test_failed_source_is_reported_not_fatal() {
        let mut ws = workspace(&[("good", "192.0.2.0/24\n")], &[]);
        ws.config
            .sources
            .push(SourceConfig::file("gone", "/nonexistent/rtbh/gone.txt"));

        let mut summary = RunSummary::default();
        prepare(&ws.config, &fetcher(), &mut summary).await.unwrap();
        assert_eq!(summary.sources_configured, 2);
        assert_eq!(summary.sources_fetched, 1);
        assert_eq!(summary.failed_sources, vec!["gone".to_string()]);
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_fatal() {
        let mut ws = workspace(&[], &[]);
        ws.config.sources = vec![SourceConfig::file("gone", "/nonexistent/rtbh/gone.txt")];
        let mut summary = RunSummary::default();
        assert!(prepare(&ws.config, &fetcher(), &mut summary).await.is_err());
        assert_eq!(summary.outcome, RunOutcome::Incomplete);
    }

    #[tokio::test]
    async fn test_no_valid_network_is_fatal() {
        let ws = workspace(&[("junk", "# only comments\nnot-an-ip\n")], &[]);
        let mut summary = RunSummary::default();
        let err = prepare(&ws.config, &fetcher(), &mut summary).await.unwrap_err();
        assert!(err.to_string().contains("No valid network"));
        assert_eq!(summary.empty_sources, vec!["junk".to_string()]);
    }

    #[tokio::test]
    async fn test_everything_excluded_is_fatal() {
        let ws = workspace(&[("a", "10.1.0.0/16\n")], &["10.0.0.0/8"]);
        let mut summary = RunSummary::default();
        let err = prepare(&ws.config, &fetcher(), &mut summary).await.unwrap_err();
        assert!(err.to_string().contains("after exclusions"));
    }

    #[tokio::test]
    async fn test_bad_exclusion_stops_before_fetch() {
        let ws = workspace(&[("a", "10.1.0.0/16\n")], &["10.0.0.0/40"]);
        let mut summary = RunSummary::default();
        let err = prepare(&ws.config, &fetcher(), &mut summary).await.unwrap_err();
        assert!(err.downcast_ref::<RtbhError>().is_some());
        assert_eq!(summary.sources_fetched, 0);
    }

    #[tokio::test]
    async fn test_unchanged_artifact_skips_device() {
        let ws = workspace(&[("a", "10.1.0.0/16\n")], &[]);
        let mut summary = RunSummary::default();
        let prepared = prepare(&ws.config, &fetcher(), &mut summary).await.unwrap();
        let mut record = DeployRecord::default();
        record.record("edge1", &prepared.artifact.sha256, 1, &[]);
        record.save(&ws.config.output.state_file).unwrap();

        let transport = RecordingTransport::default();
        let mut summary = RunSummary::default();
        let code = push(&ws.config, PushOptions::default(), &fetcher(), &transport, &mut summary)
            .await
            .unwrap();
        assert_eq!(code, EXIT_NO_CHANGES);
        assert_eq!(summary.outcome, RunOutcome::NoChanges);
        assert_eq!(transport.count(), 0);
    }

    #[tokio::test]
    async fn test_force_deploys_unchanged_artifact() {
        let ws = workspace(&[("a", "10.1.0.0/16\n")], &[]);
        let mut summary = RunSummary::default();
        let prepared = prepare(&ws.config, &fetcher(), &mut summary).await.unwrap();
        let mut record = DeployRecord::default();
        record.record("edge1", &prepared.artifact.sha256, 1, &[]);
        record.save(&ws.config.output.state_file).unwrap();

        let transport = RecordingTransport::default();
        let mut summary = RunSummary::default();
        let options = PushOptions {
            dry_run: false,
            force: true,
        };
        let err = push(&ws.config, options, &fetcher(), &transport, &mut summary)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<RtbhError>(), Some(RtbhError::Auth(_))));
        assert_eq!(summary.outcome, RunOutcome::Deployment(DeploymentState::Failed));
        // route read-back, then the refused upload
        assert_eq!(transport.count(), 2);
        assert_eq!(failure_exit_code(&summary, &err), EXIT_DEPLOY_FAILED);
    }

    #[tokio::test]
    async fn test_io_error_during_deploy_exits_as_deploy_failure() {
        let ws = workspace(&[("a", "10.1.0.0/16
")], &[]);
        let transport = RecordingTransport {
            upload_io_error: Some(std::io::ErrorKind::BrokenPipe),
            ..Default::default()
        };
        let mut summary = RunSummary::default();
        let err = push(&ws.config, PushOptions::default(), &fetcher(), &transport, &mut summary)
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<RtbhError>(), Some(RtbhError::Io(_))));
        assert_eq!(exit_code_for(&err), crate::error::EXIT_PIPELINE_FAILURE);
        assert_eq!(summary.outcome, RunOutcome::Deployment(DeploymentState::Failed));
        assert_eq!(failure_exit_code(&summary, &err), EXIT_DEPLOY_FAILED);
    }

    #[test]
    fn test_exit_code_follows_deployment_outcome() {
        let err = anyhow::anyhow!("Connection closed by remote host");
        let mut summary = RunSummary::default();
        assert_eq!(failure_exit_code(&summary, &err), crate::error::EXIT_PIPELINE_FAILURE);

        for state in [DeploymentState::Failed, DeploymentState::RolledBack] {
            summary.outcome = RunOutcome::Deployment(state);
            assert_eq!(failure_exit_code(&summary, &err), EXIT_DEPLOY_FAILED);
        }

        // confirmed on the device, failed afterwards
        summary.outcome = RunOutcome::Deployment(DeploymentState::Confirmed);
        assert_eq!(failure_exit_code(&summary, &err), crate::error::EXIT_PIPELINE_FAILURE);
    }

    #[tokio::test]
    async fn test_lock_contention_fails_before_device() {
        let ws = workspace(&[("a", "10.1.0.0/16\n")], &[]);
        let _held = LockGuard::acquire(&ws.config.output.lock_dir, "edge1").unwrap();

        let transport = RecordingTransport::default();
        let mut summary = RunSummary::default();
        let err = push(&ws.config, PushOptions::default(), &fetcher(), &transport, &mut summary)
            .await
            .unwrap_err();
        let rtbh = err.downcast_ref::<RtbhError>().unwrap();
        assert!(matches!(rtbh, RtbhError::LockContention { .. }));
        assert_eq!(failure_exit_code(&summary, &err), crate::error::EXIT_PIPELINE_FAILURE);
        assert_eq!(transport.count(), 0);
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary {
            sources_configured: 3,
            sources_fetched: 2,
            failed_sources: vec!["spamhaus_drop".to_string()],
            final_blocks: 1500,
            outcome: RunOutcome::Deployment(DeploymentState::RolledBack),
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.contains("2/3 fetched"));
        assert!(text.contains("failed:    spamhaus_drop"));
        assert!(text.contains("1.5K final"));
        assert!(text.ends_with("deployment rolled back"));
    }
}
