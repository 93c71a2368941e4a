//! RDS instance snapshots. Nothing is written locally; the snapshot lives in AWS.

use super::{Artifact, BackupTarget, RestoreResult, TargetContext};
use crate::descriptor::TargetKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_sdk_rds::error::DisplayErrorContext;
use aws_sdk_rds::types::Tag;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub const AVAILABLE: &str = "available";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub id: String,
    pub status: Option<String>,
}

#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// Starts a snapshot of `instance`. [`Error::NotFound`] if the instance
    /// doesn't exist.
    async fn create_snapshot(&self, instance: &str, snapshot_id: &str) -> Result<SnapshotHandle>;

    async fn snapshot_status(&self, snapshot_id: &str) -> Result<String>;
}

pub struct AwsRdsApi {
    client: aws_sdk_rds::Client,
}

impl AwsRdsApi {
    pub async fn new(region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_sdk_rds::config::Region::new(region.to_string()));
        }
        Self {
            client: aws_sdk_rds::Client::new(&loader.load().await),
        }
    }
}

#[async_trait]
impl SnapshotApi for AwsRdsApi {
    async fn create_snapshot(&self, instance: &str, snapshot_id: &str) -> Result<SnapshotHandle> {
        info!("creating RDS snapshot {:?} from instance: {}", snapshot_id, instance);
        let response = self
            .client
            .create_db_snapshot()
            .db_instance_identifier(instance)
            .db_snapshot_identifier(snapshot_id)
            .tags(Tag::builder().key("author").value("stash-backup").build())
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_db_instance_not_found_fault())
                {
                    Error::NotFound(format!("RDS instance {instance:?}"))
                } else {
                    Error::Snapshot(DisplayErrorContext(err).to_string())
                }
            })?;

        let snapshot = response.db_snapshot();
        Ok(SnapshotHandle {
            id: snapshot
                .and_then(|s| s.db_snapshot_identifier())
                .unwrap_or(snapshot_id)
                .to_string(),
            status: snapshot.and_then(|s| s.status()).map(str::to_string),
        })
    }

    async fn snapshot_status(&self, snapshot_id: &str) -> Result<String> {
        let response = self
            .client
            .describe_db_snapshots()
            .db_snapshot_identifier(snapshot_id)
            .send()
            .await
            .map_err(|err| Error::Snapshot(DisplayErrorContext(err).to_string()))?;

        response
            .db_snapshots()
            .first()
            .and_then(|s| s.status())
            .map(str::to_string)
            .ok_or_else(|| Error::Snapshot(format!("no status for snapshot {snapshot_id:?}")))
    }
}

/// `stash-lax-end2end-2022-04-26-04-50-12`. RDS identifiers allow only
/// letters, digits and single hyphens.
pub fn snapshot_name(prefix: &str, instance: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}-{}", prefix, instance, now.format("%Y-%m-%d-%H-%M-%S"))
}

/// Polls until the snapshot reaches `state`. `false` once `timeout` passes.
pub async fn poll_until(
    api: &dyn SnapshotApi,
    handle: &SnapshotHandle,
    state: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<bool> {
    let started = Instant::now();
    loop {
        let status = api.snapshot_status(&handle.id).await?;
        if status == state {
            info!("snapshot {:?} is now {}", handle.id, status);
            return Ok(true);
        }
        if started.elapsed() >= timeout {
            error!(
                "waited {}s, giving up on snapshot: {}",
                timeout.as_secs(),
                handle.id
            );
            return Ok(false);
        }
        info!("snapshot {:?} not {} yet: {}", handle.id, state, status);
        tokio::time::sleep(interval).await;
    }
}

pub struct RdsSnapshot;

#[async_trait]
impl BackupTarget for RdsSnapshot {
    fn kind(&self) -> TargetKind {
        TargetKind::RdsSnapshot
    }

    async fn backup(
        &self,
        names: &[String],
        destination: &Path,
        ctx: &TargetContext<'_>,
    ) -> Result<Artifact> {
        let api = ctx
            .snapshots
            .ok_or_else(|| Error::Snapshot("no RDS client available".to_string()))?;
        let rds = &ctx.config.rds;
        let timeout = Duration::from_secs(rds.max_wait_minutes * 60);
        let interval = Duration::from_secs(rds.poll_interval_secs);

        let mut timed_out = Vec::new();
        for instance in names {
            let name = snapshot_name(&rds.snapshot_prefix, instance, Utc::now());
            match api.create_snapshot(instance, &name).await {
                Ok(handle) => {
                    if !poll_until(api, &handle, AVAILABLE, timeout, interval).await? {
                        timed_out.push(handle.id);
                    }
                }
                Err(Error::NotFound(what)) => {
                    warn!("{} not found, skipping", what);
                }
                Err(err) => return Err(err),
            }
        }

        if !timed_out.is_empty() {
            return Err(Error::Snapshot(format!(
                "snapshots not available in time: {}",
                timed_out.join(", ")
            )));
        }
        Ok(Artifact::empty(destination))
    }

    async fn restore(
        &self,
        names: &[String],
        _source_dir: &Path,
        _ctx: &TargetContext<'_>,
    ) -> Result<RestoreResult> {
        warn!("restoring RDS snapshots is not supported: {:?}", names);
        Ok(RestoreResult::all_failed(names))
    }

    fn artifact_names(&self, _names: &[String]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn remote_pattern(&self) -> Option<&'static str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::process::testing::RecordingRunner;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out the scripted statuses in order, then repeats the last one.
    #[derive(Default)]
    struct ScriptedSnapshots {
        missing: Vec<&'static str>,
        statuses: Mutex<VecDeque<&'static str>>,
        created: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SnapshotApi for ScriptedSnapshots {
        async fn create_snapshot(&self, instance: &str, snapshot_id: &str) -> Result<SnapshotHandle> {
            if self.missing.iter().any(|m| *m == instance) {
                return Err(Error::NotFound(format!("RDS instance {instance:?}")));
            }
            self.created
                .lock()
                .unwrap()
                .push((instance.to_string(), snapshot_id.to_string()));
            Ok(SnapshotHandle {
                id: snapshot_id.to_string(),
                status: Some("creating".to_string()),
            })
        }

        async fn snapshot_status(&self, _snapshot_id: &str) -> Result<String> {
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                *statuses.front().unwrap_or(&"creating")
            };
            Ok(status.to_string())
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.rds.max_wait_minutes = 0;
        config.rds.poll_interval_secs = 0;
        config
    }

    #[test]
    fn test_snapshot_name() {
        let now = Utc.with_ymd_and_hms(2022, 4, 26, 4, 50, 12).unwrap();
        assert_eq!(
            snapshot_name("stash", "lax-end2end", now),
            "stash-lax-end2end-2022-04-26-04-50-12"
        );
    }

    #[tokio::test]
    async fn test_poll_until_available() {
        let api = ScriptedSnapshots {
            statuses: Mutex::new(VecDeque::from(["creating", "backing-up", "available"])),
            ..Default::default()
        };
        let handle = SnapshotHandle {
            id: "snap".to_string(),
            status: None,
        };
        let ok = poll_until(&api, &handle, AVAILABLE, Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let api = ScriptedSnapshots::default();
        let handle = SnapshotHandle {
            id: "snap".to_string(),
            status: None,
        };
        let ok = poll_until(&api, &handle, AVAILABLE, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_backup_skips_missing_instances() {
        let config = fast_config();
        let runner = RecordingRunner::default();
        let api = ScriptedSnapshots {
            missing: vec!["gone"],
            statuses: Mutex::new(VecDeque::from(["available"])),
            ..Default::default()
        };
        let ctx = TargetContext {
            config: &config,
            runner: &runner,
            snapshots: Some(&api),
        };

        let names = vec!["gone".to_string(), "lax-prod".to_string()];
        let artifact = RdsSnapshot
            .backup(&names, Path::new("/tmp/unused"), &ctx)
            .await
            .unwrap();

        assert!(artifact.output.is_empty());
        let created = api.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "lax-prod");
        assert!(created[0].1.starts_with("stash-lax-prod-"));
    }

    #[tokio::test]
    async fn test_backup_reports_timeouts() {
        let config = fast_config();
        let runner = RecordingRunner::default();
        let api = ScriptedSnapshots::default();
        let ctx = TargetContext {
            config: &config,
            runner: &runner,
            snapshots: Some(&api),
        };

        let result = RdsSnapshot
            .backup(&["lax-prod".to_string()], Path::new("/tmp/unused"), &ctx)
            .await;
        assert!(matches!(result, Err(Error::Snapshot(_))));
    }

    #[tokio::test]
    async fn test_restore_is_unsupported() {
        let config = AppConfig::default();
        let runner = RecordingRunner::default();
        let ctx = TargetContext {
            config: &config,
            runner: &runner,
            snapshots: None,
        };
        let result = RdsSnapshot
            .restore(&["lax-prod".to_string()], Path::new("/tmp"), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output, vec![("lax-prod".to_string(), false)]);
    }
}
