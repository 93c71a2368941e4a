//! Backup targets.
//!
//! Each target kind knows how to turn a list of names into artifacts in a
//! destination directory and how to put those artifacts back.

use crate::config::AppConfig;
use crate::descriptor::TargetKind;
use crate::error::Result;
use crate::process::ProcessRunner;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub mod files;
pub mod mysql;
pub mod postgres;
pub mod rds;
pub mod tgz;

pub use rds::{AwsRdsApi, SnapshotApi, SnapshotHandle};

/// What a single target's backup produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub output_dir: PathBuf,
    pub output: Vec<PathBuf>,
}

impl Artifact {
    pub fn empty(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            output: Vec::new(),
        }
    }
}

/// One `(name, restored)` pair per name given to restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreResult {
    pub output: Vec<(String, bool)>,
}

impl RestoreResult {
    pub fn all_failed(names: &[String]) -> Self {
        Self {
            output: names.iter().map(|n| (n.clone(), false)).collect(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.output.iter().all(|(_, ok)| *ok)
    }
}

/// Collaborators and settings a target may need.
pub struct TargetContext<'a> {
    pub config: &'a AppConfig,
    pub runner: &'a dyn ProcessRunner,
    pub snapshots: Option<&'a dyn SnapshotApi>,
}

#[async_trait]
pub trait BackupTarget: Send + Sync {
    fn kind(&self) -> TargetKind;

    async fn backup(
        &self,
        names: &[String],
        destination: &Path,
        ctx: &TargetContext<'_>,
    ) -> Result<Artifact>;

    async fn restore(
        &self,
        names: &[String],
        source_dir: &Path,
        ctx: &TargetContext<'_>,
    ) -> Result<RestoreResult>;

    /// Paths, relative to a backup directory, that restore looks for.
    fn artifact_names(&self, names: &[String]) -> Result<Vec<String>>;

    /// Regex matching this kind's artifact filenames in a remote listing.
    /// `None` for kinds that can only be resolved by exact name.
    fn remote_pattern(&self) -> Option<&'static str>;
}

pub fn target_for(kind: TargetKind) -> &'static dyn BackupTarget {
    match kind {
        TargetKind::Files => &files::Files,
        TargetKind::TarGzipped => &tgz::TarGzipped,
        TargetKind::MysqlDatabase => &mysql::MysqlDatabase,
        TargetKind::PostgresqlDatabase => &postgres::PostgresqlDatabase,
        TargetKind::RdsSnapshot => &rds::RdsSnapshot,
    }
}
