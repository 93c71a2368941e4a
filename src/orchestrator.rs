//! Runs descriptors through their targets.
//!
//! `backup` and `restore` handle a single descriptor; the `*_backup`,
//! `*_restore` and `download` flows handle every descriptor found in a
//! directory, each in its own machine directory
//! (`<working_dir>/<project>/<hostname>`).

use crate::config::AppConfig;
use crate::descriptor::{self, Descriptor, TargetKind};
use crate::error::{Error, Result};
use crate::providers::StorageProvider;
use crate::remote;
use crate::targets::{target_for, Artifact, RestoreResult, TargetContext};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub type BackupResults = BTreeMap<TargetKind, Result<Artifact>>;
pub type RestoreResults = BTreeMap<TargetKind, Result<RestoreResult>>;

/// Backs up every kind in the descriptor into `destination`. A failing kind
/// is logged and recorded; the others still run.
pub async fn backup(
    descriptor: &Descriptor,
    destination: &Path,
    ctx: &TargetContext<'_>,
) -> BackupResults {
    let mut results = BackupResults::new();
    for (kind, names) in descriptor.iter() {
        info!("backing up {} {:?}", kind, names);
        let result = target_for(kind).backup(names, destination, ctx).await;
        if let Err(err) = &result {
            error!("{} backup failed: {}", kind, err);
        }
        results.insert(kind, result);
    }
    results
}

pub async fn restore(
    descriptor: &Descriptor,
    source_dir: &Path,
    ctx: &TargetContext<'_>,
) -> RestoreResults {
    let mut results = RestoreResults::new();
    for (kind, names) in descriptor.iter() {
        info!("restoring {} {:?} from {}", kind, names, source_dir.display());
        let result = target_for(kind).restore(names, source_dir, ctx).await;
        match &result {
            Ok(restored) => {
                for (name, ok) in &restored.output {
                    if !*ok {
                        warn!("failed to restore {} {:?}", kind, name);
                    }
                }
            }
            Err(err) => error!("{} restore failed: {}", kind, err),
        }
        results.insert(kind, result);
    }
    results
}

/// `<working_root>/<project>/<hostname>`, `None` if the descriptor's project
/// can't be determined.
pub fn machine_dir(working_root: &Path, hostname: &str, descriptor_path: &Path) -> Option<PathBuf> {
    let project = descriptor::project_name(descriptor_path)?;
    Some(working_root.join(project).join(hostname))
}

/// Which descriptors to run and as which host.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub descriptors: PathBuf,
    pub hostname: String,
    pub selectors: Vec<String>,
}

/// What happened across a whole run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    /// A descriptor failed to parse or validate
    pub invalid_descriptor: bool,
    /// `project kind: error` for every kind or upload that failed
    pub failures: Vec<String>,
    /// `project kind name` for every name restore reported as not restored
    pub not_restored: Vec<String>,
    pub uploaded: Vec<String>,
    pub downloaded: Vec<PathBuf>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        !self.invalid_descriptor && self.failures.is_empty() && self.not_restored.is_empty()
    }

    fn record_backup(&mut self, project: &str, results: &BackupResults) {
        for (kind, result) in results {
            if let Err(err) = result {
                self.failures.push(format!("{project} {kind}: {err}"));
            }
        }
    }

    fn record_restore(&mut self, project: &str, results: &RestoreResults) {
        for (kind, result) in results {
            match result {
                Ok(restored) => self.not_restored.extend(
                    restored
                        .output
                        .iter()
                        .filter(|(_, ok)| !*ok)
                        .map(|(name, _)| format!("{project} {kind} {name}")),
                ),
                Err(err) => self.failures.push(format!("{project} {kind}: {err}")),
            }
        }
    }
}

/// A descriptor that loaded and validated.
#[derive(Debug, Clone)]
pub struct LoadedDescriptor {
    pub project: String,
    pub path: PathBuf,
    pub descriptor: Descriptor,
}

/// Loads every descriptor at `options.descriptors`, narrowed by the
/// selectors. Descriptors without a project name or that fail validation are
/// logged and skipped.
pub fn load_descriptors(
    config: &AppConfig,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> Result<Vec<LoadedDescriptor>> {
    let paths = descriptor::find_descriptors(&options.descriptors)?;
    if paths.is_empty() {
        warn!("no descriptors found in {}", options.descriptors.display());
    }

    let mut loaded = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(project) = descriptor::project_name(&path) else {
            warn!("no project name, skipping given descriptor {}", path.display());
            summary.skipped += 1;
            continue;
        };
        match descriptor::load_descriptor(&path, &options.selectors, config.strict_descriptors) {
            Ok(descriptor) => loaded.push(LoadedDescriptor {
                project,
                path,
                descriptor,
            }),
            Err(err) => {
                error!("skipping descriptor {}: {}", path.display(), err);
                if matches!(err, Error::Validation(_) | Error::InvalidName(_) | Error::Yaml(_)) {
                    summary.invalid_descriptor = true;
                }
                summary.skipped += 1;
            }
        }
    }
    Ok(loaded)
}

/// The machine directory for a loaded descriptor, created if missing.
fn working_dir_for(config: &AppConfig, hostname: &str, loaded: &LoadedDescriptor) -> Result<PathBuf> {
    let dir = machine_dir(&config.working_dir, hostname, &loaded.path)
        .unwrap_or_else(|| config.working_dir.join(&loaded.project).join(hostname));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Snapshots run on their own through `rds_backup`; everything else leaves
/// files in the machine directory.
fn file_kinds(descriptor: &Descriptor) -> Descriptor {
    descriptor.without(TargetKind::RdsSnapshot)
}

pub async fn file_backup(ctx: &TargetContext<'_>, options: &RunOptions) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    for loaded in load_descriptors(ctx.config, options, &mut summary)? {
        let dir = working_dir_for(ctx.config, &options.hostname, &loaded)?;
        let results = backup(&file_kinds(&loaded.descriptor), &dir, ctx).await;
        summary.record_backup(&loaded.project, &results);
        summary.processed += 1;
    }
    Ok(summary)
}

/// Backs up each descriptor then uploads whatever was produced, even when some
/// kinds failed.
pub async fn s3_backup(
    ctx: &TargetContext<'_>,
    provider: &dyn StorageProvider,
    options: &RunOptions,
) -> Result<RunSummary> {
    info!("backing up ...");
    let mut summary = RunSummary::default();
    for loaded in load_descriptors(ctx.config, options, &mut summary)? {
        let dir = working_dir_for(ctx.config, &options.hostname, &loaded)?;
        let results = backup(&file_kinds(&loaded.descriptor), &dir, ctx).await;
        summary.record_backup(&loaded.project, &results);

        let report = remote::upload_backup(
            provider,
            &results,
            &loaded.project,
            &options.hostname,
            &ctx.config.upload,
        )
        .await;
        summary.uploaded.extend(report.keys);
        for (path, err) in report.failures {
            summary
                .failures
                .push(format!("{} upload {}: {}", loaded.project, path.display(), err));
        }
        summary.processed += 1;
    }
    Ok(summary)
}

/// Only the `rds-snapshot` section of each descriptor.
pub async fn rds_backup(ctx: &TargetContext<'_>, options: &RunOptions) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    for loaded in load_descriptors(ctx.config, options, &mut summary)? {
        let snapshots = loaded.descriptor.only(TargetKind::RdsSnapshot);
        if snapshots.is_empty() {
            debug!("no rds-snapshot targets in {}", loaded.path.display());
            continue;
        }
        let dir = working_dir_for(ctx.config, &options.hostname, &loaded)?;
        let results = backup(&snapshots, &dir, ctx).await;
        summary.record_backup(&loaded.project, &results);
        summary.processed += 1;
    }
    Ok(summary)
}

pub async fn file_restore(ctx: &TargetContext<'_>, options: &RunOptions) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    for loaded in load_descriptors(ctx.config, options, &mut summary)? {
        let dir = working_dir_for(ctx.config, &options.hostname, &loaded)?;
        let results = restore(&file_kinds(&loaded.descriptor), &dir, ctx).await;
        summary.record_restore(&loaded.project, &results);
        summary.processed += 1;
    }
    Ok(summary)
}

/// Plain `files` names sharing a filename with another one. Remote keys only
/// carry the filename, so these can't be told apart on the way back.
fn ambiguous_files(descriptor: &Descriptor) -> Vec<String> {
    let names: Vec<&String> = descriptor
        .get(TargetKind::Files)
        .unwrap_or_default()
        .iter()
        .filter(|name| !crate::targets::files::is_glob(name))
        .collect();
    let filename = |name: &str| Path::new(name).file_name().map(|f| f.to_os_string());

    names
        .iter()
        .filter(|name| {
            names
                .iter()
                .filter(|other| filename(other.as_str()) == filename(name.as_str()))
                .count()
                > 1
        })
        .map(|name| name.to_string())
        .collect()
}

/// The descriptor minus the given `files` names.
fn without_files(descriptor: &Descriptor, excluded: &[String]) -> Descriptor {
    descriptor
        .iter()
        .map(|(kind, names)| {
            let kept: Vec<String> = names
                .iter()
                .filter(|name| kind != TargetKind::Files || !excluded.contains(name))
                .cloned()
                .collect();
            (kind, kept)
        })
        .filter(|(_, names)| !names.is_empty())
        .collect()
}

/// Fetches the latest remote copy of every artifact the descriptor's restore
/// will look for. Glob file names can't be resolved remotely and are skipped.
/// Returns the `files` names that were refused because their filename is
/// shared with another name.
async fn download_descriptor(
    provider: &dyn StorageProvider,
    dir: &Path,
    hostname: &str,
    loaded: &LoadedDescriptor,
    summary: &mut RunSummary,
) -> Vec<String> {
    let ambiguous = ambiguous_files(&loaded.descriptor);
    for name in &ambiguous {
        warn!(
            "{:?} shares its filename with another files entry, refusing to download it",
            name
        );
    }
    let descriptor = without_files(&file_kinds(&loaded.descriptor), &ambiguous);

    for (kind, names) in descriptor.iter() {
        let target = target_for(kind);
        if kind == TargetKind::Files {
            for name in names.iter().filter(|n| crate::targets::files::is_glob(n)) {
                warn!("can't download globbed files from remote storage, skipping {:?}", name);
            }
        }

        let artifacts = match target.artifact_names(names) {
            Ok(artifacts) => artifacts,
            Err(err) => {
                summary.failures.push(format!("{} {}: {}", loaded.project, kind, err));
                continue;
            }
        };

        for artifact in artifacts {
            let rel = Path::new(&artifact);
            let Some(filename) = rel.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            let to_dir = rel.parent().map(|p| dir.join(p)).unwrap_or_else(|| dir.to_path_buf());
            match remote::download_latest_backup(
                provider,
                &to_dir,
                &loaded.project,
                hostname,
                kind,
                Some(filename),
            )
            .await
            {
                Ok(paths) => summary.downloaded.extend(paths),
                Err(err) => {
                    error!("failed to download {} {:?}: {}", kind, artifact, err);
                    summary
                        .failures
                        .push(format!("{} {} {}: {}", loaded.project, kind, artifact, err));
                }
            }
        }
    }
    ambiguous
}

/// Downloads the latest backups for this host into the machine directories
/// without restoring anything.
pub async fn download(
    ctx: &TargetContext<'_>,
    provider: &dyn StorageProvider,
    options: &RunOptions,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    for loaded in load_descriptors(ctx.config, options, &mut summary)? {
        let dir = working_dir_for(ctx.config, &options.hostname, &loaded)?;
        let refused = download_descriptor(provider, &dir, &options.hostname, &loaded, &mut summary).await;
        summary.failures.extend(
            refused
                .iter()
                .map(|name| format!("{} files {}: ambiguous filename", loaded.project, name)),
        );
        summary.processed += 1;
    }
    Ok(summary)
}

/// Downloads the latest backups into each machine directory and restores
/// from there. A different hostname restores another machine's backups here.
pub async fn s3_restore(
    ctx: &TargetContext<'_>,
    provider: &dyn StorageProvider,
    options: &RunOptions,
) -> Result<RunSummary> {
    info!("restoring ...");
    let mut summary = RunSummary::default();
    for loaded in load_descriptors(ctx.config, options, &mut summary)? {
        let dir = working_dir_for(ctx.config, &options.hostname, &loaded)?;
        let refused = download_descriptor(provider, &dir, &options.hostname, &loaded, &mut summary).await;
        let descriptor = without_files(&file_kinds(&loaded.descriptor), &refused);
        let mut results = restore(&descriptor, &dir, ctx).await;
        if !refused.is_empty() {
            let files = results
                .entry(TargetKind::Files)
                .or_insert_with(|| Ok(RestoreResult::default()));
            if let Ok(restored) = files {
                restored.output.extend(refused.iter().map(|name| (name.clone(), false)));
            }
        }
        summary.record_restore(&loaded.project, &results);
        summary.processed += 1;
    }
    Ok(summary)
}
