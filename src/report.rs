//! Reports on backups that haven't happened recently.

use crate::config::{AppConfig, ReportConfig};
use crate::descriptor::TargetKind;
use crate::error::Result;
use crate::orchestrator::{load_descriptors, RunOptions, RunSummary};
use crate::providers::StorageProvider;
use crate::remote::{self, RemoteKey};
use crate::targets::target_for;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

pub type LatestBackups = BTreeMap<String, BTreeMap<String, BTreeMap<String, RemoteKey>>>;

/// Parses a bucket listing. Keys not in the `project/ym/ymd_host_hms-file`
/// layout are very old or ad hoc uploads and are dropped.
pub fn parse_listing<S: AsRef<str>>(keys: &[S]) -> Vec<RemoteKey> {
    keys.iter()
        .filter_map(|key| RemoteKey::parse(key.as_ref()))
        .collect()
}

/// Keeps only the backups of working machines: no hidden (`_`) projects, only
/// hosts containing one of the configured substrings, nothing blocklisted.
pub fn filter_backup_list(list: Vec<RemoteKey>, config: &ReportConfig) -> Vec<RemoteKey> {
    list.into_iter()
        .filter(|backup| {
            !backup.project.starts_with('_')
                && config
                    .host_substrings
                    .iter()
                    .any(|s| backup.host.contains(s.as_str()))
                && !config.project_blocklist.contains(&backup.project)
                && !config.file_blocklist.contains(&backup.filename)
        })
        .collect()
}

/// `{project: {host: {filename: most recent backup}}}`
pub fn latest_by_project_host_filename(list: Vec<RemoteKey>) -> LatestBackups {
    let mut latest = LatestBackups::new();
    for backup in list {
        let files = latest
            .entry(backup.project.clone())
            .or_default()
            .entry(backup.host.clone())
            .or_default();
        match files.get(&backup.filename) {
            Some(current) if (&current.ymd, &current.hms) >= (&backup.ymd, &backup.hms) => {}
            _ => {
                files.insert(backup.filename.clone(), backup);
            }
        }
    }
    latest
}

/// Older than `threshold_days` whole days. A key whose timestamp doesn't
/// parse counts as stale.
pub fn is_stale(backup: &RemoteKey, now: NaiveDateTime, threshold_days: i64) -> bool {
    match backup.timestamp() {
        Some(taken) => (now - taken).num_days() > threshold_days,
        None => {
            warn!("unparseable timestamp in {:?}", backup.key);
            true
        }
    }
}

/// Every project and host in the bucket.
pub async fn check_all(
    provider: &dyn StorageProvider,
    config: &ReportConfig,
    now: NaiveDateTime,
) -> Result<Vec<RemoteKey>> {
    let listing: Vec<String> = provider
        .list("")
        .await?
        .into_iter()
        .map(|item| item.key)
        .collect();
    info!("checking {} keys in {}", listing.len(), provider.get_bucket());

    let backups = filter_backup_list(parse_listing(&listing), config);
    let problems: Vec<RemoteKey> = latest_by_project_host_filename(backups)
        .into_values()
        .flat_map(BTreeMap::into_values)
        .flat_map(BTreeMap::into_values)
        .filter(|backup| is_stale(backup, now, config.problem_threshold_days))
        .collect();

    print_report(&problems);
    Ok(problems)
}

/// Only this host's descriptors, looked up the same way a restore would.
pub async fn check(
    provider: &dyn StorageProvider,
    config: &AppConfig,
    options: &RunOptions,
    now: NaiveDateTime,
) -> Result<(Vec<RemoteKey>, RunSummary)> {
    let mut summary = RunSummary::default();
    let mut problems = Vec::new();

    for loaded in load_descriptors(config, options, &mut summary)? {
        for (kind, names) in loaded.descriptor.iter() {
            if kind == TargetKind::RdsSnapshot {
                continue;
            }
            let target = target_for(kind);
            let latest = if target.remote_pattern().is_some() {
                remote::latest_backups(provider, &loaded.project, &options.hostname, kind, None)
                    .await?
            } else {
                let mut latest = Vec::new();
                for artifact in target.artifact_names(names)? {
                    let Some(filename) = Path::new(&artifact).file_name().and_then(|f| f.to_str())
                    else {
                        continue;
                    };
                    latest.extend(
                        remote::latest_backups(
                            provider,
                            &loaded.project,
                            &options.hostname,
                            kind,
                            Some(filename),
                        )
                        .await?,
                    );
                }
                latest
            };

            let keys: Vec<String> = latest.into_iter().map(|(_, key)| key).collect();
            problems.extend(
                parse_listing(&keys)
                    .into_iter()
                    .filter(|backup| is_stale(backup, now, config.report.problem_threshold_days)),
            );
        }
        summary.processed += 1;
    }

    print_report(&problems);
    Ok((problems, summary))
}

pub fn print_report(problems: &[RemoteKey]) {
    if problems.is_empty() {
        return;
    }
    for (project, hosts) in latest_by_project_host_filename(problems.to_vec()) {
        println!("{project}");
        for (host, files) in hosts {
            println!("  {host}");
            for (filename, backup) in files {
                match backup.timestamp() {
                    Some(taken) => println!("    {filename}: {taken}"),
                    None => println!("    {filename}: {}", backup.key),
                }
            }
        }
    }
}
