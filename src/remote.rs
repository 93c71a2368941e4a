//! Remote key naming, latest-backup resolution and uploads.
//!
//! Every artifact is stored under
//! `project/yyyymm/yyyymmdd_hostname_hhmmss-basename.ext`, for example
//! `lax/202601/20260114_prod--lax.example.org_040001-lax-psql.gz`.

use crate::config::UploadConfig;
use crate::descriptor::TargetKind;
use crate::error::{Error, Result};
use crate::orchestrator::BackupResults;
use crate::providers::{StorageProvider, MULTIPART_CHUNK};
use crate::targets::target_for;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use md5::{Digest, Md5};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{error, info, warn};

const KEY_PATTERN: &str =
    r"^(?P<project>.+)/(?P<ym>\d+)/(?P<ymd>\d+)_(?P<host>[^_/]+)_(?P<hms>\d+)-(?P<filename>.+)$";

fn key_regex() -> Result<&'static Regex> {
    static KEY_RE: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = KEY_RE.get() {
        return Ok(re);
    }
    let re = Regex::new(KEY_PATTERN).map_err(anyhow::Error::from)?;
    Ok(KEY_RE.get_or_init(|| re))
}

/// Splits a filename at its first dot: `mydb.table1-mysql.gz` => (`mydb`, `table1-mysql.gz`)
fn split_filename(filename: &str) -> Option<(&str, &str)> {
    filename.split_once('.')
}

pub fn remote_key(
    project: &str,
    hostname: &str,
    local_path: &Path,
    timestamp: NaiveDateTime,
) -> Result<String> {
    let filename = local_path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| Error::InvalidName(format!("no filename in {}", local_path.display())))?;
    if hostname.is_empty() || hostname.contains(['_', '/']) {
        return Err(Error::InvalidName(format!(
            "hostname {hostname:?} can't be used in a remote key"
        )));
    }
    let (basename, ext) = split_filename(filename).ok_or_else(|| {
        Error::InvalidName(format!(
            "files must have an extension to be uploaded: {}",
            local_path.display()
        ))
    })?;

    Ok(format!(
        "{}/{}/{}_{}_{}-{}.{}",
        project,
        timestamp.format("%Y%m"),
        timestamp.format("%Y%m%d"),
        hostname,
        timestamp.format("%H%M%S"),
        basename,
        ext
    ))
}

/// A parsed remote key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKey {
    pub key: String,
    pub project: String,
    pub ym: String,
    pub ymd: String,
    pub host: String,
    pub hms: String,
    pub filename: String,
}

impl RemoteKey {
    pub fn parse(key: &str) -> Option<RemoteKey> {
        let caps = key_regex().ok()?.captures(key)?;
        let part = |name: &str| caps.name(name).map(|m| m.as_str().to_string());
        Some(RemoteKey {
            key: key.to_string(),
            project: part("project")?,
            ym: part("ym")?,
            ymd: part("ymd")?,
            host: part("host")?,
            hms: part("hms")?,
            filename: part("filename")?,
        })
    }

    pub fn basename(&self) -> &str {
        split_filename(&self.filename)
            .map(|(b, _)| b)
            .unwrap_or(&self.filename)
    }

    pub fn extension(&self) -> Option<&str> {
        split_filename(&self.filename).map(|(_, e)| e)
    }

    /// `None` when the date or time segment isn't a real date.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        let date = NaiveDate::parse_from_str(&self.ymd, "%Y%m%d").ok()?;
        let time = NaiveTime::parse_from_str(&self.hms, "%H%M%S").ok()?;
        Some(date.and_time(time))
    }
}

/// Keys belonging to `project` and `host` whose filename matches `pattern`.
pub fn filter_listing(keys: &[String], project: &str, host: &str, pattern: &str) -> Result<Vec<String>> {
    let re = Regex::new(&format!(
        r"^{}/(\d+)/(\d+)_{}_(\d+)-{}$",
        regex::escape(project),
        regex::escape(host),
        pattern
    ))
    .map_err(anyhow::Error::from)?;
    Ok(keys.iter().filter(|k| re.is_match(k)).cloned().collect())
}

/// Latest key per distinct filename, as `(filename, key)` pairs sorted by
/// filename. An exact `name` returns at most that one file.
pub fn latest_backups_in(
    listing: &[String],
    project: &str,
    host: &str,
    kind: TargetKind,
    name: Option<&str>,
) -> Result<Vec<(String, String)>> {
    let pattern = match name {
        Some(name) => regex::escape(name),
        None => match target_for(kind).remote_pattern() {
            Some(pattern) => pattern.to_string(),
            None => {
                warn!("{} backups can only be found by exact name", kind);
                return Ok(Vec::new());
            }
        },
    };

    let matching = filter_listing(listing, project, host, &pattern)?;
    if matching.is_empty() {
        warn!(
            "no backups found for project {:?} on host {:?} (using target {:?} and path {:?})",
            project, host, kind.as_str(), name
        );
        return Ok(Vec::new());
    }

    let mut by_filename: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in matching {
        match RemoteKey::parse(&key) {
            Some(parsed) => by_filename.entry(parsed.filename).or_default().push(key),
            None => warn!("ignoring unparseable key {:?}", key),
        }
    }

    let latest = by_filename.into_iter().filter_map(|(filename, mut keys)| {
        keys.sort();
        keys.pop().map(|key| (filename, key))
    });

    Ok(match name {
        Some(name) => latest.filter(|(filename, _)| filename == name).collect(),
        None => latest.collect(),
    })
}

pub async fn latest_backups(
    provider: &dyn StorageProvider,
    project: &str,
    host: &str,
    kind: TargetKind,
    name: Option<&str>,
) -> Result<Vec<(String, String)>> {
    let listing: Vec<String> = provider
        .list(&format!("{project}/"))
        .await?
        .into_iter()
        .map(|item| item.key)
        .collect();
    latest_backups_in(&listing, project, host, kind, name)
}

/// Downloads `key` to `dest`, creating parent directories.
pub async fn download(provider: &dyn StorageProvider, key: &str, dest: &Path) -> Result<PathBuf> {
    let key = key.trim_start_matches('/');
    if provider.head(key).await?.is_none() {
        return Err(Error::MissingRemoteKey {
            bucket: provider.get_bucket().to_string(),
            key: key.to_string(),
        });
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    provider.download(key, dest).await?;
    Ok(dest.to_path_buf())
}

/// Downloads the latest backups for `kind` into `to_dir`. A `name` containing
/// a wildcard is treated as no name at all.
pub async fn download_latest_backup(
    provider: &dyn StorageProvider,
    to_dir: &Path,
    project: &str,
    host: &str,
    kind: TargetKind,
    name: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let name = name.filter(|n| !n.contains('*'));
    let latest = latest_backups(provider, project, host, kind, name).await?;

    let mut results = Vec::with_capacity(latest.len());
    for (filename, key) in latest {
        let dest = to_dir.join(name.unwrap_or(&filename));
        info!("downloading {:?} to {}", key, dest.display());
        results.push(download(provider, &key, &dest).await?);
    }
    Ok(results)
}

/// ETag S3 reports for `path` when uploaded the way our S3 provider uploads:
/// plain md5 below [`MULTIPART_CHUNK`], otherwise the md5 of the part md5s
/// suffixed with the part count.
pub fn s3_etag(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let size = file.metadata()?.len();
    let mut part_digests = Vec::new();
    let mut whole = Md5::new();
    let mut buf = vec![0u8; MULTIPART_CHUNK as usize];

    loop {
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            break;
        }
        let chunk = &buf[..filled];
        whole.update(chunk);
        part_digests.extend_from_slice(&Md5::digest(chunk));
        if filled < buf.len() {
            break;
        }
    }

    if size >= MULTIPART_CHUNK {
        let parts = part_digests.len() / 16;
        Ok(format!("{:x}-{}", Md5::digest(&part_digests), parts))
    } else {
        Ok(format!("{:x}", whole.finalize()))
    }
}

/// Compares the uploaded object against the local file. Size always, ETag
/// when the store reports one.
pub async fn verify_upload(provider: &dyn StorageProvider, key: &str, local: &Path) -> Result<()> {
    let remote = provider.head(key).await?.ok_or_else(|| Error::MissingRemoteKey {
        bucket: provider.get_bucket().to_string(),
        key: key.to_string(),
    })?;
    let local_bytes = fs::metadata(local)?.len();
    info!("got remote bytes {} and local bytes {} for {}", remote.size, local_bytes, key);

    if remote.size != local_bytes {
        let larger = if remote.size > local_bytes { "REMOTE" } else { "LOCAL" };
        return Err(Error::RemoteInconsistency {
            key: key.to_string(),
            reason: format!(
                "size of {larger} file is larger (remote {}, local {})",
                remote.size, local_bytes
            ),
        });
    }

    if let Some(remote_etag) = remote.e_tag {
        let local_etag = s3_etag(local)?;
        if remote_etag != local_etag {
            return Err(Error::RemoteInconsistency {
                key: key.to_string(),
                reason: format!("ETags do not match (local {local_etag}, remote {remote_etag})"),
            });
        }
    }
    Ok(())
}

/// The artifact files a backup run produced that still exist on disk.
pub fn upload_targets(results: &BackupResults) -> Vec<PathBuf> {
    results
        .values()
        .filter_map(|result| result.as_ref().ok())
        .flat_map(|artifact| artifact.output.iter())
        .filter(|path| {
            let exists = path.exists();
            if !exists {
                warn!("backup output missing, not uploading: {}", path.display());
            }
            exists
        })
        .cloned()
        .collect()
}

/// What an upload run wrote and which files it couldn't.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub keys: Vec<String>,
    pub failures: Vec<(PathBuf, Error)>,
}

/// Uploads every artifact of a backup run under a fresh key and verifies
/// each upload. A file that can't be keyed, uploaded or (under strict
/// verification) verified is recorded and the rest still go. Only files that
/// made it are removed when `remove_after_upload` is set.
pub async fn upload_backup(
    provider: &dyn StorageProvider,
    results: &BackupResults,
    project: &str,
    hostname: &str,
    options: &UploadConfig,
) -> UploadReport {
    let now = chrono::Local::now().naive_local();
    let mut report = UploadReport::default();
    let mut written: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut uploaded = Vec::new();

    for path in upload_targets(results) {
        match upload_one(provider, project, hostname, &path, now, options, &written).await {
            Ok(key) => {
                written.insert(key.clone(), path.clone());
                report.keys.push(key);
                uploaded.push(path);
            }
            Err(err) => {
                error!("not uploaded {}: {}", path.display(), err);
                report.failures.push((path, err));
            }
        }
    }

    if options.remove_after_upload {
        for path in &uploaded {
            if let Err(err) = fs::remove_file(path) {
                warn!("failed to remove uploaded file {}: {}", path.display(), err);
            }
        }
    }
    report
}

async fn upload_one(
    provider: &dyn StorageProvider,
    project: &str,
    hostname: &str,
    path: &Path,
    now: NaiveDateTime,
    options: &UploadConfig,
    written: &BTreeMap<String, PathBuf>,
) -> Result<String> {
    let key = remote_key(project, hostname, path, now)?;
    if let Some(first) = written.get(&key) {
        return Err(Error::InvalidName(format!(
            "{} would overwrite {} uploaded as {key} in this run",
            path.display(),
            first.display()
        )));
    }

    info!("attempting to upload {} to {}/{}", path.display(), provider.get_bucket(), key);
    provider.upload(&key, path).await?;

    if let Err(err) = verify_upload(provider, &key, path).await {
        if options.strict_verify {
            return Err(err);
        }
        error!("{}", err);
    }
    Ok(key)
}
