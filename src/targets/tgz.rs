//! A single gzipped tarball of everything the names cover.
//!
//! Files are stored under their absolute path (minus the leading `/`) so a
//! restore can put each one straight back where it came from.

use super::files::{expand, is_glob, static_base};
use super::{Artifact, BackupTarget, RestoreResult, TargetContext};
use crate::descriptor::TargetKind;
use crate::error::Result;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::{debug, info, warn};

pub struct TarGzipped;

/// `archive-<8 hex chars>.tar.gz`, derived from the names in the order given.
pub fn archive_name(names: &[String]) -> String {
    let digest = format!("{:x}", Md5::digest(names.join("|").as_bytes()));
    format!("archive-{}.tar.gz", &digest[..8])
}

fn archive_path_for(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

/// Writes `paths` into a new tar.gz at `archive_path`.
pub fn write_archive(paths: &[PathBuf], archive_path: &Path) -> Result<()> {
    let file = File::create(archive_path)?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

    for path in paths {
        builder.append_path_with_name(path, archive_path_for(path))?;
    }

    builder.into_inner()?.finish()?;
    debug!("wrote {} files to {}", paths.len(), archive_path.display());
    Ok(())
}

/// Unpacks `archive_path` below `root`, returning the paths written.
pub fn unpack_archive(archive_path: &Path, root: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = Archive::new(GzDecoder::new(File::open(archive_path)?));
    archive.set_preserve_permissions(true);

    let mut restored = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if entry.unpack_in(root)? {
            restored.push(root.join(path));
        } else {
            warn!("skipped archive entry outside of {}: {}", root.display(), path.display());
        }
    }
    Ok(restored)
}

/// Whether `name` came back below `root`.
fn restored_name(name: &str, root: &Path, restored: &[PathBuf]) -> bool {
    if is_glob(name) {
        let base = root.join(archive_path_for(&static_base(name)));
        restored.iter().any(|p| p.starts_with(&base))
    } else {
        root.join(archive_path_for(Path::new(name))).exists()
    }
}

/// Unpacks the descriptor's archive from `source_dir` below `root` and reports
/// each name. A missing archive restores nothing.
pub fn restore_into(names: &[String], source_dir: &Path, root: &Path) -> Result<RestoreResult> {
    let archive = source_dir.join(archive_name(names));
    if !archive.exists() {
        warn!("archive not found, nothing to restore: {}", archive.display());
        return Ok(RestoreResult::all_failed(names));
    }

    let restored = unpack_archive(&archive, root)?;
    info!("restored {} files from {}", restored.len(), archive.display());

    let output = names
        .iter()
        .map(|name| (name.clone(), restored_name(name, root, &restored)))
        .collect();
    Ok(RestoreResult { output })
}

#[async_trait]
impl BackupTarget for TarGzipped {
    fn kind(&self) -> TargetKind {
        TargetKind::TarGzipped
    }

    async fn backup(
        &self,
        names: &[String],
        destination: &Path,
        _ctx: &TargetContext<'_>,
    ) -> Result<Artifact> {
        let paths = expand(names);
        fs::create_dir_all(destination)?;

        if paths.is_empty() {
            warn!("nothing to archive in {:?}", names);
            return Ok(Artifact::empty(destination));
        }

        let output = destination.join(archive_name(names));
        write_archive(&paths, &output)?;
        info!("archived {} files to {}", paths.len(), output.display());

        Ok(Artifact {
            output_dir: destination.to_path_buf(),
            output: vec![output],
        })
    }

    async fn restore(
        &self,
        names: &[String],
        source_dir: &Path,
        _ctx: &TargetContext<'_>,
    ) -> Result<RestoreResult> {
        restore_into(names, source_dir, Path::new("/"))
    }

    fn artifact_names(&self, names: &[String]) -> Result<Vec<String>> {
        Ok(vec![archive_name(names)])
    }

    fn remote_pattern(&self) -> Option<&'static str> {
        Some(r"archive-.+\.tar\.gz")
    }
}
