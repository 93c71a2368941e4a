//! Plain file copies.
//!
//! Names are paths, directories or glob patterns (`*`, `**`). Backed-up files
//! keep their layout below the common parent directory of all the names, so
//! `[/opt/app/uploads/, /opt/app/config.yaml]` lands in the destination as
//! `uploads/...` and `config.yaml`.

use super::{Artifact, BackupTarget, RestoreResult, TargetContext};
use crate::descriptor::TargetKind;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub struct Files;

pub fn is_glob(name: &str) -> bool {
    name.contains(|c| matches!(c, '*' | '?' | '['))
}

/// The leading components of `name` that contain no glob characters.
pub fn static_base(name: &str) -> PathBuf {
    Path::new(name)
        .components()
        .take_while(|c| !is_glob(&c.as_os_str().to_string_lossy()))
        .collect()
}

fn common_ancestor(paths: &[PathBuf]) -> PathBuf {
    let mut iter = paths.iter();
    let Some(first) = iter.next() else {
        return PathBuf::from("/");
    };
    let mut common: Vec<Component> = first.components().collect();
    for path in iter {
        let shared = common
            .iter()
            .zip(path.components())
            .take_while(|(a, b)| **a == *b)
            .count();
        common.truncate(shared);
    }
    common.iter().collect()
}

/// Directory stripped from every backed-up path: the common ancestor of each
/// name's parent directory.
pub fn strip_prefix(names: &[String]) -> PathBuf {
    let parents: Vec<PathBuf> = names
        .iter()
        .map(|name| {
            let base = static_base(name);
            base.parent().map(Path::to_path_buf).unwrap_or(base)
        })
        .collect();
    common_ancestor(&parents)
}

fn is_valid(path: &Path) -> bool {
    path.is_file() && fs::File::open(path).is_ok()
}

fn push_tree(path: &Path, found: &mut Vec<PathBuf>) {
    if path.is_dir() {
        let mut files: Vec<PathBuf> = WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        found.extend(files);
    } else {
        found.push(path.to_path_buf());
    }
}

fn expand_name(name: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    if is_glob(name) {
        match glob::glob(name) {
            Ok(paths) => {
                for path in paths.filter_map(|p| p.ok()) {
                    push_tree(&path, &mut found);
                }
            }
            Err(err) => warn!("bad glob pattern {:?}: {}", name, err),
        }
    } else {
        push_tree(Path::new(name), &mut found);
    }
    found.retain(|p| is_valid(p));
    found
}

/// Expands names into the readable regular files they cover, in order,
/// without duplicates. Plain names that cover nothing are logged.
pub fn expand(names: &[String]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    let mut dropped = Vec::new();

    for name in names {
        let found = expand_name(name);
        if found.is_empty() && !is_glob(name) {
            dropped.push(name.as_str());
        }
        for path in found {
            if seen.insert(path.clone()) {
                result.push(path);
            }
        }
    }

    if !dropped.is_empty() {
        warn!(
            "the following files failed validation and were removed from this backup: {}",
            dropped.join(", ")
        );
    }
    result
}

fn copy_file(src: &Path, dest: &Path) -> Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest)?;
    Ok(dest.to_path_buf())
}

fn relative(name: &str, prefix: &Path) -> PathBuf {
    Path::new(name)
        .strip_prefix(prefix)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| PathBuf::from(name.trim_start_matches('/')))
}

/// Copies everything the names cover into `destination`.
pub fn copy_tree(names: &[String], destination: &Path) -> Result<Artifact> {
    let paths = expand(names);
    fs::create_dir_all(destination)?;

    if paths.is_empty() {
        warn!("nothing to back up in {:?}", names);
        return Ok(Artifact::empty(destination));
    }

    let prefix = strip_prefix(names);
    debug!("stripping {} from {} files", prefix.display(), paths.len());

    let output = paths
        .iter()
        .map(|src| {
            let rel = src.strip_prefix(&prefix).unwrap_or(src);
            copy_file(src, &destination.join(rel))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Artifact {
        output_dir: destination.to_path_buf(),
        output,
    })
}

fn restore_name(name: &str, source_dir: &Path, prefix: &Path) -> bool {
    let backed_up = source_dir.join(relative(name, prefix));
    let found = expand_name(&backed_up.to_string_lossy());
    if found.is_empty() {
        warn!("no backup of {:?} found in {}", name, source_dir.display());
        return false;
    }

    for src in &found {
        let rel = src.strip_prefix(source_dir).unwrap_or(src);
        let dest = prefix.join(rel);
        if let Err(err) = copy_file(src, &dest) {
            warn!("failed to restore {} to {}: {}", src.display(), dest.display(), err);
            return false;
        }
    }
    info!("restored {} files for {:?}", found.len(), name);
    true
}

#[async_trait]
impl BackupTarget for Files {
    fn kind(&self) -> TargetKind {
        TargetKind::Files
    }

    async fn backup(
        &self,
        names: &[String],
        destination: &Path,
        _ctx: &TargetContext<'_>,
    ) -> Result<Artifact> {
        copy_tree(names, destination)
    }

    async fn restore(
        &self,
        names: &[String],
        source_dir: &Path,
        _ctx: &TargetContext<'_>,
    ) -> Result<RestoreResult> {
        let prefix = strip_prefix(names);
        let output = names
            .iter()
            .map(|name| (name.clone(), restore_name(name, source_dir, &prefix)))
            .collect();
        Ok(RestoreResult { output })
    }

    fn artifact_names(&self, names: &[String]) -> Result<Vec<String>> {
        let prefix = strip_prefix(names);
        Ok(names
            .iter()
            .filter(|name| !is_glob(name))
            .map(|name| relative(name, &prefix).to_string_lossy().into_owned())
            .collect())
    }

    fn remote_pattern(&self) -> Option<&'static str> {
        None
    }
}
