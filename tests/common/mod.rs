// Shared fakes for the integration tests

#![allow(dead_code)]

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use stash_backup::process::{Env, ProcessRunner};
use stash_backup::providers::{BackupItem, ObjectStoreProvider, StorageProvider};
use stash_backup::remote::s3_etag;
use stash_backup::targets::{SnapshotApi, SnapshotHandle};
use stash_backup::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Stored object reports an ETag that doesn't match its content
    WrongEtag,
    /// Only the first half of each upload is stored
    Truncate,
}

/// In-memory bucket that reports S3-style ETags, optionally misbehaving.
pub struct FakeS3 {
    inner: ObjectStoreProvider,
    etags: Mutex<HashMap<String, String>>,
    fault: Fault,
    scratch: tempfile::TempDir,
}

impl FakeS3 {
    pub fn new() -> Self {
        Self::with_fault(Fault::None)
    }

    pub fn with_fault(fault: Fault) -> Self {
        Self {
            inner: ObjectStoreProvider::memory("test-bucket"),
            etags: Mutex::new(HashMap::new()),
            fault,
            scratch: tempfile::TempDir::new().unwrap(),
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.key)
            .collect();
        keys.sort();
        keys
    }

    /// Stores `content` under `key` without going through a backup.
    pub async fn put(&self, key: &str, content: &[u8]) {
        let path = self.scratch.path().join("put");
        fs::write(&path, content).unwrap();
        self.upload(key, &path).await.unwrap();
    }

    fn with_etag(&self, mut item: BackupItem) -> BackupItem {
        item.e_tag = self.etags.lock().unwrap().get(&item.key).cloned();
        item
    }
}

#[async_trait]
impl StorageProvider for FakeS3 {
    async fn upload(&self, key: &str, file_path: &Path) -> AnyResult<()> {
        let etag = s3_etag(file_path)?;
        let stored = match self.fault {
            Fault::Truncate => {
                let data = fs::read(file_path)?;
                let half = self.scratch.path().join("half");
                fs::write(&half, &data[..data.len() / 2])?;
                half
            }
            _ => file_path.to_path_buf(),
        };
        self.inner.upload(key, &stored).await?;

        let etag = match self.fault {
            Fault::WrongEtag => format!("{etag}0"),
            _ => etag,
        };
        self.etags.lock().unwrap().insert(key.to_string(), etag);
        Ok(())
    }

    async fn download(&self, key: &str, output_path: &Path) -> AnyResult<()> {
        self.inner.download(key, output_path).await
    }

    async fn list(&self, prefix: &str) -> AnyResult<Vec<BackupItem>> {
        Ok(self
            .inner
            .list(prefix)
            .await?
            .into_iter()
            .map(|item| self.with_etag(item))
            .collect())
    }

    async fn head(&self, key: &str) -> AnyResult<Option<BackupItem>> {
        Ok(self.inner.head(key).await?.map(|item| self.with_etag(item)))
    }

    async fn delete(&self, keys: &[String]) -> AnyResult<()> {
        self.inner.delete(keys).await
    }

    fn get_bucket(&self) -> &str {
        self.inner.get_bucket()
    }
}

/// Doesn't run anything. Dump commands (`... > path`) get a small gzip-ish
/// file written to their output path so uploads have something to send.
#[derive(Default)]
pub struct FakeRunner {
    pub scripts: Mutex<Vec<String>>,
    pub fail_on: Option<&'static str>,
}

impl FakeRunner {
    pub fn failing_on(needle: &'static str) -> Self {
        Self {
            fail_on: Some(needle),
            ..Self::default()
        }
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

fn redirect_target(script: &str) -> Option<PathBuf> {
    let (_, target) = script.rsplit_once(" > ")?;
    Some(PathBuf::from(target.trim().trim_matches('\'')))
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, script: &str, _env: &Env) -> Result<i32> {
        self.scripts.lock().unwrap().push(script.to_string());
        if let Some(needle) = self.fail_on {
            if script.contains(needle) {
                return Ok(1);
            }
        }
        if let Some(path) = redirect_target(script) {
            fs::write(&path, format!("dump for {script}"))?;
        }
        Ok(0)
    }

    fn has_tool(&self, _name: &str) -> bool {
        true
    }
}

/// Every snapshot becomes available immediately unless its instance is
/// listed as missing.
#[derive(Default)]
pub struct FakeSnapshots {
    pub missing: Vec<String>,
    pub created: Mutex<Vec<String>>,
}

#[async_trait]
impl SnapshotApi for FakeSnapshots {
    async fn create_snapshot(&self, instance: &str, snapshot_id: &str) -> Result<SnapshotHandle> {
        if self.missing.iter().any(|m| m == instance) {
            return Err(Error::NotFound(format!("RDS instance {instance:?}")));
        }
        self.created.lock().unwrap().push(snapshot_id.to_string());
        Ok(SnapshotHandle {
            id: snapshot_id.to_string(),
            status: Some("creating".to_string()),
        })
    }

    async fn snapshot_status(&self, _snapshot_id: &str) -> Result<String> {
        Ok("available".to_string())
    }
}

/// Writes `<project>-backup.yaml` into `dir`.
pub fn write_descriptor(dir: &Path, project: &str, yaml: &str) -> PathBuf {
    let path = dir.join(format!("{project}-backup.yaml"));
    fs::write(&path, yaml).unwrap();
    path
}
