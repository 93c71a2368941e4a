use crate::config::StorageConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
    Client as S3Client,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::{path::Path as ObjectStorePath, ObjectStore};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

// S3 caps DeleteObjects at 1000 keys per request
const DELETE_BATCH: usize = 1000;

/// Files this size or larger go up in parts of this size, which is what
/// S3-style multipart ETags are computed from.
pub const MULTIPART_CHUNK: u64 = 8 * 1024 * 1024;

#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn upload(&self, key: &str, file_path: &Path) -> Result<()>;
    async fn download(&self, key: &str, output_path: &Path) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<BackupItem>>;
    /// Metadata for a single key, `None` if it doesn't exist.
    async fn head(&self, key: &str) -> Result<Option<BackupItem>>;
    async fn delete(&self, keys: &[String]) -> Result<()>;
    fn get_bucket(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct BackupItem {
    pub key: String,
    pub size: u64,
    /// Quotes stripped. Only stores that compute S3-style ETags report one.
    pub e_tag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

fn aws_datetime(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn unquote(e_tag: &str) -> String {
    e_tag.trim_matches('"').to_string()
}

// AWS S3 and S3-compatible stores (MinIO, Wasabi, ...)
pub struct S3Provider {
    client: S3Client,
    bucket: String,
}

impl S3Provider {
    /// Static credentials when both keys are given, otherwise the default AWS
    /// credential chain (env, profile, instance role).
    pub async fn new(
        endpoint: Option<&str>,
        region: &str,
        bucket: &str,
        access_key: Option<&str>,
        secret_key: Option<&str>,
    ) -> Result<Self> {
        let region = aws_sdk_s3::config::Region::new(region.to_string());

        let mut builder = match (access_key, secret_key) {
            (Some(access_key), Some(secret_key)) => {
                use aws_credential_types::Credentials;
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "stash-backup");
                aws_sdk_s3::Config::builder()
                    .region(region)
                    .credentials_provider(credentials)
            }
            _ => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: S3Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
        })
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, file_path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::open(file_path)
            .await
            .with_context(|| format!("Failed to read file: {}", file_path.display()))?;

        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let mut chunk = Vec::with_capacity(MULTIPART_CHUNK as usize);
            (&mut file)
                .take(MULTIPART_CHUNK)
                .read_to_end(&mut chunk)
                .await
                .with_context(|| format!("Failed to read file: {}", file_path.display()))?;
            if chunk.is_empty() {
                break;
            }

            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .with_context(|| format!("Failed to upload part {} of {}", part_number, key))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to complete multipart upload: {}", key))?;
        Ok(())
    }

    async fn upload_multipart(&self, key: &str, file_path: &Path) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to start multipart upload: {}", key))?;
        let upload_id = created
            .upload_id()
            .context("S3 returned no multipart upload id")?
            .to_string();

        let result = self.upload_parts(key, &upload_id, file_path).await;
        if result.is_err() {
            warn!("Aborting multipart upload of {}", key);
            if let Err(err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!("Failed to abort multipart upload of {}: {}", key, err);
            }
        }
        result
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    async fn upload(&self, key: &str, file_path: &Path) -> Result<()> {
        info!("Uploading {} to s3://{}...", key, self.bucket);
        let size = tokio::fs::metadata(file_path)
            .await
            .with_context(|| format!("Failed to read file: {}", file_path.display()))?
            .len();
        if size >= MULTIPART_CHUNK {
            self.upload_multipart(key, file_path).await?;
            info!("Successfully uploaded: {}", key);
            return Ok(());
        }

        let body = ByteStream::from_path(file_path)
            .await
            .with_context(|| format!("Failed to read file: {}", file_path.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload to S3: {}", key))?;

        info!("Successfully uploaded: {}", key);
        Ok(())
    }

    async fn download(&self, key: &str, output_path: &Path) -> Result<()> {
        info!("Downloading s3://{}/{}...", self.bucket, key);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download from S3: {}", key))?;

        let mut file = tokio::fs::File::create(output_path)
            .await
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;
        let mut body = response.body.into_async_read();
        tokio::io::copy(&mut body, &mut file)
            .await
            .context("Failed to write S3 object to file")?;

        info!("Downloaded to: {}", output_path.display());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupItem>> {
        let mut items = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.context("Failed to list S3 objects")?;

            for obj in response.contents() {
                if let Some(key) = obj.key() {
                    items.push(BackupItem {
                        key: key.to_string(),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        e_tag: obj.e_tag().map(unquote),
                        last_modified: obj.last_modified().and_then(aws_datetime),
                    });
                }
            }

            continuation_token = response.next_continuation_token().map(|s| s.to_string());
            if response.is_truncated() != Some(true) {
                break;
            }
        }

        debug!("listed {} objects under {:?}", items.len(), prefix);
        Ok(items)
    }

    async fn head(&self, key: &str) -> Result<Option<BackupItem>> {
        let response = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                return Ok(None)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to stat S3 object: {}", key))
            }
        };

        Ok(Some(BackupItem {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            e_tag: response.e_tag().map(unquote),
            last_modified: response.last_modified().and_then(aws_datetime),
        }))
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("Failed to build S3 delete request")?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .context("Failed to build S3 delete request")?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .context("Failed to delete S3 objects")?;
        }
        info!("Deleted {} objects from s3://{}", keys.len(), self.bucket);
        Ok(())
    }

    fn get_bucket(&self) -> &str {
        &self.bucket
    }
}

/// Google Cloud Storage, Azure Blob Storage, a local directory or memory,
/// all through the `object_store` crate.
pub struct ObjectStoreProvider {
    store: Arc<dyn ObjectStore>,
    label: &'static str,
    bucket: String,
}

impl ObjectStoreProvider {
    pub fn new(store: Arc<dyn ObjectStore>, label: &'static str, bucket: &str) -> Self {
        Self {
            store,
            label,
            bucket: bucket.to_string(),
        }
    }

    pub fn gcs(bucket: &str, credentials_path: Option<&str>) -> Result<Self> {
        use object_store::gcp::GoogleCloudStorageBuilder;

        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = credentials_path {
            builder = builder.with_service_account_path(path);
        }
        let store = builder.build().context(
            "Failed to build GCS client. Set credentials_path or GOOGLE_APPLICATION_CREDENTIALS.",
        )?;
        Ok(Self::new(Arc::new(store), "GCS", bucket))
    }

    pub fn azure(account_name: &str, account_key: Option<&str>, container: &str) -> Result<Self> {
        use object_store::azure::MicrosoftAzureBuilder;

        let access_key = match account_key {
            Some(key) => key.to_string(),
            None => std::env::var("AZURE_STORAGE_ACCOUNT_KEY").map_err(|_| {
                anyhow::anyhow!(
                    "Azure account_key required. Set it in config or use AZURE_STORAGE_ACCOUNT_KEY"
                )
            })?,
        };

        let store = MicrosoftAzureBuilder::new()
            .with_account(account_name)
            .with_container_name(container)
            .with_access_key(access_key)
            .build()
            .context("Failed to build Azure client. Check account_name and account_key.")?;
        Ok(Self::new(Arc::new(store), "Azure", container))
    }

    /// Objects stored as files under `root/<bucket>/`.
    pub fn local(root: &Path, bucket: &str) -> Result<Self> {
        use object_store::local::LocalFileSystem;

        let dir = root.join(bucket);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory: {}", dir.display()))?;
        let store = LocalFileSystem::new_with_prefix(&dir)
            .with_context(|| format!("Failed to open storage directory: {}", dir.display()))?;
        Ok(Self::new(Arc::new(store), "local", bucket))
    }

    pub fn memory(bucket: &str) -> Self {
        Self::new(
            Arc::new(object_store::memory::InMemory::new()),
            "memory",
            bucket,
        )
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    async fn upload(&self, key: &str, file_path: &Path) -> Result<()> {
        info!("Uploading {} to {}...", key, self.label);
        let data = tokio::fs::read(file_path)
            .await
            .with_context(|| format!("Failed to read file: {}", file_path.display()))?;

        self.store
            .put(&ObjectStorePath::from(key), data.into())
            .await
            .with_context(|| format!("Failed to upload to {}: {}", self.label, key))?;

        info!("Successfully uploaded: {}", key);
        Ok(())
    }

    async fn download(&self, key: &str, output_path: &Path) -> Result<()> {
        info!("Downloading {} from {}...", key, self.label);
        let data = self
            .store
            .get(&ObjectStorePath::from(key))
            .await
            .with_context(|| format!("Failed to download from {}: {}", self.label, key))?
            .bytes()
            .await
            .context("Failed to read object data")?;

        tokio::fs::write(output_path, &data)
            .await
            .with_context(|| format!("Failed to write output file: {}", output_path.display()))?;

        info!("Downloaded to: {}", output_path.display());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupItem>> {
        let prefix_path = if prefix.is_empty() {
            None
        } else {
            Some(ObjectStorePath::from(prefix))
        };

        let mut stream = self.store.list(prefix_path.as_ref());
        let mut items = Vec::new();

        while let Some(meta) = stream.next().await {
            let meta = meta.with_context(|| format!("Failed to list {} objects", self.label))?;
            items.push(BackupItem {
                key: meta.location.to_string(),
                size: meta.size,
                e_tag: None,
                last_modified: Some(meta.last_modified),
            });
        }

        Ok(items)
    }

    async fn head(&self, key: &str) -> Result<Option<BackupItem>> {
        match self.store.head(&ObjectStorePath::from(key)).await {
            Ok(meta) => Ok(Some(BackupItem {
                key: key.to_string(),
                size: meta.size,
                e_tag: None,
                last_modified: Some(meta.last_modified),
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to stat {} object: {}", self.label, key))
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.store
                .delete(&ObjectStorePath::from(key.as_str()))
                .await
                .with_context(|| format!("Failed to delete {} object: {}", self.label, key))?;
        }
        info!("Deleted {} objects from {}", keys.len(), self.label);
        Ok(())
    }

    fn get_bucket(&self) -> &str {
        &self.bucket
    }
}

pub enum Provider {
    S3(S3Provider),
    Store(ObjectStoreProvider),
}

impl Provider {
    pub async fn from_config(bucket: &str, config: &StorageConfig) -> Result<Self> {
        match config.provider.as_str() {
            "s3" | "aws" | "minio" | "wasabi" => {
                let provider = S3Provider::new(
                    config.endpoint.as_deref(),
                    &config.region,
                    bucket,
                    config.access_key.as_deref(),
                    config.secret_key.as_deref(),
                )
                .await?;
                Ok(Provider::S3(provider))
            }
            "gcs" | "google" => Ok(Provider::Store(ObjectStoreProvider::gcs(
                bucket,
                config.credentials_path.as_deref(),
            )?)),
            "azure" => {
                let account_name = config
                    .account_name
                    .as_deref()
                    .context("Azure account_name required")?;
                Ok(Provider::Store(ObjectStoreProvider::azure(
                    account_name,
                    config.account_key.as_deref(),
                    bucket,
                )?))
            }
            "local" => {
                let root = config
                    .root
                    .as_deref()
                    .context("Local storage requires storage.root")?;
                Ok(Provider::Store(ObjectStoreProvider::local(root, bucket)?))
            }
            "memory" => Ok(Provider::Store(ObjectStoreProvider::memory(bucket))),
            _ => Err(anyhow::anyhow!("Unknown provider: {}", config.provider)),
        }
    }
}

#[async_trait]
impl StorageProvider for Provider {
    async fn upload(&self, key: &str, file_path: &Path) -> Result<()> {
        match self {
            Provider::S3(p) => p.upload(key, file_path).await,
            Provider::Store(p) => p.upload(key, file_path).await,
        }
    }

    async fn download(&self, key: &str, output_path: &Path) -> Result<()> {
        match self {
            Provider::S3(p) => p.download(key, output_path).await,
            Provider::Store(p) => p.download(key, output_path).await,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupItem>> {
        match self {
            Provider::S3(p) => p.list(prefix).await,
            Provider::Store(p) => p.list(prefix).await,
        }
    }

    async fn head(&self, key: &str) -> Result<Option<BackupItem>> {
        match self {
            Provider::S3(p) => p.head(key).await,
            Provider::Store(p) => p.head(key).await,
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        match self {
            Provider::S3(p) => p.delete(keys).await,
            Provider::Store(p) => p.delete(keys).await,
        }
    }

    fn get_bucket(&self) -> &str {
        match self {
            Provider::S3(p) => p.get_bucket(),
            Provider::Store(p) => p.get_bucket(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("dump.gz");
        std::fs::write(&local, b"some bytes").unwrap();

        let provider = ObjectStoreProvider::memory("backups");
        provider.upload("lax/202601/x.gz", &local).await.unwrap();

        let head = provider.head("lax/202601/x.gz").await.unwrap().unwrap();
        assert_eq!(head.size, 10);
        assert!(provider.head("lax/202601/nope.gz").await.unwrap().is_none());

        let out = dir.path().join("out.gz");
        provider.download("lax/202601/x.gz", &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"some bytes");

        provider.delete(&["lax/202601/x.gz".to_string()]).await.unwrap();
        assert!(provider.list("lax/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_prefix_is_per_project() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("a.gz");
        std::fs::write(&local, b"a").unwrap();

        let provider = ObjectStoreProvider::memory("backups");
        provider.upload("lax/202601/a.gz", &local).await.unwrap();
        provider.upload("laxative/202601/a.gz", &local).await.unwrap();

        let listed = provider.list("lax/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "lax/202601/a.gz");
    }

    #[tokio::test]
    async fn test_local_store() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("a.gz");
        std::fs::write(&local, b"abc").unwrap();

        let config = StorageConfig {
            provider: "local".to_string(),
            root: Some(dir.path().join("store")),
            ..StorageConfig::default()
        };
        let provider = Provider::from_config("backups", &config).await.unwrap();
        provider.upload("p/1/k.gz", &local).await.unwrap();

        assert!(dir.path().join("store/backups/p/1/k.gz").exists());
        assert_eq!(provider.get_bucket(), "backups");
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let config = StorageConfig {
            provider: "floppy".to_string(),
            ..StorageConfig::default()
        };
        assert!(Provider::from_config("backups", &config).await.is_err());
    }
}
