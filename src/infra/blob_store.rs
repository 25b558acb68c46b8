//! 备份对象存储
//!
//! 快照以 `data/<cluster>/<file>` 为键存放。后端通过 `object_store` 支持
//! 本地目录与 S3 兼容服务（MinIO 等）。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::env::BlobSettings;
use crate::error::{AgentError, AgentResult};

/// 对象存储接口
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 上传本地文件，返回写入的字节数
    async fn upload(&self, local: &Path, key: &str) -> AgentResult<u64>;

    /// 下载对象到本地文件
    async fn download(&self, key: &str, local: &Path) -> AgentResult<u64>;

    /// 列出前缀下的全部键
    async fn list(&self, prefix: &str) -> AgentResult<Vec<String>>;

    /// 用于日志的后端描述
    fn describe(&self) -> String;
}

/// 基于 `object_store` 的实现
pub struct ObjectStoreBlobStore {
    store: Arc<dyn ObjectStore>,
    description: String,
}

impl ObjectStoreBlobStore {
    pub fn from_store(store: Arc<dyn ObjectStore>, description: impl Into<String>) -> Self {
        Self {
            store,
            description: description.into(),
        }
    }

    /// 本地目录后端，目录不存在时创建
    pub fn local(root: &Path) -> AgentResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| AgentError::transfer(format!("create blob root {}: {}", root.display(), e)))?;
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| AgentError::transfer(format!("open blob root {}: {}", root.display(), e)))?;
        Ok(Self::from_store(Arc::new(store), format!("file://{}", root.display())))
    }

    /// S3 兼容后端
    ///
    /// 存储桶必须已存在，`object_store` 不提供建桶操作。
    pub fn s3(
        endpoint: &str,
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        use_ssl: bool,
    ) -> AgentResult<Self> {
        let scheme = if use_ssl { "https" } else { "http" };
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("{}://{}", scheme, endpoint)
        };
        let store = AmazonS3Builder::new()
            .with_endpoint(&endpoint)
            .with_bucket_name(bucket)
            .with_region(region)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key)
            .with_allow_http(!use_ssl)
            .with_virtual_hosted_style_request(false)
            .build()
            .map_err(|e| AgentError::config(format!("invalid S3 settings: {}", e)))?;
        Ok(Self::from_store(Arc::new(store), format!("s3://{}/{}", endpoint, bucket)))
    }

    pub fn from_settings(settings: &BlobSettings) -> AgentResult<Self> {
        match settings {
            BlobSettings::Local { root } => Self::local(root),
            BlobSettings::S3 {
                endpoint,
                bucket,
                region,
                access_key,
                secret_key,
                use_ssl,
            } => Self::s3(endpoint, bucket, region, access_key, secret_key, *use_ssl),
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn upload(&self, local: &Path, key: &str) -> AgentResult<u64> {
        let location = ObjectPath::from(key);
        let mut source = tokio::fs::File::open(local)
            .await
            .map_err(|e| AgentError::transfer(format!("open {}: {}", local.display(), e)))?;
        let mut writer = BufWriter::new(Arc::clone(&self.store), location);
        let bytes = tokio::io::copy(&mut source, &mut writer)
            .await
            .map_err(|e| AgentError::transfer(format!("upload {} to {}: {}", local.display(), key, e)))?;
        writer
            .shutdown()
            .await
            .map_err(|e| AgentError::transfer(format!("finish upload of {}: {}", key, e)))?;
        info!(store = %self.description, key = %key, bytes, "Uploaded object");
        Ok(bytes)
    }

    async fn download(&self, key: &str, local: &Path) -> AgentResult<u64> {
        let location = ObjectPath::from(key);
        let result = self.store.get(&location).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => AgentError::transfer(format!("object {} not found", key)),
            e => AgentError::transfer(format!("get {}: {}", key, e)),
        })?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::transfer(format!("create {}: {}", parent.display(), e)))?;
        }
        let mut target = tokio::fs::File::create(local)
            .await
            .map_err(|e| AgentError::transfer(format!("create {}: {}", local.display(), e)))?;

        let mut bytes = 0u64;
        let mut stream = result.into_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AgentError::transfer(format!("read {}: {}", key, e)))?;
            target
                .write_all(&chunk)
                .await
                .map_err(|e| AgentError::transfer(format!("write {}: {}", local.display(), e)))?;
            bytes += chunk.len() as u64;
        }
        target
            .flush()
            .await
            .map_err(|e| AgentError::transfer(format!("flush {}: {}", local.display(), e)))?;
        debug!(store = %self.description, key = %key, bytes, "Downloaded object");
        Ok(bytes)
    }

    async fn list(&self, prefix: &str) -> AgentResult<Vec<String>> {
        let prefix = ObjectPath::from(prefix);
        let mut keys = Vec::new();
        let mut stream = self.store.list(Some(&prefix));
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| AgentError::transfer(format!("list {}: {}", prefix, e)))?;
            keys.push(meta.location.to_string());
        }
        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}
