//! Filesystem backend

use super::{
    BackendCompactor, BackendReader, BackendWriter, COMPACTED_META_NAME, META_NAME,
};
use crate::{CompactedBlockMeta, Result, SpanError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

/// Backend storing each object as a file under `<root>/<tenant>/<block_id>/`
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory if needed
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, block_id: Uuid, tenant_id: &str) -> PathBuf {
        self.root.join(tenant_id).join(block_id.to_string())
    }

    fn object_path(&self, name: &str, block_id: Uuid, tenant_id: &str) -> PathBuf {
        self.block_path(block_id, tenant_id).join(name)
    }

    async fn list_dirs(path: &Path) -> Result<Vec<String>> {
        let mut dirs = Vec::new();
        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    dirs.push(name.to_string());
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn not_found(e: std::io::Error, path: &Path) -> SpanError {
    if e.kind() == ErrorKind::NotFound {
        SpanError::DoesNotExist(path.display().to_string())
    } else {
        SpanError::Io(e)
    }
}

#[async_trait]
impl BackendReader for LocalBackend {
    async fn read(&self, name: &str, block_id: Uuid, tenant_id: &str, _should_cache: bool) -> Result<Bytes> {
        let path = self.object_path(name, block_id, tenant_id);
        let data = fs::read(&path).await.map_err(|e| not_found(e, &path))?;
        Ok(Bytes::from(data))
    }

    async fn read_range(
        &self,
        name: &str,
        block_id: Uuid,
        tenant_id: &str,
        offset: u64,
        buf: &mut [u8],
        _should_cache: bool,
    ) -> Result<()> {
        let path = self.object_path(name, block_id, tenant_id);
        let mut file = fs::File::open(&path).await.map_err(|e| not_found(e, &path))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn tenants(&self) -> Result<Vec<String>> {
        Self::list_dirs(&self.root).await
    }

    async fn blocks(&self, tenant_id: &str) -> Result<Vec<Uuid>> {
        let dirs = Self::list_dirs(&self.root.join(tenant_id)).await?;
        Ok(dirs.iter().filter_map(|d| Uuid::parse_str(d).ok()).collect())
    }
}

#[async_trait]
impl BackendWriter for LocalBackend {
    async fn write(&self, name: &str, block_id: Uuid, tenant_id: &str, data: Bytes, _should_cache: bool) -> Result<()> {
        Self::write_atomic(&self.object_path(name, block_id, tenant_id), &data).await
    }
}

#[async_trait]
impl BackendCompactor for LocalBackend {
    async fn mark_block_compacted(&self, block_id: Uuid, tenant_id: &str) -> Result<()> {
        let meta = self.block_meta(block_id, tenant_id).await?;
        let compacted = meta.into_compacted(Utc::now());
        let json = serde_json::to_vec(&compacted)?;

        Self::write_atomic(&self.object_path(COMPACTED_META_NAME, block_id, tenant_id), &json).await?;
        let active = self.object_path(META_NAME, block_id, tenant_id);
        fs::remove_file(&active).await.map_err(|e| not_found(e, &active))
    }

    async fn clear_compacted(&self, block_id: Uuid, tenant_id: &str) -> Result<()> {
        let compacted = self.compacted_block_meta(block_id, tenant_id).await?;
        let json = serde_json::to_vec(&compacted.meta)?;

        Self::write_atomic(&self.object_path(META_NAME, block_id, tenant_id), &json).await?;
        let retired = self.object_path(COMPACTED_META_NAME, block_id, tenant_id);
        fs::remove_file(&retired).await.map_err(|e| not_found(e, &retired))
    }

    async fn clear_block(&self, block_id: Uuid, tenant_id: &str) -> Result<()> {
        match fs::remove_dir_all(self.block_path(block_id, tenant_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn compacted_block_meta(&self, block_id: Uuid, tenant_id: &str) -> Result<CompactedBlockMeta> {
        let bytes = self.read(COMPACTED_META_NAME, block_id, tenant_id, false).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockMeta, BlockVersion, Encoding};
    use tempfile::TempDir;

    fn meta(tenant: &str) -> BlockMeta {
        let mut meta = BlockMeta::new(tenant, Uuid::new_v4(), BlockVersion::V2, Encoding::None, "v1");
        meta.object_added(&[1], 100, 200);
        meta
    }

    #[tokio::test]
    async fn test_write_read_range() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let id = Uuid::new_v4();

        backend
            .write("data", id, "t", Bytes::from_static(b"0123456789"), false)
            .await
            .unwrap();
        assert_eq!(&backend.read("data", id, "t", false).await.unwrap()[..], b"0123456789");

        let mut buf = [0u8; 3];
        backend.read_range("data", id, "t", 4, &mut buf, false).await.unwrap();
        assert_eq!(&buf, b"456");

        let err = backend.read("nope", id, "t", false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_listing() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        assert!(backend.tenants().await.unwrap().is_empty());
        assert!(backend.blocks("t").await.unwrap().is_empty());

        let m1 = meta("a");
        let m2 = meta("b");
        backend.write_block_meta(&m1).await.unwrap();
        backend.write_block_meta(&m2).await.unwrap();

        assert_eq!(backend.tenants().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(backend.blocks("a").await.unwrap(), vec![m1.block_id]);
        assert_eq!(backend.block_meta(m1.block_id, "a").await.unwrap(), m1);
    }

    #[tokio::test]
    async fn test_compaction_lifecycle() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let m = meta("t");
        backend.write_block_meta(&m).await.unwrap();

        backend.mark_block_compacted(m.block_id, "t").await.unwrap();
        assert!(backend.block_meta(m.block_id, "t").await.unwrap_err().is_not_found());
        let compacted = backend.compacted_block_meta(m.block_id, "t").await.unwrap();
        assert_eq!(compacted.meta, m);

        backend.clear_compacted(m.block_id, "t").await.unwrap();
        assert_eq!(backend.block_meta(m.block_id, "t").await.unwrap(), m);
        assert!(backend.compacted_block_meta(m.block_id, "t").await.is_err());

        backend.clear_block(m.block_id, "t").await.unwrap();
        assert!(backend.blocks("t").await.unwrap().is_empty());
        // deleting twice is fine
        backend.clear_block(m.block_id, "t").await.unwrap();
    }
}
