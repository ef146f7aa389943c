use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::LogStoreConfig;
use crate::error::{ImportError, Result};
use crate::store::BlobStore;

/// Blob store backed by a local (or network-mounted) directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &LogStoreConfig) -> Self {
        Self::new(config.log_dir.clone(), config.log_base_url.clone())
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(ImportError::BlobStore(format!("invalid blob name: {name:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(
        &self,
        name: &str,
        size: usize,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        Self::validate_name(name)?;
        if size != content.len() {
            return Err(ImportError::BlobStore(format!(
                "declared size {size} does not match content length {}",
                content.len()
            )));
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(name);
        tokio::fs::write(&path, &content).await?;

        tracing::debug!(path = %path.display(), size, content_type, "Stored blob");
        Ok(format!("{}/{}", self.base_url, name))
    }
}
