//! Remote store backed by a mounted directory (NFS share, external disk).

use super::{RemoteEntry, RemoteStore};
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RemoteStore for DirectoryStore {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    async fn upload(&self, local: &Path, remote_name: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let partial = self.dir.join(format!("{}.partial", remote_name));
        fs::copy(local, &partial).await?;
        fs::File::open(&partial).await?.sync_all().await?;
        fs::rename(&partial, self.dir.join(remote_name)).await?;
        Ok(())
    }

    async fn download(&self, remote_name: &str, local: &Path) -> Result<()> {
        fs::copy(self.dir.join(remote_name), local).await?;
        Ok(())
    }

    async fn exists(&self, remote_name: &str) -> Result<bool> {
        Ok(fs::try_exists(self.dir.join(remote_name)).await?)
    }

    async fn list(&self) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                entries.push(RemoteEntry {
                    file_name: entry.file_name().to_string_lossy().to_string(),
                    size_bytes: Some(metadata.len()),
                });
            }
        }
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(entries)
    }

    async fn delete(&self, remote_name: &str) -> Result<()> {
        match fs::remove_file(self.dir.join(remote_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
