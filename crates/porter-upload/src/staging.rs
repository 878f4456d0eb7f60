use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

/// Job-scoped directory holding private copies of the files being uploaded.
///
/// Copies keep the upload consistent if the caller edits or deletes a
/// source mid-batch. [`StagingArea::remove`] consumes the area, so it runs
/// at most once.
#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
}

/// Cloneable handle workers use to stage into the area.
#[derive(Debug, Clone)]
pub struct Stager {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub size: u64,
}

impl StagingArea {
    pub async fn create(temp_root: &Path, job_id: Uuid) -> io::Result<Self> {
        let root = temp_root.join(job_id.to_string());
        tokio::fs::create_dir_all(&root).await?;
        debug!(path = %root.display(), "staging area created");
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn stager(&self) -> Stager {
        Stager {
            root: self.root.clone(),
        }
    }

    pub async fn remove(self) {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(path = %self.root.display(), "staging area removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.root.display(), error = %err, "failed to remove staging area"),
        }
    }
}

impl Stager {
    pub async fn stage(&self, source: &Path) -> io::Result<StagedFile> {
        let path = self.root.join(Uuid::new_v4().to_string());
        tokio::fs::copy(source, &path).await?;
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(StagedFile { path, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn staged_copy_is_independent_of_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, b"draft one").unwrap();

        let area = StagingArea::create(&dir.path().join("staging"), Uuid::new_v4())
            .await
            .unwrap();
        let staged = area.stager().stage(&source).await.unwrap();
        std::fs::write(&source, b"rewritten later").unwrap();

        assert_eq!(staged.size, 9);
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"draft one");

        let root = area.path().to_path_buf();
        area.remove().await;
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn missing_source_fails_staging() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::create(dir.path(), Uuid::new_v4()).await.unwrap();
        let err = area
            .stager()
            .stage(&dir.path().join("absent.bin"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
