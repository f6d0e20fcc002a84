use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Append-only writer for the per-user run log.
///
/// Lines arrive from the stream reader with their terminators intact and are
/// written as-is, flushed after every write so a concurrent tail observes
/// output with at most one line of latency. The file is never seeked or
/// truncated; it only goes away when the workspace is cleared or a new bot
/// replaces the old one.
pub struct LogAppender {
    path: PathBuf,
    file: tokio::fs::File,
}

impl LogAppender {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, text: &str) -> std::io::Result<()> {
        self.file.write_all(text.as_bytes()).await?;
        self.file.flush().await
    }
}
