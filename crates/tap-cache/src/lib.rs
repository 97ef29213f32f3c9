//! File-backed capture of request and response bodies. One cache per
//! exchange, two append-only files named by a shared uuid. Files come into
//! existence on the first nonempty append, so body-less exchanges leave
//! nothing behind, and they are never deleted here — the record consumer
//! owns their lifetime.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unable to open capture directory {dir}: {source}")]
    OpenFailed {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One captured body stream.
#[derive(Debug)]
pub struct BodyFile {
    path: PathBuf,
    file: Option<File>,
}

impl BodyFile {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_data(&self) -> bool {
        self.path.exists()
    }

    pub async fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }
        self.file.as_mut().expect("opened above").write_all(bytes).await
    }

    /// Flushes pending writes so a reader opened on `path()` sees every
    /// appended byte. Required before a replay read.
    pub async fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush().await,
            None => Ok(()),
        }
    }
}

/// The pair of capture files for one exchange. The halves are independent so
/// the request side can keep spooling while the response side is written
/// from the other relay direction.
#[derive(Debug)]
pub struct BodyCache {
    pub request: BodyFile,
    pub response: BodyFile,
}

impl BodyCache {
    pub async fn create(dir: &Path) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| CacheError::OpenFailed {
                dir: dir.to_path_buf(),
                source,
            })?;
        let base = Uuid::new_v4();
        Ok(Self {
            request: BodyFile::new(dir.join(format!("req-{base}"))),
            response: BodyFile::new(dir.join(format!("resp-{base}"))),
        })
    }

    pub fn into_parts(self) -> (BodyFile, BodyFile) {
        (self.request, self.response)
    }
}
