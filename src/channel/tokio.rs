//! Production channel backed by the local filesystem.
//!
//! Files are opened through [`tokio::fs`] and then converted into blocking
//! [`std::fs::File`] handles so that each operation can issue one positional
//! syscall (`pread`/`pwrite` via [`std::os::unix::fs::FileExt`]) on the tokio
//! blocking pool. The durability barrier uses `sync_data`, which persists
//! file contents without forcing a metadata flush.

use crate::{channel, Error};
use bytes::{Bytes, BytesMut};
use std::{fs::File, path::Path, sync::Arc};
use tokio::{fs, task};

/// Filesystem-backed [`channel::Backend`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Backend;

impl Backend {
    pub fn new() -> Self {
        Self
    }
}

impl channel::Backend for Backend {
    type Channel = Channel;

    async fn open(&self, path: &Path, create: bool) -> Result<Channel, Error> {
        let mut options = fs::OpenOptions::new();
        options.read(true).write(true);
        if create {
            options.create_new(true);
        }
        let file = options
            .open(path)
            .await
            .map_err(|e| Error::OpenFailed(path.display().to_string(), e))?;

        // Convert to a blocking std::fs::File to use positional I/O
        let file = file.into_std().await;

        Ok(Channel {
            path: path.display().to_string(),
            file: Arc::new(file),
        })
    }

    async fn remove(&self, path: &Path) -> Result<(), Error> {
        fs::remove_file(path)
            .await
            .map_err(|e| Error::RemoveFailed(path.display().to_string(), e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        fs::rename(from, to).await.map_err(|e| {
            Error::RenameFailed(from.display().to_string(), to.display().to_string(), e)
        })
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<(), Error> {
        fs::copy(from, to).await.map(|_| ()).map_err(|e| {
            Error::CopyFailed(from.display().to_string(), to.display().to_string(), e)
        })
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }
}

/// Filesystem-backed [`channel::Channel`].
#[derive(Clone)]
pub struct Channel {
    path: String,
    file: Arc<File>,
}

impl channel::Channel for Channel {
    async fn read_at(
        &self,
        mut buf: BytesMut,
        start: usize,
        offset: u64,
    ) -> Result<(BytesMut, usize), Error> {
        let file = self.file.clone();
        let path = self.path.clone();
        task::spawn_blocking(move || {
            #[cfg(unix)]
            let read = {
                use std::os::unix::fs::FileExt;
                file.read_at(&mut buf[start..], offset)
                    .map_err(|e| Error::ReadFailed(path, e))?
            };
            #[cfg(windows)]
            let read = {
                use std::os::windows::fs::FileExt;
                file.seek_read(&mut buf[start..], offset)
                    .map_err(|e| Error::ReadFailed(path, e))?
            };
            Ok((buf, read))
        })
        .await
        .map_err(|_| Error::TaskAborted)?
    }

    async fn write_at(&self, buf: Bytes, offset: u64) -> Result<usize, Error> {
        let file = self.file.clone();
        let path = self.path.clone();
        task::spawn_blocking(move || {
            #[cfg(unix)]
            let written = {
                use std::os::unix::fs::FileExt;
                file.write_at(&buf, offset)
                    .map_err(|e| Error::WriteFailed(path, e))?
            };
            #[cfg(windows)]
            let written = {
                use std::os::windows::fs::FileExt;
                file.seek_write(&buf, offset)
                    .map_err(|e| Error::WriteFailed(path, e))?
            };
            Ok(written)
        })
        .await
        .map_err(|_| Error::TaskAborted)?
    }

    async fn size(&self) -> Result<u64, Error> {
        let file = self.file.clone();
        let path = self.path.clone();
        task::spawn_blocking(move || {
            file.metadata()
                .map(|metadata| metadata.len())
                .map_err(|e| Error::ReadFailed(path, e))
        })
        .await
        .map_err(|_| Error::TaskAborted)?
    }

    async fn truncate(&self, len: u64) -> Result<(), Error> {
        let file = self.file.clone();
        let path = self.path.clone();
        task::spawn_blocking(move || {
            file.set_len(len)
                .map_err(|e| Error::TruncateFailed(path, e))
        })
        .await
        .map_err(|_| Error::TaskAborted)?
    }

    async fn sync(&self) -> Result<(), Error> {
        let file = self.file.clone();
        let path = self.path.clone();
        task::spawn_blocking(move || {
            file.sync_data().map_err(|e| Error::SyncFailed(path, e))
        })
        .await
        .map_err(|_| Error::TaskAborted)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::run_backend_tests;
    use rand::{Rng as _, SeedableRng};
    use std::env;

    #[tokio::test]
    async fn test_filesystem_backend() {
        let mut rng = rand::rngs::StdRng::from_entropy();
        let base = env::temp_dir().join(format!("blockfile_tokio_{}", rng.gen::<u64>()));
        std::fs::create_dir_all(&base).unwrap();

        run_backend_tests(Backend::new(), base.clone()).await;

        std::fs::remove_dir_all(&base).unwrap();
    }
}
