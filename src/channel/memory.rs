//! In-memory channel for tests and simulation.
//!
//! The backend maps paths to byte vectors; a channel shares the vector with
//! the map, so contents survive close and reopen. The durability barrier is
//! a no-op. A backend constructed with [`Backend::chunked`] caps the bytes
//! moved per operation, which deterministically exercises the partial-I/O
//! retry paths of callers.

use crate::{channel, Error};
use bytes::{Bytes, BytesMut};
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

type Content = Arc<RwLock<Vec<u8>>>;

/// In-memory [`channel::Backend`].
#[derive(Clone, Default)]
pub struct Backend {
    files: Arc<Mutex<BTreeMap<PathBuf, Content>>>,
    max_io: Option<usize>,
}

impl Backend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose channels move at most `max_io` bytes per operation.
    pub fn chunked(max_io: usize) -> Self {
        assert!(max_io > 0, "max_io must be positive");
        Self {
            files: Arc::default(),
            max_io: Some(max_io),
        }
    }
}

impl channel::Backend for Backend {
    type Channel = Channel;

    async fn open(&self, path: &Path, create: bool) -> Result<Channel, Error> {
        let mut files = self.files.lock().unwrap();
        let content = match files.get(path) {
            Some(_) if create => {
                return Err(Error::OpenFailed(
                    path.display().to_string(),
                    io::ErrorKind::AlreadyExists.into(),
                ))
            }
            Some(content) => content.clone(),
            None if create => {
                let content = Content::default();
                files.insert(path.to_path_buf(), content.clone());
                content
            }
            None => {
                return Err(Error::OpenFailed(
                    path.display().to_string(),
                    io::ErrorKind::NotFound.into(),
                ))
            }
        };
        Ok(Channel {
            content,
            max_io: self.max_io,
        })
    }

    async fn remove(&self, path: &Path) -> Result<(), Error> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| {
                Error::RemoveFailed(path.display().to_string(), io::ErrorKind::NotFound.into())
            })
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        let mut files = self.files.lock().unwrap();
        let content = files.remove(from).ok_or_else(|| {
            Error::RenameFailed(
                from.display().to_string(),
                to.display().to_string(),
                io::ErrorKind::NotFound.into(),
            )
        })?;
        files.insert(to.to_path_buf(), content);
        Ok(())
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<(), Error> {
        let mut files = self.files.lock().unwrap();
        let data = match files.get(from) {
            Some(content) => content.read().unwrap().clone(),
            None => {
                return Err(Error::CopyFailed(
                    from.display().to_string(),
                    to.display().to_string(),
                    io::ErrorKind::NotFound.into(),
                ))
            }
        };
        match files.get(to) {
            // Overwrite in place so open channels observe the new contents
            Some(content) => *content.write().unwrap() = data,
            None => {
                files.insert(to.to_path_buf(), Arc::new(RwLock::new(data)));
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }
}

/// In-memory [`channel::Channel`].
#[derive(Clone)]
pub struct Channel {
    content: Content,
    max_io: Option<usize>,
}

impl Channel {
    fn cap(&self, len: usize) -> usize {
        match self.max_io {
            Some(max_io) => len.min(max_io),
            None => len,
        }
    }
}

impl channel::Channel for Channel {
    async fn read_at(
        &self,
        mut buf: BytesMut,
        start: usize,
        offset: u64,
    ) -> Result<(BytesMut, usize), Error> {
        let offset: usize = offset.try_into().map_err(|_| Error::OffsetOverflow)?;
        let read = {
            let content = self.content.read().unwrap();
            if offset >= content.len() {
                0
            } else {
                let read = self.cap((content.len() - offset).min(buf.len() - start));
                buf[start..start + read].copy_from_slice(&content[offset..offset + read]);
                read
            }
        };
        Ok((buf, read))
    }

    async fn write_at(&self, buf: Bytes, offset: u64) -> Result<usize, Error> {
        let offset: usize = offset.try_into().map_err(|_| Error::OffsetOverflow)?;
        let written = self.cap(buf.len());
        let end = offset
            .checked_add(written)
            .ok_or(Error::OffsetOverflow)?;
        let mut content = self.content.write().unwrap();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(&buf[..written]);
        Ok(written)
    }

    async fn size(&self) -> Result<u64, Error> {
        Ok(self.content.read().unwrap().len() as u64)
    }

    async fn truncate(&self, len: u64) -> Result<(), Error> {
        let len: usize = len.try_into().map_err(|_| Error::OffsetOverflow)?;
        self.content.write().unwrap().resize(len, 0);
        Ok(())
    }

    async fn sync(&self) -> Result<(), Error> {
        Ok(())
    }
}
