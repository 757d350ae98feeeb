//! Channel wrappers that track I/O metrics.

use crate::{channel, Error};
use bytes::{Bytes, BytesMut};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{path::Path, sync::Arc};

pub struct Metrics {
    pub file_opens: Counter,
    pub file_reads: Counter,
    pub file_read_bytes: Counter,
    pub file_writes: Counter,
    pub file_write_bytes: Counter,
    pub file_syncs: Counter,
    pub file_truncates: Counter,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics in the provided registry.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            file_opens: Counter::default(),
            file_reads: Counter::default(),
            file_read_bytes: Counter::default(),
            file_writes: Counter::default(),
            file_write_bytes: Counter::default(),
            file_syncs: Counter::default(),
            file_truncates: Counter::default(),
        };

        registry.register(
            "file_opens",
            "Total number of files opened",
            metrics.file_opens.clone(),
        );
        registry.register(
            "file_reads",
            "Total number of disk reads",
            metrics.file_reads.clone(),
        );
        registry.register(
            "file_read_bytes",
            "Total amount of data read from disk",
            metrics.file_read_bytes.clone(),
        );
        registry.register(
            "file_writes",
            "Total number of disk writes",
            metrics.file_writes.clone(),
        );
        registry.register(
            "file_write_bytes",
            "Total amount of data written to disk",
            metrics.file_write_bytes.clone(),
        );
        registry.register(
            "file_syncs",
            "Total number of durability barriers issued",
            metrics.file_syncs.clone(),
        );
        registry.register(
            "file_truncates",
            "Total number of truncations",
            metrics.file_truncates.clone(),
        );

        metrics
    }
}

/// A wrapper around a [`channel::Backend`] that tracks metrics.
#[derive(Clone)]
pub struct MeteredBackend<B> {
    inner: B,
    metrics: Arc<Metrics>,
}

impl<B> MeteredBackend<B> {
    pub fn new(inner: B, registry: &mut Registry) -> Self {
        Self {
            inner,
            metrics: Metrics::new(registry).into(),
        }
    }
}

impl<B: channel::Backend> channel::Backend for MeteredBackend<B> {
    type Channel = MeteredChannel<B::Channel>;

    async fn open(&self, path: &Path, create: bool) -> Result<Self::Channel, Error> {
        let inner = self.inner.open(path, create).await?;
        self.metrics.file_opens.inc();
        Ok(MeteredChannel {
            inner,
            metrics: self.metrics.clone(),
        })
    }

    async fn remove(&self, path: &Path) -> Result<(), Error> {
        self.inner.remove(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        self.inner.rename(from, to).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<(), Error> {
        self.inner.copy(from, to).await
    }

    async fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path).await
    }
}

/// A wrapper around a [`channel::Channel`] that tracks metrics.
#[derive(Clone)]
pub struct MeteredChannel<C> {
    inner: C,
    metrics: Arc<Metrics>,
}

impl<C: channel::Channel> channel::Channel for MeteredChannel<C> {
    async fn read_at(
        &self,
        buf: BytesMut,
        start: usize,
        offset: u64,
    ) -> Result<(BytesMut, usize), Error> {
        let (buf, read) = self.inner.read_at(buf, start, offset).await?;
        self.metrics.file_reads.inc();
        self.metrics.file_read_bytes.inc_by(read as u64);
        Ok((buf, read))
    }

    async fn write_at(&self, buf: Bytes, offset: u64) -> Result<usize, Error> {
        let written = self.inner.write_at(buf, offset).await?;
        self.metrics.file_writes.inc();
        self.metrics.file_write_bytes.inc_by(written as u64);
        Ok(written)
    }

    async fn size(&self) -> Result<u64, Error> {
        self.inner.size().await
    }

    async fn truncate(&self, len: u64) -> Result<(), Error> {
        self.inner.truncate(len).await?;
        self.metrics.file_truncates.inc();
        Ok(())
    }

    async fn sync(&self) -> Result<(), Error> {
        self.inner.sync().await?;
        self.metrics.file_syncs.inc();
        Ok(())
    }
}
