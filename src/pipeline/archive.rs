//! The archival store of processed records.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sled::{Config as SledConfig, Db, IVec, Tree};

use crate::error::DeliveryError;
use crate::pipeline::DeliveryResult;

/// The default path to use for archive storage.
pub const DEFAULT_ARCHIVE_PATH: &str = "/usr/local/sensorstream/archive";
/// The DB tree used for archived records.
const TREE_ARCHIVE: &str = "archive";

/// The default path to use for archive storage.
pub fn default_archive_path() -> String {
    DEFAULT_ARCHIVE_PATH.to_string()
}

/// A durable store of processed records, keyed by content.
///
/// Writes of the same key overwrite each other, so redelivered records are archived once.
#[async_trait]
pub trait ArchiveStore: Send + Sync + 'static {
    /// Durably write a record under the given key.
    async fn put(&self, key: &str, payload: Bytes) -> DeliveryResult<()>;
}

/// An archive store backed by sled.
#[derive(Clone)]
pub struct SledArchive {
    db: Db,
    tree: Tree,
}

impl SledArchive {
    /// Open the archive at the given path, creating it if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tokio::fs::create_dir_all(&path)
            .await
            .context("error creating dir for archive database")?;
        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(path).mode(sled::Mode::HighThroughput).open()?;
            let tree = db.open_tree(IVec::from(TREE_ARCHIVE)).context("error opening archive tree")?;
            Ok(Self { db, tree })
        })
        .await?
    }

    /// Get an archived record.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let (tree, key) = (self.tree.clone(), key.to_string());
        Self::spawn_blocking(move || -> Result<Option<Bytes>> {
            let val = tree.get(key.as_bytes()).context("error reading from archive")?;
            Ok(val.map(|val| Bytes::copy_from_slice(&val)))
        })
        .await?
    }

    /// The number of archived records.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Check if the archive holds no records.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Spawn a blocking database function.
    #[tracing::instrument(level = "trace", skip(f), err)]
    async fn spawn_blocking<F, R>(f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.context("error joining blocking archive task")
    }
}

#[async_trait]
impl ArchiveStore for SledArchive {
    async fn put(&self, key: &str, payload: Bytes) -> DeliveryResult<()> {
        let (db, tree, owned_key) = (self.db.clone(), self.tree.clone(), key.to_string());
        Self::spawn_blocking(move || -> Result<()> {
            tree.insert(owned_key.as_bytes(), payload.as_ref())
                .context("error inserting archive record")?;
            db.flush().context("error flushing archive")?;
            Ok(())
        })
        .await
        .and_then(|res| res)
        .map_err(|err| DeliveryError::Archive {
            key: key.to_string(),
            reason: format!("{:#}", err),
        })
    }
}
