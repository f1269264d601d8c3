//! Content-addressed blob store.
//!
//! Layout: `server_files/<first-two-hex>/<hex>[.thumbnail]`, sharded 256
//! ways by the digest's leading byte; every shard directory is created at
//! boot. Writes go to a temp file in the shard and rename into place, so a
//! reader never observes a partial blob and concurrent identical writes
//! settle on the same bytes. Deletion happens only through the deferred
//! queue; this type never decides what is deletable.

use std::path::{Path, PathBuf};

use hoard_core::id::{FileHash, UpdateHash};
use snafu::{ResultExt as _, Snafu};
use tokio::io::AsyncWriteExt as _;
use tracing::debug;

const LOG_TARGET: &str = "hoard::blob";

const THUMBNAIL_SUFFIX: &str = ".thumbnail";

#[derive(Debug, Snafu)]
pub enum BlobError {
    #[snafu(display("Blob store io error at {}", path.display()))]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type BlobResult<T> = std::result::Result<T, BlobError>;

/// Which face of a hash a blob is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    File,
    Thumbnail,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open the store, creating the root and all 256 shard directories.
    pub async fn open(root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        for byte in 0u16..=0xff {
            let shard = root.join(format!("{byte:02x}"));
            tokio::fs::create_dir_all(&shard)
                .await
                .context(IoSnafu { path: shard })?;
        }
        debug!(target: LOG_TARGET, root = %root.display(), "Blob store open");
        Ok(Self { root })
    }

    fn path_for_hex(&self, hex: &str, kind: BlobKind) -> PathBuf {
        let shard = self.root.join(&hex[..2]);
        match kind {
            BlobKind::File => shard.join(hex),
            BlobKind::Thumbnail => shard.join(format!("{hex}{THUMBNAIL_SUFFIX}")),
        }
    }

    pub fn file_path(&self, hash: FileHash) -> PathBuf {
        self.path_for_hex(&hash.to_string(), BlobKind::File)
    }

    pub fn thumbnail_path(&self, hash: FileHash) -> PathBuf {
        self.path_for_hex(&hash.to_string(), BlobKind::Thumbnail)
    }

    pub fn update_path(&self, hash: UpdateHash) -> PathBuf {
        self.path_for_hex(&hash.to_string(), BlobKind::File)
    }

    /// Atomic-rename write; a no-op when the blob already exists.
    async fn put_at(&self, path: &Path, bytes: &[u8]) -> BlobResult<()> {
        if tokio::fs::try_exists(path)
            .await
            .context(IoSnafu { path })?
        {
            return Ok(());
        }

        // unique per write: concurrent writers of the same blob must not
        // clobber each other's temp files
        static TMP_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let serial = TMP_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(
            "{file_name}.{}.{serial}.tmp",
            std::process::id()
        ));
        {
            let mut f = tokio::fs::File::create(&tmp)
                .await
                .context(IoSnafu { path: tmp.clone() })?;
            f.write_all(bytes)
                .await
                .context(IoSnafu { path: tmp.clone() })?;
            f.sync_all()
                .await
                .context(IoSnafu { path: tmp.clone() })?;
        }
        tokio::fs::rename(&tmp, path)
            .await
            .context(IoSnafu { path })?;
        Ok(())
    }

    pub async fn put_file(&self, hash: FileHash, bytes: &[u8]) -> BlobResult<()> {
        self.put_at(&self.file_path(hash), bytes).await
    }

    pub async fn put_thumbnail(&self, hash: FileHash, bytes: &[u8]) -> BlobResult<()> {
        self.put_at(&self.thumbnail_path(hash), bytes).await
    }

    pub async fn put_update(&self, hash: UpdateHash, bytes: &[u8]) -> BlobResult<()> {
        self.put_at(&self.update_path(hash), bytes).await
    }

    pub async fn exists(&self, hash: FileHash, kind: BlobKind) -> BlobResult<bool> {
        let path = self.path_for_hex(&hash.to_string(), kind);
        tokio::fs::try_exists(&path).await.context(IoSnafu { path })
    }

    /// Open a blob for streaming; `None` when absent.
    pub async fn open_read(
        &self,
        hash: FileHash,
        kind: BlobKind,
    ) -> BlobResult<Option<tokio::fs::File>> {
        let path = self.path_for_hex(&hash.to_string(), kind);
        match tokio::fs::File::open(&path).await {
            Ok(f) => Ok(Some(f)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(IoSnafu { path }),
        }
    }

    pub async fn read(&self, hash: FileHash, kind: BlobKind) -> BlobResult<Option<Vec<u8>>> {
        let path = self.path_for_hex(&hash.to_string(), kind);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(IoSnafu { path }),
        }
    }

    pub async fn read_update(&self, hash: UpdateHash) -> BlobResult<Option<Vec<u8>>> {
        let path = self.update_path(hash);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(IoSnafu { path }),
        }
    }

    /// Physically remove a blob. Missing files count as success so a
    /// half-completed earlier pass can be retried.
    pub async fn remove(&self, hash: FileHash, kind: BlobKind) -> BlobResult<()> {
        let path = self.path_for_hex(&hash.to_string(), kind);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(IoSnafu { path }),
        }
    }

    /// Total bytes on disk across all shards; maintenance reporting only.
    pub async fn total_size(&self) -> BlobResult<u64> {
        let mut total = 0;
        for byte in 0u16..=0xff {
            let shard = self.root.join(format!("{byte:02x}"));
            let mut dir = tokio::fs::read_dir(&shard)
                .await
                .context(IoSnafu { path: shard.clone() })?;
            while let Some(entry) = dir
                .next_entry()
                .await
                .context(IoSnafu { path: shard.clone() })?
            {
                if let Ok(metadata) = entry.metadata().await {
                    total += metadata.len();
                }
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn put_read_remove_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::open(dir.path()).await.expect("open");

        let bytes = b"some file bytes".to_vec();
        let hash = FileHash::digest_of(&bytes);

        assert!(!store.exists(hash, BlobKind::File).await.expect("exists"));
        store.put_file(hash, &bytes).await.expect("put");
        assert!(store.exists(hash, BlobKind::File).await.expect("exists"));

        // idempotent
        store.put_file(hash, &bytes).await.expect("put again");

        let read = store
            .read(hash, BlobKind::File)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(read, bytes);

        // blob lands in the shard named after the first hex byte
        let hex = hash.to_string();
        assert!(dir.path().join(&hex[..2]).join(&hex).exists());

        store.remove(hash, BlobKind::File).await.expect("remove");
        assert!(store.read(hash, BlobKind::File).await.expect("read").is_none());
        // removing again is fine
        store.remove(hash, BlobKind::File).await.expect("remove");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn thumbnails_live_next_to_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::open(dir.path()).await.expect("open");

        let bytes = b"image".to_vec();
        let thumb = b"thumb".to_vec();
        let hash = FileHash::digest_of(&bytes);

        store.put_file(hash, &bytes).await.expect("put file");
        store.put_thumbnail(hash, &thumb).await.expect("put thumb");

        assert_eq!(
            store
                .read(hash, BlobKind::Thumbnail)
                .await
                .expect("read")
                .expect("present"),
            thumb
        );
        assert_eq!(
            store
                .read(hash, BlobKind::File)
                .await
                .expect("read")
                .expect("present"),
            bytes
        );
    }
}
