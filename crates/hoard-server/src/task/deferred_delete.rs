//! The deferred physical-delete worker.
//!
//! Logical deletion only ever enqueues; this worker does the filesystem
//! work, one (file, thumbnail) pair per tick. The queue row is the source
//! of truth: it is claimed (removed) in the same job that reads it, and
//! re-inserted if the unlink fails, so a crash mid-delete retries instead
//! of leaking the blob. Re-adding a file clears its queue row through the
//! same serializer, which is what makes the claim safe.

use std::time::Duration;

use hoard_core::MasterHashId;
use hoard_core::id::FileHash;
use hoard_server_db::{Database, DeferredDeleteRecord, deferred_deletes, master_hashes};
use hoard_util_error::FmtCompact as _;
use tracing::{debug, instrument, trace, warn};

use crate::blob::BlobKind;
use crate::{Engine, EngineHandle};

const LOG_TARGET: &str = "hoard::deferred-delete";

pub struct DeferredDeleter {
    engine: EngineHandle,
}

impl DeferredDeleter {
    pub fn new(engine: &std::sync::Arc<Engine>) -> Self {
        debug!(target: LOG_TARGET, "Starting deferred-delete worker");
        Self {
            engine: engine.handle(),
        }
    }

    #[instrument(name = "deferred-delete", skip(self))]
    pub async fn run(self) {
        let period = {
            let Some(engine) = self.engine.engine_ref() else {
                return;
            };
            Duration::from_secs(engine.config().deferred_delete_period_secs)
        };
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let Some(engine) = self.engine.engine_ref() else {
                break;
            };
            if let Err(err) = Self::process_one(&engine).await {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Deferred delete pass failed"
                );
            }
        }
    }

    /// Claim and physically delete at most one queued blob pair.
    pub async fn process_one(engine: &crate::EngineRef<'_>) -> hoard_core::error::ApiResult<bool> {
        // claim: take the first row and resolve its hash in one job
        let claimed: Option<(MasterHashId, FileHash, DeferredDeleteRecord)> = engine
            .serializer()
            .write(|tx| {
                let first = {
                    let deferred_deletes_table = tx.open_table(&deferred_deletes::TABLE)?;
                    deferred_deletes_table
                        .range(..)?
                        .next()
                        .transpose()?
                        .map(|(k, v)| (k.value(), v.value()))
                };
                let Some((master_hash_id, record)) = first else {
                    return Ok(None);
                };
                let hash = {
                    let master_hashes_table = tx.open_table(&master_hashes::TABLE)?;
                    Database::get_master_hash_tx(master_hash_id, &master_hashes_table)?
                };
                tx.open_table(&deferred_deletes::TABLE)?.remove(&master_hash_id)?;
                Ok(hash.map(|hash| (master_hash_id, hash, record)))
            })
            .await?;

        let Some((master_hash_id, hash, record)) = claimed else {
            return Ok(false);
        };

        trace!(target: LOG_TARGET, %hash, "Deleting blob pair");

        let mut failed = DeferredDeleteRecord::default();
        if record.file {
            if let Err(err) = engine.blobs().remove(hash, BlobKind::File).await {
                warn!(target: LOG_TARGET, %hash, err = %err.fmt_compact(), "File unlink failed");
                failed.file = true;
            }
        }
        if record.thumbnail {
            if let Err(err) = engine.blobs().remove(hash, BlobKind::Thumbnail).await {
                warn!(target: LOG_TARGET, %hash, err = %err.fmt_compact(), "Thumbnail unlink failed");
                failed.thumbnail = true;
            }
        }

        // whatever could not be unlinked goes back on the queue
        if failed.file || failed.thumbnail {
            engine
                .serializer()
                .write(move |tx| {
                    tx.open_table(&deferred_deletes::TABLE)?
                        .insert(&master_hash_id, &failed)?;
                    Ok(())
                })
                .await?;
        }

        Ok(true)
    }
}
