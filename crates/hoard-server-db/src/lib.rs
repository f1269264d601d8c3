mod account_ops;
mod master_ops;
mod nullify_ops;
mod petition_ops;
mod repo_ops;
mod service_ops;
mod session_ops;
mod tables;
#[cfg(test)]
mod tests;
mod update_ops;

use std::path::PathBuf;
use std::sync::Mutex;
use std::{io, ops, result};

use hoard_core::error::ApiError;
use redb_bincode::{ReadTransaction, WriteTransaction};
use snafu::{Location, ResultExt as _, Snafu};
use tokio::task::JoinError;
use tracing::{debug, instrument};

pub use self::account_ops::{AccountInfo, ContentCounts, DeleteAllContentOutcome, IssuedRegistration};
pub use self::petition_ops::PetitionCounts;
pub use self::service_ops::ProvisionedService;
pub use self::tables::*;

const LOG_TARGET: &str = "hoard::db";

/// The schema version this build writes.
const DB_VERSION: u64 = 0;

/// A write transaction plus commit hooks.
///
/// Hooks queued with [`WriteTransactionCtx::on_commit`] run only after the
/// transaction has committed, so pubsub subscribers never observe
/// uncommitted state.
pub struct WriteTransactionCtx {
    dbtx: WriteTransaction,
    on_commit: Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl From<WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> result::Result<(), redb::CommitError> {
        let Self { dbtx, on_commit } = self;

        dbtx.commit()?;

        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    DbVersionTooHigh {
        db_ver: u64,
        code_ver: u64,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    /// A domain-level refusal, passed through to the caller verbatim.
    #[snafu(transparent)]
    Api {
        source: ApiError,
    },
    Overflow,
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Collapse into the wire taxonomy: domain refusals pass through,
    /// storage trouble becomes `internal`.
    pub fn into_api_error(self) -> ApiError {
        match self {
            DbError::Api { source } => source,
            other => ApiError::internal(format!("{other}")),
        }
    }
}

#[derive(Debug)]
pub struct Database {
    inner: redb_bincode::Database,
}

impl Database {
    pub async fn mk_db_path(data_dir: &std::path::Path) -> std::result::Result<PathBuf, io::Error> {
        tokio::fs::create_dir_all(&data_dir).await?;
        Ok(data_dir.join("server.redb"))
    }

    pub async fn new_in_memory() -> DbResult<Database> {
        debug!(target: LOG_TARGET, "Opening in-memory database");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> DbResult<Database> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening database");

        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        Self::open_inner(inner).await
    }

    #[instrument(skip_all)]
    async fn open_inner(inner: redb::Database) -> DbResult<Database> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, |tx| {
            Self::init_tables_tx(tx)?;
            Self::verify_db_version_tx(&mut tx.open_table(&db_version::TABLE)?)?;
            Ok(())
        })
        .await?;

        Ok(Self { inner })
    }

    /// Compact the underlying file; run between jobs by the serializer's
    /// maintenance tick.
    pub fn compact(&mut self) -> Result<bool, redb::CompactionError> {
        self.inner.as_raw_mut().compact()
    }

    fn init_tables_tx(tx: &WriteTransactionCtx) -> DbResult<()> {
        tx.open_table(&db_version::TABLE)?;
        tx.open_table(&master_counters::TABLE)?;
        tx.open_table(&service_counters::TABLE)?;
        tx.open_table(&master_hashes::TABLE)?;
        tx.open_table(&master_hash_ids::TABLE)?;
        tx.open_table(&master_tags::TABLE)?;
        tx.open_table(&master_tag_ids::TABLE)?;
        tx.open_table(&reasons::TABLE)?;
        tx.open_table(&reason_ids::TABLE)?;
        tx.open_table(&file_infos::TABLE)?;
        tx.open_table(&service_hash_ids::TABLE)?;
        tx.open_table(&service_hashes::TABLE)?;
        tx.open_table(&service_tag_ids::TABLE)?;
        tx.open_table(&service_tags::TABLE)?;
        tx.open_table(&services::TABLE)?;
        tx.open_table(&service_ids::TABLE)?;
        tx.open_table(&repo_states::TABLE)?;
        tx.open_table(&service_info::TABLE)?;
        tx.open_table(&account_types::TABLE)?;
        tx.open_table(&accounts::TABLE)?;
        tx.open_table(&account_ids::TABLE)?;
        tx.open_table(&account_ids_by_access::TABLE)?;
        tx.open_table(&account_bandwidth::TABLE)?;
        tx.open_table(&registration_keys::TABLE)?;
        tx.open_table(&registration_access_index::TABLE)?;
        tx.open_table(&sessions::TABLE)?;
        tx.open_table(&files_current::TABLE)?;
        tx.open_table(&files_deleted::TABLE)?;
        tx.open_table(&files_pending::TABLE)?;
        tx.open_table(&files_petitioned::TABLE)?;
        tx.open_table(&mappings_current::TABLE)?;
        tx.open_table(&mappings_deleted::TABLE)?;
        tx.open_table(&mappings_pending::TABLE)?;
        tx.open_table(&mappings_petitioned::TABLE)?;
        tx.open_table(&tag_parents_current::TABLE)?;
        tx.open_table(&tag_parents_deleted::TABLE)?;
        tx.open_table(&tag_parents_pending::TABLE)?;
        tx.open_table(&tag_parents_petitioned::TABLE)?;
        tx.open_table(&tag_siblings_current::TABLE)?;
        tx.open_table(&tag_siblings_deleted::TABLE)?;
        tx.open_table(&tag_siblings_pending::TABLE)?;
        tx.open_table(&tag_siblings_petitioned::TABLE)?;
        tx.open_table(&petition_index::TABLE)?;
        tx.open_table(&update_metadata::TABLE)?;
        tx.open_table(&updates::TABLE)?;
        tx.open_table(&deferred_deletes::TABLE)?;
        Ok(())
    }

    fn verify_db_version_tx(db_version_table: &mut db_version::Table) -> DbResult<()> {
        let db_ver = db_version_table.get(&())?.map(|g| g.value());
        match db_ver {
            Some(db_ver) if DB_VERSION < db_ver => {
                DbVersionTooHighSnafu {
                    db_ver,
                    code_ver: DB_VERSION,
                }
                .fail()
            }
            Some(_) => Ok(()),
            None => {
                db_version_table.insert(&(), &DB_VERSION)?;
                Ok(())
            }
        }
    }

    pub async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| Self::write_with_sync_inner(inner, f))
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    /// Blocking variant for callers that already live on a dedicated thread
    /// (the serializer).
    pub fn write_with_sync<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::write_with_sync_inner(&self.inner, f)
    }

    fn write_with_sync_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        let dbtx = WriteTransactionCtx::from(inner.begin_write().context(TransactionSnafu)?);
        let res = f(&dbtx)?;

        dbtx.commit().context(CommitSnafu)?;

        Ok(res)
    }

    pub async fn read_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::read_with_inner(&self.inner, f).await
    }

    pub fn read_with_sync<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        let dbtx = self.inner.begin_read().context(TransactionSnafu)?;
        f(&dbtx)
    }

    // ========================================================================
    // Id allocation & counters
    // ========================================================================

    pub(crate) fn next_master_id_tx(
        kind: MasterCounterKind,
        master_counters_table: &mut master_counters::Table,
    ) -> DbResult<u64> {
        let next = master_counters_table
            .get(&kind)?
            .map(|g| g.value())
            .unwrap_or(1);
        master_counters_table.insert(&kind, &(next + 1))?;
        Ok(next)
    }

    pub(crate) fn next_service_id_tx(
        service_id: hoard_core::ServiceId,
        kind: ServiceCounterKind,
        service_counters_table: &mut service_counters::Table,
    ) -> DbResult<u64> {
        let key = (service_id, kind);
        let next = service_counters_table
            .get(&key)?
            .map(|g| g.value())
            .unwrap_or(1);
        service_counters_table.insert(&key, &(next + 1))?;
        Ok(next)
    }

    /// Apply a signed delta to one precomputed total.
    pub fn update_service_info_tx(
        service_id: hoard_core::ServiceId,
        kind: ServiceInfoKind,
        delta: i64,
        service_info_table: &mut service_info::Table,
    ) -> DbResult<i64> {
        let key = (service_id, kind);
        let current = service_info_table.get(&key)?.map(|g| g.value()).unwrap_or(0);
        let new = current.checked_add(delta).ok_or(DbError::Overflow)?;
        service_info_table.insert(&key, &new)?;
        Ok(new)
    }

    pub fn get_service_info_tx(
        service_id: hoard_core::ServiceId,
        kind: ServiceInfoKind,
        service_info_table: &impl service_info::ReadableTable,
    ) -> DbResult<i64> {
        Ok(service_info_table
            .get(&(service_id, kind))?
            .map(|g| g.value())
            .unwrap_or(0))
    }
}
