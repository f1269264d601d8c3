//! Repository row primitives: add/delete/pend/petition/deny for every
//! content kind.
//!
//! Every function here runs inside a single write transaction and maintains,
//! atomically with the row change: the service-info totals, the petition
//! index, petitioner scores, and (for files) the deferred-delete queue.
//!
//! Row-state invariants upheld (per service and content kind):
//! - a key is in at most one of current/deleted
//! - a pending row never coexists with a current row for the same key
//! - a petitioned row requires a current row; deleting the current row drops
//!   its petitioned rows
//! - a sibling's bad tag maps to at most one good tag in current

use hoard_core::content::{ContentKind, FileInfo};
use hoard_core::error::ApiError;
use hoard_core::id::FileHash;
use hoard_core::tag::Tag;
use hoard_core::update::PetitionStatus;
use hoard_core::{
    AccountId, MasterHashId, MasterTagId, ReasonId, ServiceHashId, ServiceId, ServiceTagId,
    Timestamp,
};
use tracing::debug;

use crate::{
    Database, DbResult, DeferredDeleteRecord, FileInfoRecord, LOG_TARGET, QueuedRecord, RowRecord,
    ServiceInfoKind, SiblingRecord, WriteTransactionCtx, accounts, deferred_deletes, file_infos,
    files_current, files_deleted, files_pending, files_petitioned, mappings_current,
    mappings_deleted, mappings_pending, mappings_petitioned, master_counters, master_hash_ids,
    master_hashes, master_tag_ids, master_tags, petition_index, reason_ids, reasons,
    service_hash_ids, service_info, tag_parents_current, tag_parents_deleted, tag_parents_pending,
    tag_parents_petitioned, tag_siblings_current, tag_siblings_deleted, tag_siblings_pending,
    tag_siblings_petitioned,
};

impl Database {
    // ========================================================================
    // Shared petition bookkeeping
    // ========================================================================

    /// Count one (account, reason) petition entry covering `rows` more rows.
    fn petition_index_add_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        kind: ContentKind,
        status: PetitionStatus,
        account_id: AccountId,
        reason_id: ReasonId,
        rows: u64,
    ) -> DbResult<()> {
        let mut table = tx.open_table(&petition_index::TABLE)?;
        let key = (service_id, kind, status, account_id, reason_id);
        let current = table.get(&key)?.map(|g| g.value()).unwrap_or(0);
        table.insert(&key, &(current + rows))?;
        Ok(())
    }

    /// Drop `rows` rows from one petition entry, removing it at zero.
    fn petition_index_sub_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        kind: ContentKind,
        status: PetitionStatus,
        account_id: AccountId,
        reason_id: ReasonId,
        rows: u64,
    ) -> DbResult<()> {
        let mut table = tx.open_table(&petition_index::TABLE)?;
        let key = (service_id, kind, status, account_id, reason_id);
        let current = table.get(&key)?.map(|g| g.value()).unwrap_or(0);
        let remaining = current.saturating_sub(rows);
        if remaining == 0 {
            table.remove(&key)?;
        } else {
            table.insert(&key, &remaining)?;
        }
        Ok(())
    }

    pub(crate) fn add_petition_score_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        delta: i64,
    ) -> DbResult<()> {
        let mut accounts_table = tx.open_table(&accounts::TABLE)?;
        let Some(mut record) = accounts_table
            .get(&(service_id, account_id))?
            .map(|g| g.value())
        else {
            return Ok(());
        };
        record.petition_score = record.petition_score.saturating_add(delta);
        accounts_table.insert(&(service_id, account_id), &record)?;
        Ok(())
    }

    pub fn intern_reason_tx(tx: &WriteTransactionCtx, reason: &str) -> DbResult<ReasonId> {
        let mut reason_ids_table = tx.open_table(&reason_ids::TABLE)?;
        let mut reasons_table = tx.open_table(&reasons::TABLE)?;
        let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
        Self::get_or_create_reason_id_tx(
            reason,
            &mut reason_ids_table,
            &mut reasons_table,
            &mut master_counters_table,
        )
    }

    fn bump_info_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        kind: ServiceInfoKind,
        delta: i64,
    ) -> DbResult<()> {
        let mut service_info_table = tx.open_table(&service_info::TABLE)?;
        Self::update_service_info_tx(service_id, kind, delta, &mut service_info_table)?;
        Ok(())
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Commit a file row.
    ///
    /// Returns the service hash id. Re-adding a current file is a no-op; a
    /// deleted row blocks the add unless `overwrite_deleted` is set.
    pub fn add_file_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        info: &FileInfo,
        overwrite_deleted: bool,
        now: Timestamp,
    ) -> DbResult<ServiceHashId> {
        let master_hash_id = {
            let mut master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
            let mut master_hashes_table = tx.open_table(&master_hashes::TABLE)?;
            let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
            Self::get_or_create_master_hash_id_tx(
                info.hash,
                &mut master_hash_ids_table,
                &mut master_hashes_table,
                &mut master_counters_table,
            )?
        };

        {
            let mut file_infos_table = tx.open_table(&file_infos::TABLE)?;
            if file_infos_table.get(&master_hash_id)?.is_none() {
                file_infos_table.insert(
                    &master_hash_id,
                    &FileInfoRecord {
                        size: info.size,
                        mime: info.mime.clone(),
                        width: info.width,
                        height: info.height,
                        duration_ms: info.duration_ms,
                        num_frames: info.num_frames,
                        num_words: info.num_words,
                    },
                )?;
            }
        }

        let hash_id = Self::get_or_create_service_hash_id_tx(tx, service_id, master_hash_id, now)?;

        {
            let files_current_table = tx.open_table(&files_current::TABLE)?;
            if files_current_table.get(&(service_id, hash_id))?.is_some() {
                return Ok(hash_id);
            }
        }

        {
            let mut files_deleted_table = tx.open_table(&files_deleted::TABLE)?;
            if files_deleted_table.get(&(service_id, hash_id))?.is_some() {
                if !overwrite_deleted {
                    return Err(ApiError::conflict("file was previously deleted").into());
                }
                files_deleted_table.remove(&(service_id, hash_id))?;
                Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumDeletedFiles, -1)?;
            }
        }

        tx.open_table(&files_current::TABLE)?.insert(
            &(service_id, hash_id),
            &RowRecord {
                account_id,
                committed_at: now,
            },
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumFiles, 1)?;
        Self::bump_info_tx(
            tx,
            service_id,
            ServiceInfoKind::FileStorageBytes,
            info.size as i64,
        )?;

        // promote: clear everyone's pending rows for this file, rewarding them
        let cleared = {
            let mut files_pending_table = tx.open_table(&files_pending::TABLE)?;
            let entries: Vec<((ServiceId, MasterHashId, AccountId), QueuedRecord)> =
                files_pending_table
                    .range(
                        (service_id, master_hash_id, AccountId::ZERO)
                            ..=(service_id, master_hash_id, AccountId::MAX),
                    )?
                    .map(|res| res.map(|(k, v)| (k.value(), v.value())))
                    .collect::<Result<Vec<_>, _>>()?;
            for (k, _) in &entries {
                files_pending_table.remove(k)?;
            }
            entries
        };
        for ((_, _, pend_account_id), queued) in cleared {
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::Files,
                PetitionStatus::Pending,
                pend_account_id,
                queued.reason_id,
                1,
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPendingFiles, -1)?;
            Self::add_petition_score_tx(tx, service_id, pend_account_id, 1)?;
        }

        // a re-added file must not be physically deleted by a stale queue row
        tx.open_table(&deferred_deletes::TABLE)?.remove(&master_hash_id)?;

        debug!(target: LOG_TARGET, %service_id, %hash_id, "File committed");

        Ok(hash_id)
    }

    /// Commit previously uploaded files by hash alone.
    ///
    /// Used when a pend is approved: the metadata must already exist in
    /// `file_infos` from the original upload, otherwise the hash is
    /// rejected.
    pub fn add_files_by_hash_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        hashes: &[FileHash],
        overwrite_deleted: bool,
        now: Timestamp,
    ) -> DbResult<u64> {
        let mut added = 0u64;
        for hash in hashes {
            let info = {
                let master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
                let file_infos_table = tx.open_table(&file_infos::TABLE)?;
                Self::lookup_master_hash_id_tx(*hash, &master_hash_ids_table)?
                    .map(|master| file_infos_table.get(&master))
                    .transpose()?
                    .flatten()
                    .map(|g| g.value())
            };
            let Some(info) = info else {
                return Err(
                    ApiError::bad_request("file has not been uploaded to this server").into(),
                );
            };
            Self::add_file_tx(
                tx,
                service_id,
                account_id,
                &FileInfo {
                    hash: *hash,
                    size: info.size,
                    mime: info.mime,
                    width: info.width,
                    height: info.height,
                    duration_ms: info.duration_ms,
                    num_frames: info.num_frames,
                    num_words: info.num_words,
                },
                overwrite_deleted,
                now,
            )?;
            added += 1;
        }
        Ok(added)
    }

    /// Move file rows current → deleted.
    ///
    /// Rewards petitioners, drops their petitioned rows, and enqueues the
    /// blob for physical deletion when no service references it anymore.
    pub fn delete_files_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        actor_account_id: AccountId,
        hashes: &[FileHash],
        now: Timestamp,
    ) -> DbResult<u64> {
        let mut deleted = 0u64;
        for hash in hashes {
            let Some(master_hash_id) = ({
                let master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
                Self::lookup_master_hash_id_tx(*hash, &master_hash_ids_table)?
            }) else {
                continue;
            };
            let Some(hash_id) = ({
                let service_hash_ids_table = tx.open_table(&service_hash_ids::TABLE)?;
                Self::lookup_service_hash_id_tx(service_id, master_hash_id, &service_hash_ids_table)?
            }) else {
                continue;
            };

            if Self::delete_file_row_tx(tx, service_id, actor_account_id, hash_id, now)? {
                deleted += 1;

                if Self::file_is_orphan_tx(tx, master_hash_id, None)? {
                    tx.open_table(&deferred_deletes::TABLE)?.insert(
                        &master_hash_id,
                        &DeferredDeleteRecord {
                            file: true,
                            thumbnail: true,
                        },
                    )?;
                }
            }
        }
        Ok(deleted)
    }

    /// Delete a single current file row by service hash id. Returns `false`
    /// when there is no current row.
    pub(crate) fn delete_file_row_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        actor_account_id: AccountId,
        hash_id: ServiceHashId,
        now: Timestamp,
    ) -> DbResult<bool> {
        let removed = {
            let mut files_current_table = tx.open_table(&files_current::TABLE)?;
            files_current_table
                .remove(&(service_id, hash_id))?
                .map(|g| g.value())
        };
        if removed.is_none() {
            return Ok(false);
        }

        let size = {
            let service_hashes_table = tx.open_table(&crate::service_hashes::TABLE)?;
            let file_infos_table = tx.open_table(&file_infos::TABLE)?;
            service_hashes_table
                .get(&(service_id, hash_id))?
                .map(|g| g.value())
                .and_then(|master| {
                    file_infos_table
                        .get(&master)
                        .ok()
                        .flatten()
                        .map(|g| g.value().size)
                })
                .unwrap_or(0)
        };

        tx.open_table(&files_deleted::TABLE)?.insert(
            &(service_id, hash_id),
            &RowRecord {
                account_id: actor_account_id,
                committed_at: now,
            },
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumFiles, -1)?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumDeletedFiles, 1)?;
        Self::bump_info_tx(
            tx,
            service_id,
            ServiceInfoKind::FileStorageBytes,
            -(size as i64),
        )?;

        // reward and drop petitioned rows for this file
        let petitions = {
            let mut files_petitioned_table = tx.open_table(&files_petitioned::TABLE)?;
            let entries: Vec<((ServiceId, ServiceHashId, AccountId), QueuedRecord)> =
                files_petitioned_table
                    .range(
                        (service_id, hash_id, AccountId::ZERO)
                            ..=(service_id, hash_id, AccountId::MAX),
                    )?
                    .map(|res| res.map(|(k, v)| (k.value(), v.value())))
                    .collect::<Result<Vec<_>, _>>()?;
            for (k, _) in &entries {
                files_petitioned_table.remove(k)?;
            }
            entries
        };
        for ((_, _, petitioner), queued) in petitions {
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::Files,
                PetitionStatus::Petitioned,
                petitioner,
                queued.reason_id,
                1,
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPetitionedFiles, -1)?;
            Self::add_petition_score_tx(tx, service_id, petitioner, 1)?;
        }

        Ok(true)
    }

    /// Queue file additions for moderation.
    pub fn pend_files_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        hashes: &[FileHash],
        reason: &str,
        now: Timestamp,
    ) -> DbResult<u64> {
        let _ = now;
        let reason_id = Self::intern_reason_tx(tx, reason)?;
        let mut pended = 0u64;
        for hash in hashes {
            let master_hash_id = {
                let mut master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
                let mut master_hashes_table = tx.open_table(&master_hashes::TABLE)?;
                let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
                Self::get_or_create_master_hash_id_tx(
                    *hash,
                    &mut master_hash_ids_table,
                    &mut master_hashes_table,
                    &mut master_counters_table,
                )?
            };

            // a pending row must not shadow a current row
            let already_current = {
                let service_hash_ids_table = tx.open_table(&service_hash_ids::TABLE)?;
                match Self::lookup_service_hash_id_tx(
                    service_id,
                    master_hash_id,
                    &service_hash_ids_table,
                )? {
                    Some(hash_id) => {
                        let files_current_table = tx.open_table(&files_current::TABLE)?;
                        files_current_table.get(&(service_id, hash_id))?.is_some()
                    }
                    None => false,
                }
            };
            if already_current {
                continue;
            }

            let key = (service_id, master_hash_id, account_id);
            let mut files_pending_table = tx.open_table(&files_pending::TABLE)?;
            if files_pending_table.get(&key)?.is_some() {
                continue;
            }
            files_pending_table.insert(&key, &QueuedRecord { reason_id })?;
            drop(files_pending_table);

            Self::petition_index_add_tx(
                tx,
                service_id,
                ContentKind::Files,
                PetitionStatus::Pending,
                account_id,
                reason_id,
                1,
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPendingFiles, 1)?;
            pended += 1;
        }
        Ok(pended)
    }

    /// Queue file removals for moderation. Skips hashes with no current row.
    pub fn petition_files_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        hashes: &[FileHash],
        reason: &str,
        now: Timestamp,
    ) -> DbResult<u64> {
        let _ = now;
        let reason_id = Self::intern_reason_tx(tx, reason)?;
        let mut petitioned = 0u64;
        for hash in hashes {
            let Some(hash_id) = Self::resolve_current_file_tx(tx, service_id, *hash)? else {
                continue;
            };

            let key = (service_id, hash_id, account_id);
            let mut files_petitioned_table = tx.open_table(&files_petitioned::TABLE)?;
            if files_petitioned_table.get(&key)?.is_some() {
                continue;
            }
            files_petitioned_table.insert(&key, &QueuedRecord { reason_id })?;
            drop(files_petitioned_table);

            Self::petition_index_add_tx(
                tx,
                service_id,
                ContentKind::Files,
                PetitionStatus::Petitioned,
                account_id,
                reason_id,
                1,
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPetitionedFiles, 1)?;
            petitioned += 1;
        }
        Ok(petitioned)
    }

    /// The service hash id of a file that is current, if any.
    fn resolve_current_file_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        hash: FileHash,
    ) -> DbResult<Option<ServiceHashId>> {
        let master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
        let Some(master_hash_id) = Self::lookup_master_hash_id_tx(hash, &master_hash_ids_table)?
        else {
            return Ok(None);
        };
        let service_hash_ids_table = tx.open_table(&service_hash_ids::TABLE)?;
        let Some(hash_id) =
            Self::lookup_service_hash_id_tx(service_id, master_hash_id, &service_hash_ids_table)?
        else {
            return Ok(None);
        };
        let files_current_table = tx.open_table(&files_current::TABLE)?;
        if files_current_table.get(&(service_id, hash_id))?.is_none() {
            return Ok(None);
        }
        Ok(Some(hash_id))
    }

    /// Drop one account's pending file rows for a reason, docking its score.
    pub fn deny_file_pends_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        reason_id: ReasonId,
    ) -> DbResult<u64> {
        let dropped = {
            let mut files_pending_table = tx.open_table(&files_pending::TABLE)?;
            let keys: Vec<(ServiceId, MasterHashId, AccountId)> = files_pending_table
                .range(
                    (service_id, MasterHashId::ZERO, AccountId::ZERO)
                        ..=(service_id, MasterHashId::MAX, AccountId::MAX),
                )?
                .filter_map(|res| match res {
                    Ok((k, v)) => {
                        let key = k.value();
                        (key.2 == account_id && v.value().reason_id == reason_id).then_some(Ok(key))
                    }
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            for key in &keys {
                files_pending_table.remove(key)?;
            }
            keys.len() as u64
        };

        if 0 < dropped {
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::Files,
                PetitionStatus::Pending,
                account_id,
                reason_id,
                dropped,
            )?;
            Self::bump_info_tx(
                tx,
                service_id,
                ServiceInfoKind::NumPendingFiles,
                -(dropped as i64),
            )?;
            Self::add_petition_score_tx(tx, service_id, account_id, -(dropped as i64))?;
        }
        Ok(dropped)
    }

    /// Drop one account's petitioned file rows for a reason, docking its
    /// score. The current rows stay untouched.
    pub fn deny_file_petitions_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        reason_id: ReasonId,
    ) -> DbResult<u64> {
        let dropped = {
            let mut files_petitioned_table = tx.open_table(&files_petitioned::TABLE)?;
            let keys: Vec<(ServiceId, ServiceHashId, AccountId)> = files_petitioned_table
                .range(
                    (service_id, ServiceHashId::ZERO, AccountId::ZERO)
                        ..=(service_id, ServiceHashId::MAX, AccountId::MAX),
                )?
                .filter_map(|res| match res {
                    Ok((k, v)) => {
                        let key = k.value();
                        (key.2 == account_id && v.value().reason_id == reason_id).then_some(Ok(key))
                    }
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            for key in &keys {
                files_petitioned_table.remove(key)?;
            }
            keys.len() as u64
        };

        if 0 < dropped {
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::Files,
                PetitionStatus::Petitioned,
                account_id,
                reason_id,
                dropped,
            )?;
            Self::bump_info_tx(
                tx,
                service_id,
                ServiceInfoKind::NumPetitionedFiles,
                -(dropped as i64),
            )?;
            Self::add_petition_score_tx(tx, service_id, account_id, -(dropped as i64))?;
        }
        Ok(dropped)
    }

    /// True when no service carries the hash in current files or references
    /// it as an update blob. `ignore_service_id` excludes a service that is
    /// about to be dropped wholesale.
    pub fn file_is_orphan_tx(
        tx: &WriteTransactionCtx,
        master_hash_id: MasterHashId,
        ignore_service_id: Option<ServiceId>,
    ) -> DbResult<bool> {
        let services_table = tx.open_table(&crate::services::TABLE)?;
        let service_hash_ids_table = tx.open_table(&service_hash_ids::TABLE)?;
        let files_current_table = tx.open_table(&files_current::TABLE)?;
        let updates_table = tx.open_table(&crate::updates::TABLE)?;
        let master_hashes_table = tx.open_table(&master_hashes::TABLE)?;

        let hash = Self::get_master_hash_tx(master_hash_id, &master_hashes_table)?;

        for res in services_table.range(..)? {
            let (k, _) = res?;
            let service_id = k.value();
            if ignore_service_id == Some(service_id) {
                continue;
            }

            if let Some(hash_id) =
                Self::lookup_service_hash_id_tx(service_id, master_hash_id, &service_hash_ids_table)?
            {
                if files_current_table.get(&(service_id, hash_id))?.is_some() {
                    return Ok(false);
                }
            }

            // a file blob and an update blob share the filename namespace
            if let Some(hash) = hash {
                let update_hash = hoard_core::id::UpdateHash::from_bytes(hash.to_bytes());
                if updates_table.get(&(service_id, update_hash))?.is_some() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    // ========================================================================
    // Mappings
    // ========================================================================

    /// Current mapping count of a tag; weighs tag parent/sibling petition
    /// rewards.
    pub fn current_mapping_count_tx(
        service_id: ServiceId,
        tag_id: ServiceTagId,
        mappings_current_table: &impl mappings_current::ReadableTable,
    ) -> DbResult<u64> {
        let mut n = 0u64;
        for res in mappings_current_table.range(
            (service_id, tag_id, ServiceHashId::ZERO)..=(service_id, tag_id, ServiceHashId::MAX),
        )? {
            res?;
            n += 1;
        }
        Ok(n)
    }

    /// Commit mapping rows for one tag, vectorized over hashes.
    ///
    /// Hashes whose (tag, hash) sits in deleted are silently filtered when
    /// `overwrite_deleted` is off. Returns how many rows became current.
    pub fn add_mappings_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        tag: &Tag,
        hashes: &[FileHash],
        overwrite_deleted: bool,
        now: Timestamp,
    ) -> DbResult<u64> {
        let master_tag_id = {
            let mut master_tag_ids_table = tx.open_table(&master_tag_ids::TABLE)?;
            let mut master_tags_table = tx.open_table(&master_tags::TABLE)?;
            let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
            Self::get_or_create_master_tag_id_tx(
                tag,
                &mut master_tag_ids_table,
                &mut master_tags_table,
                &mut master_counters_table,
            )?
        };
        let tag_id = Self::get_or_create_service_tag_id_tx(tx, service_id, master_tag_id, now)?;

        let mut added = 0u64;
        for hash in hashes {
            let master_hash_id = {
                let mut master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
                let mut master_hashes_table = tx.open_table(&master_hashes::TABLE)?;
                let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
                Self::get_or_create_master_hash_id_tx(
                    *hash,
                    &mut master_hash_ids_table,
                    &mut master_hashes_table,
                    &mut master_counters_table,
                )?
            };
            let hash_id =
                Self::get_or_create_service_hash_id_tx(tx, service_id, master_hash_id, now)?;
            let key = (service_id, tag_id, hash_id);

            {
                let mappings_current_table = tx.open_table(&mappings_current::TABLE)?;
                if mappings_current_table.get(&key)?.is_some() {
                    continue;
                }
            }
            {
                let mut mappings_deleted_table = tx.open_table(&mappings_deleted::TABLE)?;
                if mappings_deleted_table.get(&key)?.is_some() {
                    if !overwrite_deleted {
                        continue;
                    }
                    mappings_deleted_table.remove(&key)?;
                    Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumDeletedMappings, -1)?;
                }
            }

            tx.open_table(&mappings_current::TABLE)?.insert(
                &key,
                &RowRecord {
                    account_id,
                    committed_at: now,
                },
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumMappings, 1)?;
            added += 1;

            // promote: clear pending rows for this (tag, hash)
            let cleared = {
                let mut mappings_pending_table = tx.open_table(&mappings_pending::TABLE)?;
                let entries: Vec<(
                    (ServiceId, MasterTagId, MasterHashId, AccountId),
                    QueuedRecord,
                )> = mappings_pending_table
                    .range(
                        (service_id, master_tag_id, master_hash_id, AccountId::ZERO)
                            ..=(service_id, master_tag_id, master_hash_id, AccountId::MAX),
                    )?
                    .map(|res| res.map(|(k, v)| (k.value(), v.value())))
                    .collect::<Result<Vec<_>, _>>()?;
                for (k, _) in &entries {
                    mappings_pending_table.remove(k)?;
                }
                entries
            };
            for ((_, _, _, pend_account_id), queued) in cleared {
                Self::petition_index_sub_tx(
                    tx,
                    service_id,
                    ContentKind::Mappings,
                    PetitionStatus::Pending,
                    pend_account_id,
                    queued.reason_id,
                    1,
                )?;
                Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPendingMappings, -1)?;
                Self::add_petition_score_tx(tx, service_id, pend_account_id, 1)?;
            }
        }

        Ok(added)
    }

    /// Move mapping rows current → deleted for one tag.
    pub fn delete_mappings_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        actor_account_id: AccountId,
        tag: &Tag,
        hashes: &[FileHash],
        now: Timestamp,
    ) -> DbResult<u64> {
        let Some(tag_id) = Self::resolve_service_tag_id_of_tag_tx(tx, service_id, tag)? else {
            return Ok(0);
        };

        let mut deleted = 0u64;
        for hash in hashes {
            let Some(hash_id) = ({
                let master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
                let service_hash_ids_table = tx.open_table(&service_hash_ids::TABLE)?;
                match Self::lookup_master_hash_id_tx(*hash, &master_hash_ids_table)? {
                    Some(master) => Self::lookup_service_hash_id_tx(
                        service_id,
                        master,
                        &service_hash_ids_table,
                    )?,
                    None => None,
                }
            }) else {
                continue;
            };

            let key = (service_id, tag_id, hash_id);
            let removed = {
                let mut mappings_current_table = tx.open_table(&mappings_current::TABLE)?;
                mappings_current_table.remove(&key)?.is_some()
            };
            if !removed {
                continue;
            }

            tx.open_table(&mappings_deleted::TABLE)?.insert(
                &key,
                &RowRecord {
                    account_id: actor_account_id,
                    committed_at: now,
                },
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumMappings, -1)?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumDeletedMappings, 1)?;
            deleted += 1;

            // reward and drop petitioned rows for this mapping
            let petitions = {
                let mut mappings_petitioned_table = tx.open_table(&mappings_petitioned::TABLE)?;
                let entries: Vec<(
                    (ServiceId, ServiceTagId, ServiceHashId, AccountId),
                    QueuedRecord,
                )> = mappings_petitioned_table
                    .range(
                        (service_id, tag_id, hash_id, AccountId::ZERO)
                            ..=(service_id, tag_id, hash_id, AccountId::MAX),
                    )?
                    .map(|res| res.map(|(k, v)| (k.value(), v.value())))
                    .collect::<Result<Vec<_>, _>>()?;
                for (k, _) in &entries {
                    mappings_petitioned_table.remove(k)?;
                }
                entries
            };
            for ((_, _, _, petitioner), queued) in petitions {
                Self::petition_index_sub_tx(
                    tx,
                    service_id,
                    ContentKind::Mappings,
                    PetitionStatus::Petitioned,
                    petitioner,
                    queued.reason_id,
                    1,
                )?;
                Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPetitionedMappings, -1)?;
                Self::add_petition_score_tx(tx, service_id, petitioner, 1)?;
            }
        }

        Ok(deleted)
    }

    fn resolve_service_tag_id_of_tag_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        tag: &Tag,
    ) -> DbResult<Option<ServiceTagId>> {
        let master_tag_ids_table = tx.open_table(&master_tag_ids::TABLE)?;
        let Some(master_tag_id) = master_tag_ids_table.get(tag)?.map(|g| g.value()) else {
            return Ok(None);
        };
        let service_tag_ids_table = tx.open_table(&crate::service_tag_ids::TABLE)?;
        Self::lookup_service_tag_id_tx(service_id, master_tag_id, &service_tag_ids_table)
    }

    /// Queue mapping additions for moderation.
    pub fn pend_mappings_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        tag: &Tag,
        hashes: &[FileHash],
        reason: &str,
        now: Timestamp,
    ) -> DbResult<u64> {
        let _ = now;
        let reason_id = Self::intern_reason_tx(tx, reason)?;
        let master_tag_id = {
            let mut master_tag_ids_table = tx.open_table(&master_tag_ids::TABLE)?;
            let mut master_tags_table = tx.open_table(&master_tags::TABLE)?;
            let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
            Self::get_or_create_master_tag_id_tx(
                tag,
                &mut master_tag_ids_table,
                &mut master_tags_table,
                &mut master_counters_table,
            )?
        };

        let mut pended = 0u64;
        for hash in hashes {
            let master_hash_id = {
                let mut master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
                let mut master_hashes_table = tx.open_table(&master_hashes::TABLE)?;
                let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
                Self::get_or_create_master_hash_id_tx(
                    *hash,
                    &mut master_hash_ids_table,
                    &mut master_hashes_table,
                    &mut master_counters_table,
                )?
            };

            // skip rows that are already current
            let already_current = {
                let service_tag_ids_table = tx.open_table(&crate::service_tag_ids::TABLE)?;
                let service_hash_ids_table = tx.open_table(&service_hash_ids::TABLE)?;
                let tag_id = Self::lookup_service_tag_id_tx(
                    service_id,
                    master_tag_id,
                    &service_tag_ids_table,
                )?;
                let hash_id = Self::lookup_service_hash_id_tx(
                    service_id,
                    master_hash_id,
                    &service_hash_ids_table,
                )?;
                match (tag_id, hash_id) {
                    (Some(tag_id), Some(hash_id)) => {
                        let mappings_current_table = tx.open_table(&mappings_current::TABLE)?;
                        mappings_current_table
                            .get(&(service_id, tag_id, hash_id))?
                            .is_some()
                    }
                    _ => false,
                }
            };
            if already_current {
                continue;
            }

            let key = (service_id, master_tag_id, master_hash_id, account_id);
            let mut mappings_pending_table = tx.open_table(&mappings_pending::TABLE)?;
            if mappings_pending_table.get(&key)?.is_some() {
                continue;
            }
            mappings_pending_table.insert(&key, &QueuedRecord { reason_id })?;
            drop(mappings_pending_table);

            Self::petition_index_add_tx(
                tx,
                service_id,
                ContentKind::Mappings,
                PetitionStatus::Pending,
                account_id,
                reason_id,
                1,
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPendingMappings, 1)?;
            pended += 1;
        }
        Ok(pended)
    }

    /// Queue mapping removals for moderation.
    pub fn petition_mappings_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        tag: &Tag,
        hashes: &[FileHash],
        reason: &str,
        now: Timestamp,
    ) -> DbResult<u64> {
        let _ = now;
        let reason_id = Self::intern_reason_tx(tx, reason)?;
        let Some(tag_id) = Self::resolve_service_tag_id_of_tag_tx(tx, service_id, tag)? else {
            return Ok(0);
        };

        let mut petitioned = 0u64;
        for hash in hashes {
            let Some(hash_id) = ({
                let master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
                let service_hash_ids_table = tx.open_table(&service_hash_ids::TABLE)?;
                match Self::lookup_master_hash_id_tx(*hash, &master_hash_ids_table)? {
                    Some(master) => Self::lookup_service_hash_id_tx(
                        service_id,
                        master,
                        &service_hash_ids_table,
                    )?,
                    None => None,
                }
            }) else {
                continue;
            };

            // a petition points at a current row
            {
                let mappings_current_table = tx.open_table(&mappings_current::TABLE)?;
                if mappings_current_table
                    .get(&(service_id, tag_id, hash_id))?
                    .is_none()
                {
                    continue;
                }
            }

            let key = (service_id, tag_id, hash_id, account_id);
            let mut mappings_petitioned_table = tx.open_table(&mappings_petitioned::TABLE)?;
            if mappings_petitioned_table.get(&key)?.is_some() {
                continue;
            }
            mappings_petitioned_table.insert(&key, &QueuedRecord { reason_id })?;
            drop(mappings_petitioned_table);

            Self::petition_index_add_tx(
                tx,
                service_id,
                ContentKind::Mappings,
                PetitionStatus::Petitioned,
                account_id,
                reason_id,
                1,
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPetitionedMappings, 1)?;
            petitioned += 1;
        }
        Ok(petitioned)
    }

    pub fn deny_mapping_pends_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        reason_id: ReasonId,
    ) -> DbResult<u64> {
        let dropped = {
            let mut mappings_pending_table = tx.open_table(&mappings_pending::TABLE)?;
            let keys: Vec<(ServiceId, MasterTagId, MasterHashId, AccountId)> =
                mappings_pending_table
                    .range(
                        (service_id, MasterTagId::ZERO, MasterHashId::ZERO, AccountId::ZERO)
                            ..=(service_id, MasterTagId::MAX, MasterHashId::MAX, AccountId::MAX),
                    )?
                    .filter_map(|res| match res {
                        Ok((k, v)) => {
                            let key = k.value();
                            (key.3 == account_id && v.value().reason_id == reason_id)
                                .then_some(Ok(key))
                        }
                        Err(err) => Some(Err(err)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
            for key in &keys {
                mappings_pending_table.remove(key)?;
            }
            keys.len() as u64
        };

        if 0 < dropped {
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::Mappings,
                PetitionStatus::Pending,
                account_id,
                reason_id,
                dropped,
            )?;
            Self::bump_info_tx(
                tx,
                service_id,
                ServiceInfoKind::NumPendingMappings,
                -(dropped as i64),
            )?;
            Self::add_petition_score_tx(tx, service_id, account_id, -(dropped as i64))?;
        }
        Ok(dropped)
    }

    pub fn deny_mapping_petitions_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        reason_id: ReasonId,
    ) -> DbResult<u64> {
        let dropped = {
            let mut mappings_petitioned_table = tx.open_table(&mappings_petitioned::TABLE)?;
            let keys: Vec<(ServiceId, ServiceTagId, ServiceHashId, AccountId)> =
                mappings_petitioned_table
                    .range(
                        (service_id, ServiceTagId::ZERO, ServiceHashId::ZERO, AccountId::ZERO)
                            ..=(service_id, ServiceTagId::MAX, ServiceHashId::MAX, AccountId::MAX),
                    )?
                    .filter_map(|res| match res {
                        Ok((k, v)) => {
                            let key = k.value();
                            (key.3 == account_id && v.value().reason_id == reason_id)
                                .then_some(Ok(key))
                        }
                        Err(err) => Some(Err(err)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
            for key in &keys {
                mappings_petitioned_table.remove(key)?;
            }
            keys.len() as u64
        };

        if 0 < dropped {
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::Mappings,
                PetitionStatus::Petitioned,
                account_id,
                reason_id,
                dropped,
            )?;
            Self::bump_info_tx(
                tx,
                service_id,
                ServiceInfoKind::NumPetitionedMappings,
                -(dropped as i64),
            )?;
            Self::add_petition_score_tx(tx, service_id, account_id, -(dropped as i64))?;
        }
        Ok(dropped)
    }

    // ========================================================================
    // Tag parents
    // ========================================================================

    /// Commit a child→parent row.
    pub fn add_tag_parent_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        child: &Tag,
        parent: &Tag,
        overwrite_deleted: bool,
        now: Timestamp,
    ) -> DbResult<bool> {
        let (child_id, child_master) = Self::tag_to_service_ids_tx(tx, service_id, child, now)?;
        let (parent_id, parent_master) = Self::tag_to_service_ids_tx(tx, service_id, parent, now)?;
        let key = (service_id, child_id, parent_id);

        {
            let tag_parents_current_table = tx.open_table(&tag_parents_current::TABLE)?;
            if tag_parents_current_table.get(&key)?.is_some() {
                return Ok(false);
            }
        }
        {
            let mut tag_parents_deleted_table = tx.open_table(&tag_parents_deleted::TABLE)?;
            if tag_parents_deleted_table.get(&key)?.is_some() {
                if !overwrite_deleted {
                    return Err(ApiError::conflict("tag parent was previously deleted").into());
                }
                tag_parents_deleted_table.remove(&key)?;
                Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumDeletedTagParents, -1)?;
            }
        }

        tx.open_table(&tag_parents_current::TABLE)?.insert(
            &key,
            &RowRecord {
                account_id,
                committed_at: now,
            },
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumTagParents, 1)?;

        Self::clear_pair_pending_tx(
            tx,
            service_id,
            ContentKind::TagParents,
            child_master,
            parent_master,
        )?;

        Ok(true)
    }

    /// Move a child→parent row current → deleted.
    pub fn delete_tag_parent_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        actor_account_id: AccountId,
        child: &Tag,
        parent: &Tag,
        now: Timestamp,
    ) -> DbResult<bool> {
        let Some(child_id) = Self::resolve_service_tag_id_of_tag_tx(tx, service_id, child)? else {
            return Ok(false);
        };
        let Some(parent_id) = Self::resolve_service_tag_id_of_tag_tx(tx, service_id, parent)?
        else {
            return Ok(false);
        };
        let key = (service_id, child_id, parent_id);

        let removed = {
            let mut tag_parents_current_table = tx.open_table(&tag_parents_current::TABLE)?;
            tag_parents_current_table.remove(&key)?.is_some()
        };
        if !removed {
            return Ok(false);
        }

        tx.open_table(&tag_parents_deleted::TABLE)?.insert(
            &key,
            &RowRecord {
                account_id: actor_account_id,
                committed_at: now,
            },
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumTagParents, -1)?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumDeletedTagParents, 1)?;

        Self::reward_and_drop_pair_petitions_tx(tx, service_id, child_id, parent_id)?;

        Ok(true)
    }

    pub fn pend_tag_parent_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        child: &Tag,
        parent: &Tag,
        reason: &str,
        now: Timestamp,
    ) -> DbResult<bool> {
        let reason_id = Self::intern_reason_tx(tx, reason)?;
        let (child_master, parent_master) =
            Self::tags_to_master_ids_tx(tx, child, parent)?;

        // skip when the pair is already current
        if Self::pair_is_current_tx(
            tx,
            service_id,
            ContentKind::TagParents,
            child_master,
            parent_master,
        )? {
            return Ok(false);
        }

        let key = (service_id, child_master, parent_master, account_id);
        {
            let mut tag_parents_pending_table = tx.open_table(&tag_parents_pending::TABLE)?;
            if tag_parents_pending_table.get(&key)?.is_some() {
                return Ok(false);
            }
            tag_parents_pending_table.insert(&key, &QueuedRecord { reason_id })?;
        }

        Self::petition_index_add_tx(
            tx,
            service_id,
            ContentKind::TagParents,
            PetitionStatus::Pending,
            account_id,
            reason_id,
            1,
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPendingTagParents, 1)?;
        let _ = now;
        Ok(true)
    }

    pub fn petition_tag_parent_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        child: &Tag,
        parent: &Tag,
        reason: &str,
        now: Timestamp,
    ) -> DbResult<bool> {
        let _ = now;
        let reason_id = Self::intern_reason_tx(tx, reason)?;
        let Some(child_id) = Self::resolve_service_tag_id_of_tag_tx(tx, service_id, child)? else {
            return Ok(false);
        };
        let Some(parent_id) = Self::resolve_service_tag_id_of_tag_tx(tx, service_id, parent)?
        else {
            return Ok(false);
        };

        {
            let tag_parents_current_table = tx.open_table(&tag_parents_current::TABLE)?;
            if tag_parents_current_table
                .get(&(service_id, child_id, parent_id))?
                .is_none()
            {
                return Ok(false);
            }
        }

        let key = (service_id, child_id, parent_id, account_id);
        {
            let mut tag_parents_petitioned_table =
                tx.open_table(&tag_parents_petitioned::TABLE)?;
            if tag_parents_petitioned_table.get(&key)?.is_some() {
                return Ok(false);
            }
            tag_parents_petitioned_table.insert(&key, &QueuedRecord { reason_id })?;
        }

        Self::petition_index_add_tx(
            tx,
            service_id,
            ContentKind::TagParents,
            PetitionStatus::Petitioned,
            account_id,
            reason_id,
            1,
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPetitionedTagParents, 1)?;
        Ok(true)
    }

    // ========================================================================
    // Tag siblings
    // ========================================================================

    /// Commit a bad→good sibling row.
    ///
    /// The bad tag is a primary key in current: an existing pairing to a
    /// different good tag is deleted in the same transaction before the new
    /// row lands.
    pub fn add_tag_sibling_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        bad: &Tag,
        good: &Tag,
        overwrite_deleted: bool,
        now: Timestamp,
    ) -> DbResult<bool> {
        let (bad_id, bad_master) = Self::tag_to_service_ids_tx(tx, service_id, bad, now)?;
        let (good_id, good_master) = Self::tag_to_service_ids_tx(tx, service_id, good, now)?;

        {
            let tag_siblings_current_table = tx.open_table(&tag_siblings_current::TABLE)?;
            if let Some(existing) = tag_siblings_current_table
                .get(&(service_id, bad_id))?
                .map(|g| g.value())
            {
                if existing.good_id == good_id {
                    return Ok(false);
                }
            }
        }

        // replace any existing pairing for this bad tag
        Self::delete_sibling_row_tx(tx, service_id, account_id, bad_id, now)?;

        {
            let mut tag_siblings_deleted_table = tx.open_table(&tag_siblings_deleted::TABLE)?;
            if tag_siblings_deleted_table
                .get(&(service_id, bad_id, good_id))?
                .is_some()
            {
                if !overwrite_deleted {
                    return Err(ApiError::conflict("tag sibling was previously deleted").into());
                }
                tag_siblings_deleted_table.remove(&(service_id, bad_id, good_id))?;
                Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumDeletedTagSiblings, -1)?;
            }
        }

        tx.open_table(&tag_siblings_current::TABLE)?.insert(
            &(service_id, bad_id),
            &SiblingRecord {
                good_id,
                account_id,
                committed_at: now,
            },
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumTagSiblings, 1)?;

        Self::clear_pair_pending_tx(
            tx,
            service_id,
            ContentKind::TagSiblings,
            bad_master,
            good_master,
        )?;

        Ok(true)
    }

    /// Move the bad tag's current sibling row (whatever it points at) to
    /// deleted. Returns `false` when there is none.
    pub fn delete_tag_sibling_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        actor_account_id: AccountId,
        bad: &Tag,
        now: Timestamp,
    ) -> DbResult<bool> {
        let Some(bad_id) = Self::resolve_service_tag_id_of_tag_tx(tx, service_id, bad)? else {
            return Ok(false);
        };
        Self::delete_sibling_row_tx(tx, service_id, actor_account_id, bad_id, now)
    }

    fn delete_sibling_row_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        actor_account_id: AccountId,
        bad_id: ServiceTagId,
        now: Timestamp,
    ) -> DbResult<bool> {
        let removed = {
            let mut tag_siblings_current_table = tx.open_table(&tag_siblings_current::TABLE)?;
            tag_siblings_current_table
                .remove(&(service_id, bad_id))?
                .map(|g| g.value())
        };
        let Some(existing) = removed else {
            return Ok(false);
        };

        tx.open_table(&tag_siblings_deleted::TABLE)?.insert(
            &(service_id, bad_id, existing.good_id),
            &RowRecord {
                account_id: actor_account_id,
                committed_at: now,
            },
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumTagSiblings, -1)?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumDeletedTagSiblings, 1)?;

        Self::reward_and_drop_sibling_petitions_tx(tx, service_id, bad_id)?;

        Ok(true)
    }

    pub fn pend_tag_sibling_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        bad: &Tag,
        good: &Tag,
        reason: &str,
        now: Timestamp,
    ) -> DbResult<bool> {
        let _ = now;
        let reason_id = Self::intern_reason_tx(tx, reason)?;
        let (bad_master, good_master) = Self::tags_to_master_ids_tx(tx, bad, good)?;

        if Self::pair_is_current_tx(
            tx,
            service_id,
            ContentKind::TagSiblings,
            bad_master,
            good_master,
        )? {
            return Ok(false);
        }

        let key = (service_id, bad_master, good_master, account_id);
        {
            let mut tag_siblings_pending_table = tx.open_table(&tag_siblings_pending::TABLE)?;
            if tag_siblings_pending_table.get(&key)?.is_some() {
                return Ok(false);
            }
            tag_siblings_pending_table.insert(&key, &QueuedRecord { reason_id })?;
        }

        Self::petition_index_add_tx(
            tx,
            service_id,
            ContentKind::TagSiblings,
            PetitionStatus::Pending,
            account_id,
            reason_id,
            1,
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPendingTagSiblings, 1)?;
        Ok(true)
    }

    pub fn petition_tag_sibling_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        bad: &Tag,
        good: &Tag,
        reason: &str,
        now: Timestamp,
    ) -> DbResult<bool> {
        let _ = now;
        let reason_id = Self::intern_reason_tx(tx, reason)?;
        let Some(bad_id) = Self::resolve_service_tag_id_of_tag_tx(tx, service_id, bad)? else {
            return Ok(false);
        };
        let Some(good_id) = Self::resolve_service_tag_id_of_tag_tx(tx, service_id, good)? else {
            return Ok(false);
        };

        {
            let tag_siblings_current_table = tx.open_table(&tag_siblings_current::TABLE)?;
            let points_at_good = tag_siblings_current_table
                .get(&(service_id, bad_id))?
                .map(|g| g.value().good_id == good_id)
                .unwrap_or(false);
            if !points_at_good {
                return Ok(false);
            }
        }

        let key = (service_id, bad_id, good_id, account_id);
        {
            let mut tag_siblings_petitioned_table =
                tx.open_table(&tag_siblings_petitioned::TABLE)?;
            if tag_siblings_petitioned_table.get(&key)?.is_some() {
                return Ok(false);
            }
            tag_siblings_petitioned_table.insert(&key, &QueuedRecord { reason_id })?;
        }

        Self::petition_index_add_tx(
            tx,
            service_id,
            ContentKind::TagSiblings,
            PetitionStatus::Petitioned,
            account_id,
            reason_id,
            1,
        )?;
        Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPetitionedTagSiblings, 1)?;
        Ok(true)
    }

    // ========================================================================
    // Pair-kind shared helpers
    // ========================================================================

    fn tag_to_service_ids_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        tag: &Tag,
        now: Timestamp,
    ) -> DbResult<(ServiceTagId, MasterTagId)> {
        let master_tag_id = {
            let mut master_tag_ids_table = tx.open_table(&master_tag_ids::TABLE)?;
            let mut master_tags_table = tx.open_table(&master_tags::TABLE)?;
            let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
            Self::get_or_create_master_tag_id_tx(
                tag,
                &mut master_tag_ids_table,
                &mut master_tags_table,
                &mut master_counters_table,
            )?
        };
        let tag_id = Self::get_or_create_service_tag_id_tx(tx, service_id, master_tag_id, now)?;
        Ok((tag_id, master_tag_id))
    }

    fn tags_to_master_ids_tx(
        tx: &WriteTransactionCtx,
        a: &Tag,
        b: &Tag,
    ) -> DbResult<(MasterTagId, MasterTagId)> {
        let mut master_tag_ids_table = tx.open_table(&master_tag_ids::TABLE)?;
        let mut master_tags_table = tx.open_table(&master_tags::TABLE)?;
        let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
        let a_id = Self::get_or_create_master_tag_id_tx(
            a,
            &mut master_tag_ids_table,
            &mut master_tags_table,
            &mut master_counters_table,
        )?;
        let b_id = Self::get_or_create_master_tag_id_tx(
            b,
            &mut master_tag_ids_table,
            &mut master_tags_table,
            &mut master_counters_table,
        )?;
        Ok((a_id, b_id))
    }

    /// Is the (a, b) pair a current row of the given pair kind?
    fn pair_is_current_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        kind: ContentKind,
        a_master: MasterTagId,
        b_master: MasterTagId,
    ) -> DbResult<bool> {
        let service_tag_ids_table = tx.open_table(&crate::service_tag_ids::TABLE)?;
        let a = Self::lookup_service_tag_id_tx(service_id, a_master, &service_tag_ids_table)?;
        let b = Self::lookup_service_tag_id_tx(service_id, b_master, &service_tag_ids_table)?;
        let (Some(a), Some(b)) = (a, b) else {
            return Ok(false);
        };
        match kind {
            ContentKind::TagParents => {
                let table = tx.open_table(&tag_parents_current::TABLE)?;
                Ok(table.get(&(service_id, a, b))?.is_some())
            }
            ContentKind::TagSiblings => {
                let table = tx.open_table(&tag_siblings_current::TABLE)?;
                Ok(table
                    .get(&(service_id, a))?
                    .map(|g| g.value().good_id == b)
                    .unwrap_or(false))
            }
            _ => Ok(false),
        }
    }

    /// Petition-reward weight of a tag pair: the child/bad tag's current
    /// mapping count, floored at one.
    fn pair_reward_weight_by_id_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        tag_id: ServiceTagId,
    ) -> DbResult<i64> {
        let mappings_current_table = tx.open_table(&mappings_current::TABLE)?;
        Ok(
            Self::current_mapping_count_tx(service_id, tag_id, &mappings_current_table)?.max(1)
                as i64,
        )
    }

    /// [`Self::pair_reward_weight_by_id_tx`] for master-scoped (pending)
    /// pairs; a tag with no service id yet cannot have mappings, so it
    /// weighs one.
    fn pair_reward_weight_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        master_tag_id: MasterTagId,
    ) -> DbResult<i64> {
        let tag_id = {
            let service_tag_ids_table = tx.open_table(&crate::service_tag_ids::TABLE)?;
            Self::lookup_service_tag_id_tx(service_id, master_tag_id, &service_tag_ids_table)?
        };
        match tag_id {
            Some(tag_id) => Self::pair_reward_weight_by_id_tx(tx, service_id, tag_id),
            None => Ok(1),
        }
    }

    /// Clear all pending rows for a committed pair, rewarding the penders.
    fn clear_pair_pending_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        kind: ContentKind,
        a_master: MasterTagId,
        b_master: MasterTagId,
    ) -> DbResult<()> {
        let (cleared, pending_info) = match kind {
            ContentKind::TagParents => {
                let mut table = tx.open_table(&tag_parents_pending::TABLE)?;
                let entries: Vec<((ServiceId, MasterTagId, MasterTagId, AccountId), QueuedRecord)> =
                    table
                        .range(
                            (service_id, a_master, b_master, AccountId::ZERO)
                                ..=(service_id, a_master, b_master, AccountId::MAX),
                        )?
                        .map(|res| res.map(|(k, v)| (k.value(), v.value())))
                        .collect::<Result<Vec<_>, _>>()?;
                for (k, _) in &entries {
                    table.remove(k)?;
                }
                (entries, ServiceInfoKind::NumPendingTagParents)
            }
            ContentKind::TagSiblings => {
                let mut table = tx.open_table(&tag_siblings_pending::TABLE)?;
                let entries: Vec<((ServiceId, MasterTagId, MasterTagId, AccountId), QueuedRecord)> =
                    table
                        .range(
                            (service_id, a_master, b_master, AccountId::ZERO)
                                ..=(service_id, a_master, b_master, AccountId::MAX),
                        )?
                        .map(|res| res.map(|(k, v)| (k.value(), v.value())))
                        .collect::<Result<Vec<_>, _>>()?;
                for (k, _) in &entries {
                    table.remove(k)?;
                }
                (entries, ServiceInfoKind::NumPendingTagSiblings)
            }
            _ => return Ok(()),
        };

        let weight = Self::pair_reward_weight_tx(tx, service_id, a_master)?;
        for ((_, _, _, pend_account_id), queued) in cleared {
            Self::petition_index_sub_tx(
                tx,
                service_id,
                kind,
                PetitionStatus::Pending,
                pend_account_id,
                queued.reason_id,
                1,
            )?;
            Self::bump_info_tx(tx, service_id, pending_info, -1)?;
            Self::add_petition_score_tx(tx, service_id, pend_account_id, weight)?;
        }
        Ok(())
    }

    fn reward_and_drop_pair_petitions_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        a_id: ServiceTagId,
        b_id: ServiceTagId,
    ) -> DbResult<()> {
        let petitions = {
            let mut table = tx.open_table(&tag_parents_petitioned::TABLE)?;
            let entries: Vec<((ServiceId, ServiceTagId, ServiceTagId, AccountId), QueuedRecord)> =
                table
                    .range(
                        (service_id, a_id, b_id, AccountId::ZERO)
                            ..=(service_id, a_id, b_id, AccountId::MAX),
                    )?
                    .map(|res| res.map(|(k, v)| (k.value(), v.value())))
                    .collect::<Result<Vec<_>, _>>()?;
            for (k, _) in &entries {
                table.remove(k)?;
            }
            entries
        };
        let weight = Self::pair_reward_weight_by_id_tx(tx, service_id, a_id)?;
        for ((_, _, _, petitioner), queued) in petitions {
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::TagParents,
                PetitionStatus::Petitioned,
                petitioner,
                queued.reason_id,
                1,
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPetitionedTagParents, -1)?;
            Self::add_petition_score_tx(tx, service_id, petitioner, weight)?;
        }
        Ok(())
    }

    fn reward_and_drop_sibling_petitions_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        bad_id: ServiceTagId,
    ) -> DbResult<()> {
        let petitions = {
            let mut table = tx.open_table(&tag_siblings_petitioned::TABLE)?;
            let entries: Vec<((ServiceId, ServiceTagId, ServiceTagId, AccountId), QueuedRecord)> =
                table
                    .range(
                        (service_id, bad_id, ServiceTagId::ZERO, AccountId::ZERO)
                            ..=(service_id, bad_id, ServiceTagId::MAX, AccountId::MAX),
                    )?
                    .map(|res| res.map(|(k, v)| (k.value(), v.value())))
                    .collect::<Result<Vec<_>, _>>()?;
            for (k, _) in &entries {
                table.remove(k)?;
            }
            entries
        };
        let weight = Self::pair_reward_weight_by_id_tx(tx, service_id, bad_id)?;
        for ((_, _, _, petitioner), queued) in petitions {
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::TagSiblings,
                PetitionStatus::Petitioned,
                petitioner,
                queued.reason_id,
                1,
            )?;
            Self::bump_info_tx(tx, service_id, ServiceInfoKind::NumPetitionedTagSiblings, -1)?;
            Self::add_petition_score_tx(tx, service_id, petitioner, weight)?;
        }
        Ok(())
    }

    // ========================================================================
    // Pair-kind denials
    // ========================================================================

    pub fn deny_tag_parent_pends_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        reason_id: ReasonId,
    ) -> DbResult<u64> {
        let keys: Vec<(ServiceId, MasterTagId, MasterTagId, AccountId)> = {
            let mut table = tx.open_table(&tag_parents_pending::TABLE)?;
            let keys: Vec<(ServiceId, MasterTagId, MasterTagId, AccountId)> = table
                .range(
                    (service_id, MasterTagId::ZERO, MasterTagId::ZERO, AccountId::ZERO)
                        ..=(service_id, MasterTagId::MAX, MasterTagId::MAX, AccountId::MAX),
                )?
                .filter_map(|res| match res {
                    Ok((k, v)) => {
                        let key = k.value();
                        (key.3 == account_id && v.value().reason_id == reason_id).then_some(Ok(key))
                    }
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            for key in &keys {
                table.remove(key)?;
            }
            keys
        };
        let dropped = keys.len() as u64;
        if 0 < dropped {
            // each pair docks the child tag's weight
            let mut score = 0i64;
            for (_, child_master, _, _) in &keys {
                score += Self::pair_reward_weight_tx(tx, service_id, *child_master)?;
            }
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::TagParents,
                PetitionStatus::Pending,
                account_id,
                reason_id,
                dropped,
            )?;
            Self::bump_info_tx(
                tx,
                service_id,
                ServiceInfoKind::NumPendingTagParents,
                -(dropped as i64),
            )?;
            Self::add_petition_score_tx(tx, service_id, account_id, -score)?;
        }
        Ok(dropped)
    }

    pub fn deny_tag_parent_petitions_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        reason_id: ReasonId,
    ) -> DbResult<u64> {
        let keys: Vec<(ServiceId, ServiceTagId, ServiceTagId, AccountId)> = {
            let mut table = tx.open_table(&tag_parents_petitioned::TABLE)?;
            let keys: Vec<(ServiceId, ServiceTagId, ServiceTagId, AccountId)> = table
                .range(
                    (service_id, ServiceTagId::ZERO, ServiceTagId::ZERO, AccountId::ZERO)
                        ..=(service_id, ServiceTagId::MAX, ServiceTagId::MAX, AccountId::MAX),
                )?
                .filter_map(|res| match res {
                    Ok((k, v)) => {
                        let key = k.value();
                        (key.3 == account_id && v.value().reason_id == reason_id).then_some(Ok(key))
                    }
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            for key in &keys {
                table.remove(key)?;
            }
            keys
        };
        let dropped = keys.len() as u64;
        if 0 < dropped {
            // each pair docks the child tag's weight
            let mut score = 0i64;
            for (_, child_id, _, _) in &keys {
                score += Self::pair_reward_weight_by_id_tx(tx, service_id, *child_id)?;
            }
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::TagParents,
                PetitionStatus::Petitioned,
                account_id,
                reason_id,
                dropped,
            )?;
            Self::bump_info_tx(
                tx,
                service_id,
                ServiceInfoKind::NumPetitionedTagParents,
                -(dropped as i64),
            )?;
            Self::add_petition_score_tx(tx, service_id, account_id, -score)?;
        }
        Ok(dropped)
    }

    pub fn deny_tag_sibling_pends_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        reason_id: ReasonId,
    ) -> DbResult<u64> {
        let keys: Vec<(ServiceId, MasterTagId, MasterTagId, AccountId)> = {
            let mut table = tx.open_table(&tag_siblings_pending::TABLE)?;
            let keys: Vec<(ServiceId, MasterTagId, MasterTagId, AccountId)> = table
                .range(
                    (service_id, MasterTagId::ZERO, MasterTagId::ZERO, AccountId::ZERO)
                        ..=(service_id, MasterTagId::MAX, MasterTagId::MAX, AccountId::MAX),
                )?
                .filter_map(|res| match res {
                    Ok((k, v)) => {
                        let key = k.value();
                        (key.3 == account_id && v.value().reason_id == reason_id).then_some(Ok(key))
                    }
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            for key in &keys {
                table.remove(key)?;
            }
            keys
        };
        let dropped = keys.len() as u64;
        if 0 < dropped {
            // each pair docks the bad tag's weight
            let mut score = 0i64;
            for (_, bad_master, _, _) in &keys {
                score += Self::pair_reward_weight_tx(tx, service_id, *bad_master)?;
            }
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::TagSiblings,
                PetitionStatus::Pending,
                account_id,
                reason_id,
                dropped,
            )?;
            Self::bump_info_tx(
                tx,
                service_id,
                ServiceInfoKind::NumPendingTagSiblings,
                -(dropped as i64),
            )?;
            Self::add_petition_score_tx(tx, service_id, account_id, -score)?;
        }
        Ok(dropped)
    }

    pub fn deny_tag_sibling_petitions_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        reason_id: ReasonId,
    ) -> DbResult<u64> {
        let keys: Vec<(ServiceId, ServiceTagId, ServiceTagId, AccountId)> = {
            let mut table = tx.open_table(&tag_siblings_petitioned::TABLE)?;
            let keys: Vec<(ServiceId, ServiceTagId, ServiceTagId, AccountId)> = table
                .range(
                    (service_id, ServiceTagId::ZERO, ServiceTagId::ZERO, AccountId::ZERO)
                        ..=(service_id, ServiceTagId::MAX, ServiceTagId::MAX, AccountId::MAX),
                )?
                .filter_map(|res| match res {
                    Ok((k, v)) => {
                        let key = k.value();
                        (key.3 == account_id && v.value().reason_id == reason_id).then_some(Ok(key))
                    }
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            for key in &keys {
                table.remove(key)?;
            }
            keys
        };
        let dropped = keys.len() as u64;
        if 0 < dropped {
            // each pair docks the bad tag's weight
            let mut score = 0i64;
            for (_, bad_id, _, _) in &keys {
                score += Self::pair_reward_weight_by_id_tx(tx, service_id, *bad_id)?;
            }
            Self::petition_index_sub_tx(
                tx,
                service_id,
                ContentKind::TagSiblings,
                PetitionStatus::Petitioned,
                account_id,
                reason_id,
                dropped,
            )?;
            Self::bump_info_tx(
                tx,
                service_id,
                ServiceInfoKind::NumPetitionedTagSiblings,
                -(dropped as i64),
            )?;
            Self::add_petition_score_tx(tx, service_id, account_id, -score)?;
        }
        Ok(dropped)
    }
}
