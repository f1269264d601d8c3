//! Update-bundle construction queries and the per-service update index.

use std::collections::BTreeMap;

use hoard_core::id::UpdateHash;
use hoard_core::update::{
    ContentUpdate, DefinitionsUpdate, FileRow, MAX_CONTENT_ROWS, MAX_DEFINITIONS_ROWS,
    MAX_MAPPING_ROW_HASHES, MappingRows, TagParentRow, TagSiblingRow, UpdateBundle,
    UpdateMetadata, UpdateMetadataEntry,
};
use hoard_core::{MasterHashId, MasterTagId, ServiceHashId, ServiceId, ServiceTagId, Timestamp};
use redb_bincode::ReadTransaction;
use tracing::info;

use crate::{
    Database, DbResult, LOG_TARGET, RepoStateRecord, WriteTransactionCtx, file_infos,
    files_current, files_deleted, mappings_current, mappings_deleted, repo_states,
    service_hash_ids, service_hashes, service_tag_ids, tag_parents_current, tag_parents_deleted,
    tag_siblings_current, tag_siblings_deleted, update_metadata, updates,
};

fn in_window(t: Timestamp, begin: Timestamp, end: Timestamp) -> bool {
    begin <= t && t <= end
}

impl Database {
    /// Build the immutable bundles covering `[begin, end]`: definitions
    /// first, then content, chunked to the per-bundle row caps.
    ///
    /// Pure query; registering the result happens in [`Self::register_update_tx`]
    /// once the blobs are safely on disk.
    pub fn build_update_tx(
        dbtx: &ReadTransaction,
        service_id: ServiceId,
        begin: Timestamp,
        end: Timestamp,
    ) -> DbResult<Vec<UpdateBundle>> {
        let mut bundles = vec![];

        // -- definitions --
        let mut definitions = DefinitionsUpdate::default();
        {
            let service_hash_ids_table = dbtx.open_table(&service_hash_ids::TABLE)?;
            let master_hashes_table = dbtx.open_table(&crate::master_hashes::TABLE)?;
            for res in service_hash_ids_table
                .range((service_id, MasterHashId::ZERO)..=(service_id, MasterHashId::MAX))?
            {
                let (k, v) = res?;
                let record = v.value();
                if !in_window(record.created_at, begin, end) {
                    continue;
                }
                let master_hash_id = k.value().1;
                let Some(hash) = Self::get_master_hash_tx(master_hash_id, &master_hashes_table)?
                else {
                    continue;
                };
                definitions.hashes.push((record.hash_id, hash));
                if MAX_DEFINITIONS_ROWS <= definitions.num_rows() {
                    bundles.push(UpdateBundle::DefinitionsV0(std::mem::take(&mut definitions)));
                }
            }
        }
        {
            let service_tag_ids_table = dbtx.open_table(&service_tag_ids::TABLE)?;
            let master_tags_table = dbtx.open_table(&crate::master_tags::TABLE)?;
            for res in service_tag_ids_table
                .range((service_id, MasterTagId::ZERO)..=(service_id, MasterTagId::MAX))?
            {
                let (k, v) = res?;
                let record = v.value();
                if !in_window(record.created_at, begin, end) {
                    continue;
                }
                let master_tag_id = k.value().1;
                let Some(tag) = Self::get_master_tag_tx(master_tag_id, &master_tags_table)? else {
                    continue;
                };
                definitions.tags.push((record.tag_id, tag));
                if MAX_DEFINITIONS_ROWS <= definitions.num_rows() {
                    bundles.push(UpdateBundle::DefinitionsV0(std::mem::take(&mut definitions)));
                }
            }
        }
        if !definitions.is_empty() {
            bundles.push(UpdateBundle::DefinitionsV0(definitions));
        }

        // -- content --
        let mut content = ContentUpdate::default();

        {
            let files_current_table = dbtx.open_table(&files_current::TABLE)?;
            let service_hashes_table = dbtx.open_table(&service_hashes::TABLE)?;
            let file_infos_table = dbtx.open_table(&file_infos::TABLE)?;
            for res in files_current_table
                .range((service_id, ServiceHashId::ZERO)..=(service_id, ServiceHashId::MAX))?
            {
                let (k, v) = res?;
                if !in_window(v.value().committed_at, begin, end) {
                    continue;
                }
                let hash_id = k.value().1;
                let Some(master_hash_id) = service_hashes_table
                    .get(&(service_id, hash_id))?
                    .map(|g| g.value())
                else {
                    continue;
                };
                let Some(i) = file_infos_table.get(&master_hash_id)?.map(|g| g.value()) else {
                    continue;
                };
                content.file_adds.push(FileRow {
                    hash_id,
                    size: i.size,
                    mime: i.mime,
                    width: i.width,
                    height: i.height,
                    duration_ms: i.duration_ms,
                    num_frames: i.num_frames,
                    num_words: i.num_words,
                });
                Self::flush_content_if_full(&mut content, &mut bundles);
            }
        }
        {
            let files_deleted_table = dbtx.open_table(&files_deleted::TABLE)?;
            for res in files_deleted_table
                .range((service_id, ServiceHashId::ZERO)..=(service_id, ServiceHashId::MAX))?
            {
                let (k, v) = res?;
                if !in_window(v.value().committed_at, begin, end) {
                    continue;
                }
                content.file_deletes.push(k.value().1);
                Self::flush_content_if_full(&mut content, &mut bundles);
            }
        }

        // mappings: one row per tag, split into hash chunks
        for (deleted, table_rows) in [
            (false, Self::mapping_rows_in_window(dbtx, service_id, begin, end, false)?),
            (true, Self::mapping_rows_in_window(dbtx, service_id, begin, end, true)?),
        ] {
            for (tag_id, hash_ids) in table_rows {
                for chunk in hash_ids.chunks(MAX_MAPPING_ROW_HASHES) {
                    let row = MappingRows {
                        tag_id,
                        hash_ids: chunk.to_vec(),
                    };
                    if deleted {
                        content.mapping_deletes.push(row);
                    } else {
                        content.mapping_adds.push(row);
                    }
                    Self::flush_content_if_full(&mut content, &mut bundles);
                }
            }
        }

        {
            let table = dbtx.open_table(&tag_parents_current::TABLE)?;
            for res in table.range(
                (service_id, ServiceTagId::ZERO, ServiceTagId::ZERO)
                    ..=(service_id, ServiceTagId::MAX, ServiceTagId::MAX),
            )? {
                let (k, v) = res?;
                if !in_window(v.value().committed_at, begin, end) {
                    continue;
                }
                let (_, child_id, parent_id) = k.value();
                content.parent_adds.push(TagParentRow { child_id, parent_id });
                Self::flush_content_if_full(&mut content, &mut bundles);
            }
        }
        {
            let table = dbtx.open_table(&tag_parents_deleted::TABLE)?;
            for res in table.range(
                (service_id, ServiceTagId::ZERO, ServiceTagId::ZERO)
                    ..=(service_id, ServiceTagId::MAX, ServiceTagId::MAX),
            )? {
                let (k, v) = res?;
                if !in_window(v.value().committed_at, begin, end) {
                    continue;
                }
                let (_, child_id, parent_id) = k.value();
                content
                    .parent_deletes
                    .push(TagParentRow { child_id, parent_id });
                Self::flush_content_if_full(&mut content, &mut bundles);
            }
        }
        {
            let table = dbtx.open_table(&tag_siblings_current::TABLE)?;
            for res in table.range((service_id, ServiceTagId::ZERO)..=(service_id, ServiceTagId::MAX))? {
                let (k, v) = res?;
                let record = v.value();
                if !in_window(record.committed_at, begin, end) {
                    continue;
                }
                content.sibling_adds.push(TagSiblingRow {
                    bad_id: k.value().1,
                    good_id: record.good_id,
                });
                Self::flush_content_if_full(&mut content, &mut bundles);
            }
        }
        {
            let table = dbtx.open_table(&tag_siblings_deleted::TABLE)?;
            for res in table.range(
                (service_id, ServiceTagId::ZERO, ServiceTagId::ZERO)
                    ..=(service_id, ServiceTagId::MAX, ServiceTagId::MAX),
            )? {
                let (k, v) = res?;
                if !in_window(v.value().committed_at, begin, end) {
                    continue;
                }
                let (_, bad_id, good_id) = k.value();
                content.sibling_deletes.push(TagSiblingRow { bad_id, good_id });
                Self::flush_content_if_full(&mut content, &mut bundles);
            }
        }

        if !content.is_empty() {
            bundles.push(UpdateBundle::ContentV0(content));
        }

        Ok(bundles)
    }

    fn flush_content_if_full(content: &mut ContentUpdate, bundles: &mut Vec<UpdateBundle>) {
        if MAX_CONTENT_ROWS <= content.num_rows() {
            bundles.push(UpdateBundle::ContentV0(std::mem::take(content)));
        }
    }

    fn mapping_rows_in_window(
        dbtx: &ReadTransaction,
        service_id: ServiceId,
        begin: Timestamp,
        end: Timestamp,
        deleted: bool,
    ) -> DbResult<BTreeMap<ServiceTagId, Vec<ServiceHashId>>> {
        let mut rows: BTreeMap<ServiceTagId, Vec<ServiceHashId>> = BTreeMap::new();
        let range = (service_id, ServiceTagId::ZERO, ServiceHashId::ZERO)
            ..=(service_id, ServiceTagId::MAX, ServiceHashId::MAX);
        if deleted {
            let table = dbtx.open_table(&mappings_deleted::TABLE)?;
            for res in table.range(range)? {
                let (k, v) = res?;
                if in_window(v.value().committed_at, begin, end) {
                    let (_, tag_id, hash_id) = k.value();
                    rows.entry(tag_id).or_default().push(hash_id);
                }
            }
        } else {
            let table = dbtx.open_table(&mappings_current::TABLE)?;
            for res in table.range(range)? {
                let (k, v) = res?;
                if in_window(v.value().committed_at, begin, end) {
                    let (_, tag_id, hash_id) = k.value();
                    rows.entry(tag_id).or_default().push(hash_id);
                }
            }
        }
        Ok(rows)
    }

    /// Append a committed window to the service's update index. Blobs must
    /// already be on disk, so a crash can never leave the index pointing at
    /// bytes that do not exist.
    pub fn register_update_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        update_hashes: &[UpdateHash],
        begin: Timestamp,
        end: Timestamp,
        update_period_secs: u64,
    ) -> DbResult<u64> {
        let mut update_metadata_table = tx.open_table(&update_metadata::TABLE)?;
        let next_index = update_metadata_table
            .range((service_id, 0)..=(service_id, u64::MAX))?
            .next_back()
            .transpose()?
            .map(|(k, _)| k.value().1 + 1)
            .unwrap_or(0);

        update_metadata_table.insert(
            &(service_id, next_index),
            &crate::UpdateMetadataRecord {
                update_hashes: update_hashes.to_vec(),
                begin,
                end,
            },
        )?;
        drop(update_metadata_table);

        {
            let mut updates_table = tx.open_table(&updates::TABLE)?;
            for hash in update_hashes {
                updates_table.insert(&(service_id, *hash), &next_index)?;
            }
        }

        {
            let mut repo_states_table = tx.open_table(&repo_states::TABLE)?;
            let mut state = repo_states_table
                .get(&service_id)?
                .map(|g| g.value())
                .unwrap_or(RepoStateRecord {
                    next_update_due: Timestamp::ZERO,
                    next_nullification_update_index: 0,
                });
            state.next_update_due = end.saturating_add_secs(update_period_secs);
            repo_states_table.insert(&service_id, &state)?;
        }

        info!(
            target: LOG_TARGET,
            %service_id,
            update_index = next_index,
            bundles = update_hashes.len(),
            %begin,
            %end,
            "Registered update"
        );

        Ok(next_index)
    }

    /// Where the next update window starts: one second past the last end,
    /// or `Timestamp::ZERO` on a virgin service (the caller then seeds from
    /// service creation time).
    pub fn next_update_begin_tx(
        service_id: ServiceId,
        update_metadata_table: &impl update_metadata::ReadableTable,
    ) -> DbResult<Option<Timestamp>> {
        Ok(update_metadata_table
            .range((service_id, 0)..=(service_id, u64::MAX))?
            .next_back()
            .transpose()?
            .map(|(_, v)| v.value().end.saturating_add_secs(1)))
    }

    pub fn get_update_metadata_entry_tx(
        service_id: ServiceId,
        update_index: u64,
        update_metadata_table: &impl update_metadata::ReadableTable,
    ) -> DbResult<Option<crate::UpdateMetadataRecord>> {
        Ok(update_metadata_table
            .get(&(service_id, update_index))?
            .map(|g| g.value()))
    }

    pub fn next_update_index_tx(
        service_id: ServiceId,
        update_metadata_table: &impl update_metadata::ReadableTable,
    ) -> DbResult<u64> {
        Ok(update_metadata_table
            .range((service_id, 0)..=(service_id, u64::MAX))?
            .next_back()
            .transpose()?
            .map(|(k, _)| k.value().1 + 1)
            .unwrap_or(0))
    }

    /// The full client-facing update index.
    pub fn get_update_metadata_tx(
        service_id: ServiceId,
        update_metadata_table: &impl update_metadata::ReadableTable,
        repo_states_table: &impl repo_states::ReadableTable,
    ) -> DbResult<UpdateMetadata> {
        let entries = update_metadata_table
            .range((service_id, 0)..=(service_id, u64::MAX))?
            .map(|res| {
                res.map(|(k, v)| {
                    let record = v.value();
                    UpdateMetadataEntry {
                        update_index: k.value().1,
                        update_hashes: record.update_hashes,
                        begin: record.begin,
                        end: record.end,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let next_update_due = repo_states_table
            .get(&service_id)?
            .map(|g| g.value().next_update_due)
            .unwrap_or(Timestamp::ZERO);
        Ok(UpdateMetadata {
            entries,
            next_update_due,
        })
    }

    pub fn has_update_hash_tx(
        service_id: ServiceId,
        hash: UpdateHash,
        updates_table: &impl updates::ReadableTable,
    ) -> DbResult<bool> {
        Ok(updates_table.get(&(service_id, hash))?.is_some())
    }
}
