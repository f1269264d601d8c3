//! Master definition store: stable ids for hashes, tags and reasons, plus
//! the per-service dense id maps.

use hoard_core::id::FileHash;
use hoard_core::tag::Tag;
use hoard_core::{MasterHashId, MasterTagId, ReasonId, ServiceId, Timestamp};

use crate::{
    Database, DbResult, MasterCounterKind, ServiceCounterKind, ServiceHashIdRecord,
    ServiceTagIdRecord, WriteTransactionCtx, master_counters, master_hash_ids, master_hashes,
    master_tag_ids, master_tags, reason_ids, reasons, service_counters, service_hash_ids,
    service_hashes, service_tag_ids, service_tags,
};

impl Database {
    /// Insert-or-get the database-wide id for a hash.
    pub fn get_or_create_master_hash_id_tx(
        hash: FileHash,
        master_hash_ids_table: &mut master_hash_ids::Table,
        master_hashes_table: &mut master_hashes::Table,
        master_counters_table: &mut master_counters::Table,
    ) -> DbResult<MasterHashId> {
        if let Some(id) = master_hash_ids_table.get(&hash)?.map(|g| g.value()) {
            return Ok(id);
        }
        let id = MasterHashId::new(Self::next_master_id_tx(
            MasterCounterKind::MasterHash,
            master_counters_table,
        )?);
        master_hash_ids_table.insert(&hash, &id)?;
        master_hashes_table.insert(&id, &hash)?;
        Ok(id)
    }

    pub fn lookup_master_hash_id_tx(
        hash: FileHash,
        master_hash_ids_table: &impl master_hash_ids::ReadableTable,
    ) -> DbResult<Option<MasterHashId>> {
        Ok(master_hash_ids_table.get(&hash)?.map(|g| g.value()))
    }

    pub fn get_master_hash_tx(
        hash_id: MasterHashId,
        master_hashes_table: &impl master_hashes::ReadableTable,
    ) -> DbResult<Option<FileHash>> {
        Ok(master_hashes_table.get(&hash_id)?.map(|g| g.value()))
    }

    /// Insert-or-get the database-wide id for a (normalized) tag.
    pub fn get_or_create_master_tag_id_tx(
        tag: &Tag,
        master_tag_ids_table: &mut master_tag_ids::Table,
        master_tags_table: &mut master_tags::Table,
        master_counters_table: &mut master_counters::Table,
    ) -> DbResult<MasterTagId> {
        if let Some(id) = master_tag_ids_table.get(tag)?.map(|g| g.value()) {
            return Ok(id);
        }
        let id = MasterTagId::new(Self::next_master_id_tx(
            MasterCounterKind::MasterTag,
            master_counters_table,
        )?);
        master_tag_ids_table.insert(tag, &id)?;
        master_tags_table.insert(&id, tag)?;
        Ok(id)
    }

    pub fn get_master_tag_tx(
        tag_id: MasterTagId,
        master_tags_table: &impl master_tags::ReadableTable,
    ) -> DbResult<Option<Tag>> {
        Ok(master_tags_table.get(&tag_id)?.map(|g| g.value()))
    }

    /// Intern a petition reason.
    pub fn get_or_create_reason_id_tx(
        reason: &str,
        reason_ids_table: &mut reason_ids::Table,
        reasons_table: &mut reasons::Table,
        master_counters_table: &mut master_counters::Table,
    ) -> DbResult<ReasonId> {
        let reason = reason.to_owned();
        if let Some(id) = reason_ids_table.get(&reason)?.map(|g| g.value()) {
            return Ok(id);
        }
        let id = ReasonId::new(Self::next_master_id_tx(
            MasterCounterKind::Reason,
            master_counters_table,
        )?);
        reason_ids_table.insert(&reason, &id)?;
        reasons_table.insert(&id, &reason)?;
        Ok(id)
    }

    pub fn get_reason_tx(
        reason_id: ReasonId,
        reasons_table: &impl reasons::ReadableTable,
    ) -> DbResult<Option<String>> {
        Ok(reasons_table.get(&reason_id)?.map(|g| g.value()))
    }

    // ========================================================================
    // Per-service id maps
    // ========================================================================

    /// Insert-or-get a service's dense id for a master hash.
    ///
    /// First sighting records `created_at`, which later bounds the
    /// definitions window the bundler emits this hash in.
    pub fn get_or_create_service_hash_id_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        master_hash_id: MasterHashId,
        now: Timestamp,
    ) -> DbResult<hoard_core::ServiceHashId> {
        let mut service_hash_ids_table = tx.open_table(&service_hash_ids::TABLE)?;
        if let Some(record) = service_hash_ids_table
            .get(&(service_id, master_hash_id))?
            .map(|g| g.value())
        {
            return Ok(record.hash_id);
        }

        let mut service_counters_table = tx.open_table(&service_counters::TABLE)?;
        let hash_id = hoard_core::ServiceHashId::new(Self::next_service_id_tx(
            service_id,
            ServiceCounterKind::ServiceHash,
            &mut service_counters_table,
        )?);

        service_hash_ids_table.insert(
            &(service_id, master_hash_id),
            &ServiceHashIdRecord {
                hash_id,
                created_at: now,
            },
        )?;
        tx.open_table(&service_hashes::TABLE)?
            .insert(&(service_id, hash_id), &master_hash_id)?;
        Ok(hash_id)
    }

    pub fn lookup_service_hash_id_tx(
        service_id: ServiceId,
        master_hash_id: MasterHashId,
        service_hash_ids_table: &impl service_hash_ids::ReadableTable,
    ) -> DbResult<Option<hoard_core::ServiceHashId>> {
        Ok(service_hash_ids_table
            .get(&(service_id, master_hash_id))?
            .map(|g| g.value().hash_id))
    }

    pub fn get_service_hash_master_tx(
        service_id: ServiceId,
        hash_id: hoard_core::ServiceHashId,
        service_hashes_table: &impl service_hashes::ReadableTable,
    ) -> DbResult<Option<MasterHashId>> {
        Ok(service_hashes_table
            .get(&(service_id, hash_id))?
            .map(|g| g.value()))
    }

    /// Insert-or-get a service's dense id for a master tag.
    pub fn get_or_create_service_tag_id_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        master_tag_id: MasterTagId,
        now: Timestamp,
    ) -> DbResult<hoard_core::ServiceTagId> {
        let mut service_tag_ids_table = tx.open_table(&service_tag_ids::TABLE)?;
        if let Some(record) = service_tag_ids_table
            .get(&(service_id, master_tag_id))?
            .map(|g| g.value())
        {
            return Ok(record.tag_id);
        }

        let mut service_counters_table = tx.open_table(&service_counters::TABLE)?;
        let tag_id = hoard_core::ServiceTagId::new(Self::next_service_id_tx(
            service_id,
            ServiceCounterKind::ServiceTag,
            &mut service_counters_table,
        )?);

        service_tag_ids_table.insert(
            &(service_id, master_tag_id),
            &ServiceTagIdRecord {
                tag_id,
                created_at: now,
            },
        )?;
        tx.open_table(&service_tags::TABLE)?
            .insert(&(service_id, tag_id), &master_tag_id)?;
        Ok(tag_id)
    }

    pub fn lookup_service_tag_id_tx(
        service_id: ServiceId,
        master_tag_id: MasterTagId,
        service_tag_ids_table: &impl service_tag_ids::ReadableTable,
    ) -> DbResult<Option<hoard_core::ServiceTagId>> {
        Ok(service_tag_ids_table
            .get(&(service_id, master_tag_id))?
            .map(|g| g.value().tag_id))
    }

    pub fn get_service_tag_master_tx(
        service_id: ServiceId,
        tag_id: hoard_core::ServiceTagId,
        service_tags_table: &impl service_tags::ReadableTable,
    ) -> DbResult<Option<MasterTagId>> {
        Ok(service_tags_table
            .get(&(service_id, tag_id))?
            .map(|g| g.value()))
    }

    /// Resolve a service tag id all the way back to the tag value.
    pub fn resolve_service_tag_tx(
        service_id: ServiceId,
        tag_id: hoard_core::ServiceTagId,
        service_tags_table: &impl service_tags::ReadableTable,
        master_tags_table: &impl master_tags::ReadableTable,
    ) -> DbResult<Option<Tag>> {
        let Some(master_tag_id) =
            Self::get_service_tag_master_tx(service_id, tag_id, service_tags_table)?
        else {
            return Ok(None);
        };
        Self::get_master_tag_tx(master_tag_id, master_tags_table)
    }

    /// Resolve a service hash id all the way back to the hash value.
    pub fn resolve_service_hash_tx(
        service_id: ServiceId,
        hash_id: hoard_core::ServiceHashId,
        service_hashes_table: &impl service_hashes::ReadableTable,
        master_hashes_table: &impl master_hashes::ReadableTable,
    ) -> DbResult<Option<FileHash>> {
        let Some(master_hash_id) =
            Self::get_service_hash_master_tx(service_id, hash_id, service_hashes_table)?
        else {
            return Ok(None);
        };
        Self::get_master_hash_tx(master_hash_id, master_hashes_table)
    }
}
