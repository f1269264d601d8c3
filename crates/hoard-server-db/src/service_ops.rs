//! Service roster: creation, options, dirty persistence, and the
//! precomputed service-info totals.

use hoard_core::account::AccountType;
use hoard_core::content::ContentKind;
use hoard_core::error::ApiError;
use hoard_core::id::{AccessKey, AccountKey, ServiceKey};
use hoard_core::service::{ServiceKind, ServiceOptions};
use hoard_core::{AccountId, ServiceId, Timestamp};
use tracing::info;

use crate::{
    Database, DbResult, LOG_TARGET, MasterCounterKind, RepoStateRecord, ServiceInfoKind,
    ServiceRecord, WriteTransactionCtx, files_current, files_deleted, files_pending,
    files_petitioned, mappings_current, mappings_deleted, mappings_pending, mappings_petitioned,
    master_counters, repo_states, service_hashes, service_ids, service_info, services,
    tag_parents_current, tag_parents_deleted, tag_parents_pending, tag_parents_petitioned,
    tag_siblings_current, tag_siblings_deleted, tag_siblings_pending, tag_siblings_petitioned,
};

/// What service creation hands back to the caller; the admin access key is
/// shown exactly once and never stored raw.
#[derive(Debug)]
pub struct ProvisionedService {
    pub service_id: ServiceId,
    pub admin_account_key: AccountKey,
    pub admin_access_key: AccessKey,
}

impl Database {
    /// Create a service and provision its sentinel and admin accounts.
    pub fn create_service_tx(
        tx: &WriteTransactionCtx,
        key: ServiceKey,
        kind: ServiceKind,
        name: &str,
        port: u16,
        options: ServiceOptions,
        now: Timestamp,
    ) -> DbResult<ProvisionedService> {
        {
            let service_ids_table = tx.open_table(&service_ids::TABLE)?;
            if service_ids_table.get(&key)?.is_some() {
                return Err(ApiError::conflict("service key already registered").into());
            }
        }

        let service_id = {
            let mut master_counters_table = tx.open_table(&master_counters::TABLE)?;
            ServiceId::new(Self::next_master_id_tx(
                MasterCounterKind::Service,
                &mut master_counters_table,
            )?)
        };

        let null_account_type_id =
            Self::create_account_type_tx(tx, service_id, AccountType::null())?;
        let null_account_id = Self::create_account_tx(
            tx,
            service_id,
            AccountKey::generate(),
            null_account_type_id,
            now,
            None,
            // a random digest nobody holds the preimage of
            AccessKey::generate().digest(),
        )?;

        let admin_account_type_id =
            Self::create_account_type_tx(tx, service_id, AccountType::admin(kind))?;
        let admin_account_key = AccountKey::generate();
        let admin_access_key = AccessKey::generate();
        Self::create_account_tx(
            tx,
            service_id,
            admin_account_key,
            admin_account_type_id,
            now,
            None,
            admin_access_key.digest(),
        )?;

        let record = ServiceRecord {
            key,
            kind,
            name: name.to_owned(),
            port,
            options,
            null_account_id,
            null_account_type_id,
        };

        tx.open_table(&services::TABLE)?.insert(&service_id, &record)?;
        tx.open_table(&service_ids::TABLE)?.insert(&key, &service_id)?;
        tx.open_table(&repo_states::TABLE)?.insert(
            &service_id,
            &RepoStateRecord {
                next_update_due: now.saturating_add_secs(record.options.clamped_update_period()),
                next_nullification_update_index: 0,
            },
        )?;

        info!(
            target: LOG_TARGET,
            service_id = %service_id,
            kind = %kind,
            name = %name,
            "Created service"
        );

        Ok(ProvisionedService {
            service_id,
            admin_account_key,
            admin_access_key,
        })
    }

    pub fn get_service_tx(
        service_id: ServiceId,
        services_table: &impl services::ReadableTable,
    ) -> DbResult<Option<ServiceRecord>> {
        Ok(services_table.get(&service_id)?.map(|g| g.value()))
    }

    pub fn get_service_id_tx(
        key: ServiceKey,
        service_ids_table: &impl service_ids::ReadableTable,
    ) -> DbResult<Option<ServiceId>> {
        Ok(service_ids_table.get(&key)?.map(|g| g.value()))
    }

    pub fn list_services_tx(
        services_table: &impl services::ReadableTable,
    ) -> DbResult<Vec<(ServiceId, ServiceRecord)>> {
        services_table
            .range(..)?
            .map(|res| {
                res.map(|(k, v)| (k.value(), v.value()))
                    .map_err(Into::into)
            })
            .collect()
    }

    /// Replace a service record; used by the registry's dirty flush.
    pub fn persist_service_tx(
        service_id: ServiceId,
        record: &ServiceRecord,
        services_table: &mut services::Table,
    ) -> DbResult<()> {
        services_table.insert(&service_id, record)?;
        Ok(())
    }

    pub fn get_repo_state_tx(
        service_id: ServiceId,
        repo_states_table: &impl repo_states::ReadableTable,
    ) -> DbResult<Option<RepoStateRecord>> {
        Ok(repo_states_table.get(&service_id)?.map(|g| g.value()))
    }

    pub fn set_repo_state_tx(
        service_id: ServiceId,
        state: RepoStateRecord,
        repo_states_table: &mut repo_states::Table,
    ) -> DbResult<()> {
        repo_states_table.insert(&service_id, &state)?;
        Ok(())
    }

    /// Recompute every precomputed total for a service from the
    /// authoritative row tables. Exposed as a maintenance operation; also
    /// what the consistency tests compare against.
    pub fn regenerate_service_info_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
    ) -> DbResult<()> {
        macro_rules! count_range {
            ($table:expr, $lo:expr, $hi:expr) => {{
                let mut n = 0i64;
                for res in $table.range($lo..=$hi)? {
                    res?;
                    n += 1;
                }
                DbResult::Ok(n)
            }};
        }

        use hoard_core::{MasterHashId, MasterTagId, ServiceHashId, ServiceTagId};

        let sid = service_id;
        let mut totals: Vec<(ServiceInfoKind, i64)> = vec![];

        {
            let t = tx.open_table(&files_current::TABLE)?;
            totals.push((
                ServiceInfoKind::NumFiles,
                count_range!(t, (sid, ServiceHashId::ZERO), (sid, ServiceHashId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&files_deleted::TABLE)?;
            totals.push((
                ServiceInfoKind::NumDeletedFiles,
                count_range!(t, (sid, ServiceHashId::ZERO), (sid, ServiceHashId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&files_pending::TABLE)?;
            totals.push((
                ServiceInfoKind::NumPendingFiles,
                count_range!(t, (sid, MasterHashId::ZERO, AccountId::ZERO), (sid, MasterHashId::MAX, AccountId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&files_petitioned::TABLE)?;
            totals.push((
                ServiceInfoKind::NumPetitionedFiles,
                count_range!(t, (sid, ServiceHashId::ZERO, AccountId::ZERO), (sid, ServiceHashId::MAX, AccountId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&mappings_current::TABLE)?;
            totals.push((
                ServiceInfoKind::NumMappings,
                count_range!(t, (sid, ServiceTagId::ZERO, ServiceHashId::ZERO), (sid, ServiceTagId::MAX, ServiceHashId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&mappings_deleted::TABLE)?;
            totals.push((
                ServiceInfoKind::NumDeletedMappings,
                count_range!(t, (sid, ServiceTagId::ZERO, ServiceHashId::ZERO), (sid, ServiceTagId::MAX, ServiceHashId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&mappings_pending::TABLE)?;
            totals.push((
                ServiceInfoKind::NumPendingMappings,
                count_range!(t, (sid, MasterTagId::ZERO, MasterHashId::ZERO, AccountId::ZERO), (sid, MasterTagId::MAX, MasterHashId::MAX, AccountId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&mappings_petitioned::TABLE)?;
            totals.push((
                ServiceInfoKind::NumPetitionedMappings,
                count_range!(t, (sid, ServiceTagId::ZERO, ServiceHashId::ZERO, AccountId::ZERO), (sid, ServiceTagId::MAX, ServiceHashId::MAX, AccountId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&tag_parents_current::TABLE)?;
            totals.push((
                ServiceInfoKind::NumTagParents,
                count_range!(t, (sid, ServiceTagId::ZERO, ServiceTagId::ZERO), (sid, ServiceTagId::MAX, ServiceTagId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&tag_parents_deleted::TABLE)?;
            totals.push((
                ServiceInfoKind::NumDeletedTagParents,
                count_range!(t, (sid, ServiceTagId::ZERO, ServiceTagId::ZERO), (sid, ServiceTagId::MAX, ServiceTagId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&tag_parents_pending::TABLE)?;
            totals.push((
                ServiceInfoKind::NumPendingTagParents,
                count_range!(t, (sid, MasterTagId::ZERO, MasterTagId::ZERO, AccountId::ZERO), (sid, MasterTagId::MAX, MasterTagId::MAX, AccountId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&tag_parents_petitioned::TABLE)?;
            totals.push((
                ServiceInfoKind::NumPetitionedTagParents,
                count_range!(t, (sid, ServiceTagId::ZERO, ServiceTagId::ZERO, AccountId::ZERO), (sid, ServiceTagId::MAX, ServiceTagId::MAX, AccountId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&tag_siblings_current::TABLE)?;
            totals.push((
                ServiceInfoKind::NumTagSiblings,
                count_range!(t, (sid, ServiceTagId::ZERO), (sid, ServiceTagId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&tag_siblings_deleted::TABLE)?;
            totals.push((
                ServiceInfoKind::NumDeletedTagSiblings,
                count_range!(t, (sid, ServiceTagId::ZERO, ServiceTagId::ZERO), (sid, ServiceTagId::MAX, ServiceTagId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&tag_siblings_pending::TABLE)?;
            totals.push((
                ServiceInfoKind::NumPendingTagSiblings,
                count_range!(t, (sid, MasterTagId::ZERO, MasterTagId::ZERO, AccountId::ZERO), (sid, MasterTagId::MAX, MasterTagId::MAX, AccountId::MAX))?,
            ));
        }
        {
            let t = tx.open_table(&tag_siblings_petitioned::TABLE)?;
            totals.push((
                ServiceInfoKind::NumPetitionedTagSiblings,
                count_range!(t, (sid, ServiceTagId::ZERO, ServiceTagId::ZERO, AccountId::ZERO), (sid, ServiceTagId::MAX, ServiceTagId::MAX, AccountId::MAX))?,
            ));
        }

        // storage bytes: sum file sizes of current rows
        {
            let files_current_table = tx.open_table(&files_current::TABLE)?;
            let service_hashes_table = tx.open_table(&service_hashes::TABLE)?;
            let file_infos_table = tx.open_table(&crate::file_infos::TABLE)?;
            let mut bytes = 0i64;
            for res in files_current_table
                .range((sid, ServiceHashId::ZERO)..=(sid, ServiceHashId::MAX))?
            {
                let (k, _) = res?;
                let (_, hash_id) = k.value();
                if let Some(master_hash_id) = service_hashes_table
                    .get(&(sid, hash_id))?
                    .map(|g| g.value())
                {
                    if let Some(info) =
                        file_infos_table.get(&master_hash_id)?.map(|g| g.value())
                    {
                        bytes += info.size as i64;
                    }
                }
            }
            totals.push((ServiceInfoKind::FileStorageBytes, bytes));
        }

        let mut service_info_table = tx.open_table(&service_info::TABLE)?;
        for (kind, value) in totals {
            service_info_table.insert(&(sid, kind), &value)?;
        }

        Ok(())
    }

    /// All maintained totals of one service, for `service_info` reads.
    pub fn get_all_service_info_tx(
        service_id: ServiceId,
        service_info_table: &impl service_info::ReadableTable,
    ) -> DbResult<Vec<(ServiceInfoKind, i64)>> {
        service_info_table
            .range(
                (service_id, ServiceInfoKind::NumFiles)
                    ..=(service_id, ServiceInfoKind::FileStorageBytes),
            )?
            .map(|res| {
                res.map(|(k, v)| (k.value().1, v.value()))
                    .map_err(Into::into)
            })
            .collect()
    }

    /// Current + pending storage use, for the max-storage admission check.
    pub fn current_file_storage_tx(
        service_id: ServiceId,
        service_info_table: &impl service_info::ReadableTable,
    ) -> DbResult<u64> {
        Ok(
            Self::get_service_info_tx(service_id, ServiceInfoKind::FileStorageBytes, service_info_table)?
                .max(0) as u64,
        )
    }

    pub fn content_kinds_of(kind: ServiceKind) -> &'static [ContentKind] {
        match kind {
            ServiceKind::Admin => &[],
            ServiceKind::FileRepo => &[ContentKind::Files],
            ServiceKind::TagRepo => &[
                ContentKind::Mappings,
                ContentKind::TagParents,
                ContentKind::TagSiblings,
            ],
        }
    }
}
