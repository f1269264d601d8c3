//! Accounts, account types, registration keys and per-account bookkeeping.

use std::collections::BTreeMap;

use hoard_core::account::{AccountType, AccountView, BanInfo};
use hoard_core::bandwidth::BandwidthTracker;
use hoard_core::content::ContentKind;
use hoard_core::error::ApiError;
use hoard_core::id::{AccessKey, AccessKeyDigest, AccountKey, RegistrationKey};
use hoard_core::{AccountId, AccountTypeId, ServiceId, Timestamp};
use tracing::info;

use crate::{
    AccountRecord, AccountTypeRecord, Database, DbResult, LOG_TARGET, RegistrationRecord,
    ServiceCounterKind, WriteTransactionCtx, account_bandwidth, account_ids,
    account_ids_by_access, account_types, accounts, files_current, files_deleted, files_pending,
    files_petitioned, mappings_current, mappings_deleted, mappings_pending, mappings_petitioned,
    registration_access_index, registration_keys, service_counters, services, tag_parents_current,
    tag_parents_deleted, tag_parents_pending, tag_parents_petitioned, tag_siblings_current,
    tag_siblings_deleted, tag_siblings_pending, tag_siblings_petitioned,
};

/// One freshly issued registration. The raw keys exist here and in the
/// client's hands only.
#[derive(Debug, Clone)]
pub struct IssuedRegistration {
    pub registration_key: RegistrationKey,
    pub access_key: AccessKey,
}

/// Row counts of one account's footprint across the four states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentCounts {
    pub current: u64,
    pub deleted: u64,
    pub pending: u64,
    pub petitioned: u64,
}

/// The moderator-facing account report.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub account: AccountView,
    pub content: BTreeMap<ContentKind, ContentCounts>,
    pub petition_score: i64,
}

/// The result of one `delete_all_content` slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteAllContentOutcome {
    pub rows_affected: u64,
    pub fully_done: bool,
}

impl Database {
    // ========================================================================
    // Account types
    // ========================================================================

    pub fn create_account_type_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_type: AccountType,
    ) -> DbResult<AccountTypeId> {
        let account_type_id = {
            let mut service_counters_table = tx.open_table(&service_counters::TABLE)?;
            AccountTypeId::new(Self::next_service_id_tx(
                service_id,
                ServiceCounterKind::AccountType,
                &mut service_counters_table,
            )?)
        };
        tx.open_table(&account_types::TABLE)?.insert(
            &(service_id, account_type_id),
            &AccountTypeRecord {
                account_type,
                auto_create_history: BandwidthTracker::new(),
            },
        )?;
        Ok(account_type_id)
    }

    pub fn get_account_type_tx(
        service_id: ServiceId,
        account_type_id: AccountTypeId,
        account_types_table: &impl account_types::ReadableTable,
    ) -> DbResult<Option<AccountTypeRecord>> {
        Ok(account_types_table
            .get(&(service_id, account_type_id))?
            .map(|g| g.value()))
    }

    pub fn list_account_types_tx(
        service_id: ServiceId,
        account_types_table: &impl account_types::ReadableTable,
    ) -> DbResult<Vec<(AccountTypeId, AccountTypeRecord)>> {
        account_types_table
            .range((service_id, AccountTypeId::ZERO)..=(service_id, AccountTypeId::MAX))?
            .map(|res| {
                res.map(|(k, v)| (k.value().1, v.value()))
                    .map_err(Into::into)
            })
            .collect()
    }

    /// Replace an account type's definition. The null type is immutable.
    pub fn update_account_type_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_type_id: AccountTypeId,
        account_type: AccountType,
    ) -> DbResult<()> {
        let mut account_types_table = tx.open_table(&account_types::TABLE)?;
        let Some(existing) = account_types_table
            .get(&(service_id, account_type_id))?
            .map(|g| g.value())
        else {
            return Err(ApiError::not_found("unknown account type").into());
        };
        if existing.account_type.is_null || account_type.is_null {
            return Err(ApiError::bad_request("the null account type cannot be modified").into());
        }
        account_types_table.insert(
            &(service_id, account_type_id),
            &AccountTypeRecord {
                account_type,
                auto_create_history: existing.auto_create_history,
            },
        )?;
        Ok(())
    }

    /// Record one auto-created account against the type's velocity history.
    pub fn report_auto_create_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_type_id: AccountTypeId,
        now: Timestamp,
    ) -> DbResult<()> {
        let mut account_types_table = tx.open_table(&account_types::TABLE)?;
        let Some(mut record) = account_types_table
            .get(&(service_id, account_type_id))?
            .map(|g| g.value())
        else {
            return Err(ApiError::not_found("unknown account type").into());
        };
        record.auto_create_history.report_request(now, 0);
        account_types_table.insert(&(service_id, account_type_id), &record)?;
        Ok(())
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub fn create_account_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_key: AccountKey,
        account_type_id: AccountTypeId,
        created_at: Timestamp,
        expires_at: Option<Timestamp>,
        access_key_digest: AccessKeyDigest,
    ) -> DbResult<AccountId> {
        let account_id = {
            let mut service_counters_table = tx.open_table(&service_counters::TABLE)?;
            AccountId::new(Self::next_service_id_tx(
                service_id,
                ServiceCounterKind::Account,
                &mut service_counters_table,
            )?)
        };

        tx.open_table(&accounts::TABLE)?.insert(
            &(service_id, account_id),
            &AccountRecord {
                key: account_key,
                account_type_id,
                created_at,
                expires_at,
                access_key_digest,
                ban: None,
                message: None,
                petition_score: 0,
            },
        )?;
        tx.open_table(&account_ids::TABLE)?
            .insert(&(service_id, account_key), &account_id)?;
        tx.open_table(&account_ids_by_access::TABLE)?
            .insert(&(service_id, access_key_digest), &account_id)?;

        Ok(account_id)
    }

    pub fn get_account_id_tx(
        service_id: ServiceId,
        account_key: AccountKey,
        account_ids_table: &impl account_ids::ReadableTable,
    ) -> DbResult<Option<AccountId>> {
        Ok(account_ids_table
            .get(&(service_id, account_key))?
            .map(|g| g.value()))
    }

    pub fn get_account_tx(
        service_id: ServiceId,
        account_id: AccountId,
        accounts_table: &impl accounts::ReadableTable,
    ) -> DbResult<Option<AccountRecord>> {
        Ok(accounts_table
            .get(&(service_id, account_id))?
            .map(|g| g.value()))
    }

    /// Assemble the external view: record + type + bandwidth summary.
    pub fn account_view_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        now: Timestamp,
    ) -> DbResult<AccountView> {
        let record = {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Self::get_account_tx(service_id, account_id, &accounts_table)?
                .ok_or_else(|| ApiError::not_found("unknown account"))?
        };
        let account_type = {
            let account_types_table = tx.open_table(&account_types::TABLE)?;
            Self::get_account_type_tx(service_id, record.account_type_id, &account_types_table)?
                .ok_or_else(|| ApiError::internal("account references unknown type"))?
                .account_type
        };
        let bandwidth = {
            let account_bandwidth_table = tx.open_table(&account_bandwidth::TABLE)?;
            account_bandwidth_table
                .get(&(service_id, account_id))?
                .map(|g| g.value())
                .unwrap_or_default()
                .current_month_summary(now)
        };

        Ok(AccountView {
            key: record.key,
            account_type,
            created_at: record.created_at,
            expires_at: record.expires_at,
            ban: record.ban,
            message: record.message,
            bandwidth,
        })
    }

    // ========================================================================
    // Registration keys
    // ========================================================================

    /// Generate `count` registrations for an account type.
    ///
    /// Only the key digests and the (transient) access keys are persisted;
    /// the raw registration keys live in the returned value alone.
    pub fn issue_registration_keys_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_type_id: AccountTypeId,
        count: usize,
        expires_at: Option<Timestamp>,
    ) -> DbResult<Vec<IssuedRegistration>> {
        {
            let account_types_table = tx.open_table(&account_types::TABLE)?;
            let Some(record) =
                Self::get_account_type_tx(service_id, account_type_id, &account_types_table)?
            else {
                return Err(ApiError::not_found("unknown account type").into());
            };
            if record.account_type.is_null {
                return Err(
                    ApiError::bad_request("cannot register against the null account type").into(),
                );
            }
        }

        let mut issued = Vec::with_capacity(count);
        let mut registration_keys_table = tx.open_table(&registration_keys::TABLE)?;
        let mut registration_access_table = tx.open_table(&registration_access_index::TABLE)?;
        for _ in 0..count {
            let registration_key = RegistrationKey::generate();
            let access_key = AccessKey::generate();
            let account_key = AccountKey::generate();

            registration_keys_table.insert(
                &(service_id, registration_key.digest()),
                &RegistrationRecord {
                    account_type_id,
                    account_key,
                    access_key,
                    expires_at,
                },
            )?;
            registration_access_table.insert(
                &(service_id, access_key.digest()),
                &registration_key.digest(),
            )?;

            issued.push(IssuedRegistration {
                registration_key,
                access_key,
            });
        }

        info!(
            target: LOG_TARGET,
            %service_id,
            count,
            "Issued registration keys"
        );

        Ok(issued)
    }

    /// Redeem a registration key for its access key, rotating the access key
    /// so an eavesdropped registration key cannot race the rightful owner.
    pub fn fetch_access_key_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        registration_key: RegistrationKey,
        now: Timestamp,
    ) -> DbResult<AccessKey> {
        let digest = registration_key.digest();
        let mut registration_keys_table = tx.open_table(&registration_keys::TABLE)?;
        let Some(mut record) = registration_keys_table
            .get(&(service_id, digest))?
            .map(|g| g.value())
        else {
            return Err(ApiError::unauthorized("unknown registration key").into());
        };
        if record.expires_at.is_some_and(|at| at.has_passed(now)) {
            return Err(ApiError::unauthorized("registration key has expired").into());
        }

        let mut registration_access_table = tx.open_table(&registration_access_index::TABLE)?;
        registration_access_table.remove(&(service_id, record.access_key.digest()))?;

        record.access_key = AccessKey::generate();
        registration_keys_table.insert(&(service_id, digest), &record)?;
        registration_access_table.insert(&(service_id, record.access_key.digest()), &digest)?;

        Ok(record.access_key)
    }

    /// Resolve an access key to its account key.
    ///
    /// The first successful resolve of a registered-but-unmaterialized key
    /// creates the account row and burns the registration row, discarding
    /// every older access key issued for it.
    pub fn resolve_access_key_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        access_key: AccessKey,
        now: Timestamp,
    ) -> DbResult<AccountKey> {
        let digest = access_key.digest();

        let registered = {
            let registration_access_table = tx.open_table(&registration_access_index::TABLE)?;
            registration_access_table
                .get(&(service_id, digest))?
                .map(|g| g.value())
        };
        if let Some(registration_digest) = registered {
            let record = {
                let mut registration_keys_table = tx.open_table(&registration_keys::TABLE)?;
                let record = registration_keys_table
                    .get(&(service_id, registration_digest))?
                    .map(|g| g.value())
                    .ok_or_else(|| ApiError::unauthorized("unknown access key"))?;
                registration_keys_table.remove(&(service_id, registration_digest))?;
                record
            };
            tx.open_table(&registration_access_index::TABLE)?
                .remove(&(service_id, digest))?;

            if record.expires_at.is_some_and(|at| at.has_passed(now)) {
                return Err(ApiError::unauthorized("registration key has expired").into());
            }

            Self::create_account_tx(
                tx,
                service_id,
                record.account_key,
                record.account_type_id,
                now,
                None,
                digest,
            )?;

            info!(
                target: LOG_TARGET,
                %service_id,
                account_key = %record.account_key,
                "Materialized account from registration"
            );

            return Ok(record.account_key);
        }

        let accounts_hit = {
            let account_ids_by_access_table = tx.open_table(&account_ids_by_access::TABLE)?;
            account_ids_by_access_table
                .get(&(service_id, digest))?
                .map(|g| g.value())
        };
        match accounts_hit {
            Some(account_id) => {
                let accounts_table = tx.open_table(&accounts::TABLE)?;
                let record = Self::get_account_tx(service_id, account_id, &accounts_table)?
                    .ok_or_else(|| ApiError::internal("dangling access index entry"))?;
                Ok(record.key)
            }
            None => Err(ApiError::unauthorized("unknown access key").into()),
        }
    }

    // ========================================================================
    // Moderation
    // ========================================================================

    fn modifiable_account_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_key: AccountKey,
    ) -> DbResult<(AccountId, AccountRecord)> {
        let account_id = {
            let account_ids_table = tx.open_table(&account_ids::TABLE)?;
            Self::get_account_id_tx(service_id, account_key, &account_ids_table)?
                .ok_or_else(|| ApiError::not_found("unknown account"))?
        };
        {
            let services_table = tx.open_table(&services::TABLE)?;
            let service = Self::get_service_tx(service_id, &services_table)?
                .ok_or_else(|| ApiError::not_found("unknown service"))?;
            if service.null_account_id == account_id {
                return Err(ApiError::bad_request("the null account cannot be modified").into());
            }
        }
        let accounts_table = tx.open_table(&accounts::TABLE)?;
        let record = Self::get_account_tx(service_id, account_id, &accounts_table)?
            .ok_or_else(|| ApiError::not_found("unknown account"))?;
        Ok((account_id, record))
    }

    fn store_account_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        record: &AccountRecord,
    ) -> DbResult<()> {
        tx.open_table(&accounts::TABLE)?
            .insert(&(service_id, account_id), record)?;
        Ok(())
    }

    pub fn set_account_type_of_account_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_key: AccountKey,
        account_type_id: AccountTypeId,
    ) -> DbResult<()> {
        let (account_id, mut record) = Self::modifiable_account_tx(tx, service_id, account_key)?;
        {
            let account_types_table = tx.open_table(&account_types::TABLE)?;
            let target =
                Self::get_account_type_tx(service_id, account_type_id, &account_types_table)?
                    .ok_or_else(|| ApiError::not_found("unknown account type"))?;
            if target.account_type.is_null {
                return Err(
                    ApiError::bad_request("accounts cannot be moved to the null type").into(),
                );
            }
        }
        record.account_type_id = account_type_id;
        Self::store_account_tx(tx, service_id, account_id, &record)
    }

    pub fn ban_account_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_key: AccountKey,
        reason: &str,
        banned_until: Option<Timestamp>,
        now: Timestamp,
    ) -> DbResult<()> {
        let (account_id, mut record) = Self::modifiable_account_tx(tx, service_id, account_key)?;
        record.ban = Some(BanInfo {
            reason: reason.to_owned(),
            banned_at: now,
            banned_until,
        });
        Self::store_account_tx(tx, service_id, account_id, &record)
    }

    pub fn unban_account_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_key: AccountKey,
    ) -> DbResult<()> {
        let (account_id, mut record) = Self::modifiable_account_tx(tx, service_id, account_key)?;
        record.ban = None;
        Self::store_account_tx(tx, service_id, account_id, &record)
    }

    pub fn set_account_expires_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_key: AccountKey,
        expires_at: Option<Timestamp>,
    ) -> DbResult<()> {
        let (account_id, mut record) = Self::modifiable_account_tx(tx, service_id, account_key)?;
        record.expires_at = expires_at;
        Self::store_account_tx(tx, service_id, account_id, &record)
    }

    pub fn set_account_message_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_key: AccountKey,
        message: &str,
        now: Timestamp,
    ) -> DbResult<()> {
        let (account_id, mut record) = Self::modifiable_account_tx(tx, service_id, account_key)?;
        record.message = if message.is_empty() {
            None
        } else {
            Some((message.to_owned(), now))
        };
        Self::store_account_tx(tx, service_id, account_id, &record)
    }

    // ========================================================================
    // Bandwidth
    // ========================================================================

    pub fn report_account_bandwidth_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_id: AccountId,
        bytes: u64,
        now: Timestamp,
    ) -> DbResult<()> {
        let mut account_bandwidth_table = tx.open_table(&account_bandwidth::TABLE)?;
        let mut tracker = account_bandwidth_table
            .get(&(service_id, account_id))?
            .map(|g| g.value())
            .unwrap_or_default();
        tracker.report_request(now, bytes);
        account_bandwidth_table.insert(&(service_id, account_id), &tracker)?;
        Ok(())
    }

    pub fn get_account_bandwidth_tx(
        service_id: ServiceId,
        account_id: AccountId,
        account_bandwidth_table: &impl account_bandwidth::ReadableTable,
    ) -> DbResult<BandwidthTracker> {
        Ok(account_bandwidth_table
            .get(&(service_id, account_id))?
            .map(|g| g.value())
            .unwrap_or_default())
    }

    // ========================================================================
    // Account info & delete-all
    // ========================================================================

    /// How many rows of each kind/state an account authored; a moderator
    /// inspection tool, so full scans are acceptable here.
    pub fn get_account_info_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        account_key: AccountKey,
        now: Timestamp,
    ) -> DbResult<AccountInfo> {
        let account_id = {
            let account_ids_table = tx.open_table(&account_ids::TABLE)?;
            Self::get_account_id_tx(service_id, account_key, &account_ids_table)?
                .ok_or_else(|| ApiError::not_found("unknown account"))?
        };
        let account = Self::account_view_tx(tx, service_id, account_id, now)?;
        let petition_score = {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Self::get_account_tx(service_id, account_id, &accounts_table)?
                .map(|r| r.petition_score)
                .unwrap_or(0)
        };

        let mut content = BTreeMap::new();
        for kind in ContentKind::ALL {
            content.insert(kind, ContentCounts::default());
        }

        macro_rules! count_committed {
            ($table:ident, $kind:expr, $field:ident, $lo:expr, $hi:expr) => {{
                let table = tx.open_table(&$table::TABLE)?;
                let mut n = 0u64;
                for res in table.range($lo..=$hi)? {
                    let (_, v) = res?;
                    if v.value().account_id == account_id {
                        n += 1;
                    }
                }
                content.get_mut(&$kind).expect("Kind pre-seeded").$field = n;
            }};
        }
        macro_rules! count_queued {
            ($table:ident, $kind:expr, $field:ident, $lo:expr, $hi:expr, $acct:expr) => {{
                let table = tx.open_table(&$table::TABLE)?;
                let mut n = 0u64;
                for res in table.range($lo..=$hi)? {
                    let (k, _) = res?;
                    if $acct(k.value()) == account_id {
                        n += 1;
                    }
                }
                content.get_mut(&$kind).expect("Kind pre-seeded").$field = n;
            }};
        }

        use hoard_core::{MasterHashId, MasterTagId, ServiceHashId, ServiceTagId};
        let sid = service_id;

        count_committed!(
            files_current,
            ContentKind::Files,
            current,
            (sid, ServiceHashId::ZERO),
            (sid, ServiceHashId::MAX)
        );
        count_committed!(
            files_deleted,
            ContentKind::Files,
            deleted,
            (sid, ServiceHashId::ZERO),
            (sid, ServiceHashId::MAX)
        );
        count_queued!(
            files_pending,
            ContentKind::Files,
            pending,
            (sid, MasterHashId::ZERO, AccountId::ZERO),
            (sid, MasterHashId::MAX, AccountId::MAX),
            |k: (ServiceId, MasterHashId, AccountId)| k.2
        );
        count_queued!(
            files_petitioned,
            ContentKind::Files,
            petitioned,
            (sid, ServiceHashId::ZERO, AccountId::ZERO),
            (sid, ServiceHashId::MAX, AccountId::MAX),
            |k: (ServiceId, ServiceHashId, AccountId)| k.2
        );

        count_committed!(
            mappings_current,
            ContentKind::Mappings,
            current,
            (sid, ServiceTagId::ZERO, ServiceHashId::ZERO),
            (sid, ServiceTagId::MAX, ServiceHashId::MAX)
        );
        count_committed!(
            mappings_deleted,
            ContentKind::Mappings,
            deleted,
            (sid, ServiceTagId::ZERO, ServiceHashId::ZERO),
            (sid, ServiceTagId::MAX, ServiceHashId::MAX)
        );
        count_queued!(
            mappings_pending,
            ContentKind::Mappings,
            pending,
            (sid, MasterTagId::ZERO, MasterHashId::ZERO, AccountId::ZERO),
            (sid, MasterTagId::MAX, MasterHashId::MAX, AccountId::MAX),
            |k: (ServiceId, MasterTagId, MasterHashId, AccountId)| k.3
        );
        count_queued!(
            mappings_petitioned,
            ContentKind::Mappings,
            petitioned,
            (sid, ServiceTagId::ZERO, ServiceHashId::ZERO, AccountId::ZERO),
            (sid, ServiceTagId::MAX, ServiceHashId::MAX, AccountId::MAX),
            |k: (ServiceId, ServiceTagId, ServiceHashId, AccountId)| k.3
        );

        count_committed!(
            tag_parents_current,
            ContentKind::TagParents,
            current,
            (sid, ServiceTagId::ZERO, ServiceTagId::ZERO),
            (sid, ServiceTagId::MAX, ServiceTagId::MAX)
        );
        count_committed!(
            tag_parents_deleted,
            ContentKind::TagParents,
            deleted,
            (sid, ServiceTagId::ZERO, ServiceTagId::ZERO),
            (sid, ServiceTagId::MAX, ServiceTagId::MAX)
        );
        count_queued!(
            tag_parents_pending,
            ContentKind::TagParents,
            pending,
            (sid, MasterTagId::ZERO, MasterTagId::ZERO, AccountId::ZERO),
            (sid, MasterTagId::MAX, MasterTagId::MAX, AccountId::MAX),
            |k: (ServiceId, MasterTagId, MasterTagId, AccountId)| k.3
        );
        count_queued!(
            tag_parents_petitioned,
            ContentKind::TagParents,
            petitioned,
            (sid, ServiceTagId::ZERO, ServiceTagId::ZERO, AccountId::ZERO),
            (sid, ServiceTagId::MAX, ServiceTagId::MAX, AccountId::MAX),
            |k: (ServiceId, ServiceTagId, ServiceTagId, AccountId)| k.3
        );

        {
            let table = tx.open_table(&tag_siblings_current::TABLE)?;
            let mut n = 0u64;
            for res in table.range((sid, ServiceTagId::ZERO)..=(sid, ServiceTagId::MAX))? {
                let (_, v) = res?;
                if v.value().account_id == account_id {
                    n += 1;
                }
            }
            content
                .get_mut(&ContentKind::TagSiblings)
                .expect("Kind pre-seeded")
                .current = n;
        }
        count_committed!(
            tag_siblings_deleted,
            ContentKind::TagSiblings,
            deleted,
            (sid, ServiceTagId::ZERO, ServiceTagId::ZERO),
            (sid, ServiceTagId::MAX, ServiceTagId::MAX)
        );
        count_queued!(
            tag_siblings_pending,
            ContentKind::TagSiblings,
            pending,
            (sid, MasterTagId::ZERO, MasterTagId::ZERO, AccountId::ZERO),
            (sid, MasterTagId::MAX, MasterTagId::MAX, AccountId::MAX),
            |k: (ServiceId, MasterTagId, MasterTagId, AccountId)| k.3
        );
        count_queued!(
            tag_siblings_petitioned,
            ContentKind::TagSiblings,
            petitioned,
            (sid, ServiceTagId::ZERO, ServiceTagId::ZERO, AccountId::ZERO),
            (sid, ServiceTagId::MAX, ServiceTagId::MAX, AccountId::MAX),
            |k: (ServiceId, ServiceTagId, ServiceTagId, AccountId)| k.3
        );

        Ok(AccountInfo {
            account,
            content,
            petition_score,
        })
    }

    /// Delete one slice (≤ `max_rows` current rows) of an account's content
    /// through the normal delete path, and sweep its pending/petitioned
    /// rows. The caller loops on `fully_done == false` within its time
    /// budget.
    pub fn delete_account_content_slice_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        actor_account_id: AccountId,
        subject_account_id: AccountId,
        max_rows: usize,
        now: Timestamp,
    ) -> DbResult<DeleteAllContentOutcome> {
        use hoard_core::{ServiceHashId, ServiceTagId};
        let sid = service_id;
        let mut budget = max_rows;
        let mut rows_affected = 0u64;

        // files
        if 0 < budget {
            let targets: Vec<ServiceHashId> = {
                let table = tx.open_table(&files_current::TABLE)?;
                let mut targets = vec![];
                for res in table.range((sid, ServiceHashId::ZERO)..=(sid, ServiceHashId::MAX))? {
                    let (k, v) = res?;
                    if v.value().account_id == subject_account_id {
                        targets.push(k.value().1);
                        if budget <= targets.len() {
                            break;
                        }
                    }
                }
                targets
            };
            for hash_id in targets {
                if Self::delete_file_row_tx(tx, sid, actor_account_id, hash_id, now)? {
                    rows_affected += 1;
                    budget -= 1;
                }
            }
        }

        // mappings
        if 0 < budget {
            let targets: Vec<(ServiceTagId, ServiceHashId)> = {
                let table = tx.open_table(&mappings_current::TABLE)?;
                let mut targets = vec![];
                for res in table.range(
                    (sid, ServiceTagId::ZERO, ServiceHashId::ZERO)
                        ..=(sid, ServiceTagId::MAX, ServiceHashId::MAX),
                )? {
                    let (k, v) = res?;
                    if v.value().account_id == subject_account_id {
                        let key = k.value();
                        targets.push((key.1, key.2));
                        if budget <= targets.len() {
                            break;
                        }
                    }
                }
                targets
            };
            for (tag_id, hash_id) in targets {
                let (tag, hash) = {
                    let service_tags_table = tx.open_table(&crate::service_tags::TABLE)?;
                    let master_tags_table = tx.open_table(&crate::master_tags::TABLE)?;
                    let service_hashes_table = tx.open_table(&crate::service_hashes::TABLE)?;
                    let master_hashes_table = tx.open_table(&crate::master_hashes::TABLE)?;
                    (
                        Self::resolve_service_tag_tx(
                            sid,
                            tag_id,
                            &service_tags_table,
                            &master_tags_table,
                        )?,
                        Self::resolve_service_hash_tx(
                            sid,
                            hash_id,
                            &service_hashes_table,
                            &master_hashes_table,
                        )?,
                    )
                };
                if let (Some(tag), Some(hash)) = (tag, hash) {
                    let n = Self::delete_mappings_tx(tx, sid, actor_account_id, &tag, &[hash], now)?;
                    rows_affected += n;
                    budget = budget.saturating_sub(n as usize);
                }
            }
        }

        // tag parents
        if 0 < budget {
            let targets: Vec<(ServiceTagId, ServiceTagId)> = {
                let table = tx.open_table(&tag_parents_current::TABLE)?;
                let mut targets = vec![];
                for res in table.range(
                    (sid, ServiceTagId::ZERO, ServiceTagId::ZERO)
                        ..=(sid, ServiceTagId::MAX, ServiceTagId::MAX),
                )? {
                    let (k, v) = res?;
                    if v.value().account_id == subject_account_id {
                        let key = k.value();
                        targets.push((key.1, key.2));
                        if budget <= targets.len() {
                            break;
                        }
                    }
                }
                targets
            };
            for (child_id, parent_id) in targets {
                let (child, parent) = {
                    let service_tags_table = tx.open_table(&crate::service_tags::TABLE)?;
                    let master_tags_table = tx.open_table(&crate::master_tags::TABLE)?;
                    (
                        Self::resolve_service_tag_tx(
                            sid,
                            child_id,
                            &service_tags_table,
                            &master_tags_table,
                        )?,
                        Self::resolve_service_tag_tx(
                            sid,
                            parent_id,
                            &service_tags_table,
                            &master_tags_table,
                        )?,
                    )
                };
                if let (Some(child), Some(parent)) = (child, parent) {
                    if Self::delete_tag_parent_tx(tx, sid, actor_account_id, &child, &parent, now)? {
                        rows_affected += 1;
                        budget -= 1;
                    }
                }
            }
        }

        // tag siblings
        if 0 < budget {
            let targets: Vec<ServiceTagId> = {
                let table = tx.open_table(&tag_siblings_current::TABLE)?;
                let mut targets = vec![];
                for res in table.range((sid, ServiceTagId::ZERO)..=(sid, ServiceTagId::MAX))? {
                    let (k, v) = res?;
                    if v.value().account_id == subject_account_id {
                        targets.push(k.value().1);
                        if budget <= targets.len() {
                            break;
                        }
                    }
                }
                targets
            };
            for bad_id in targets {
                let bad = {
                    let service_tags_table = tx.open_table(&crate::service_tags::TABLE)?;
                    let master_tags_table = tx.open_table(&crate::master_tags::TABLE)?;
                    Self::resolve_service_tag_tx(
                        sid,
                        bad_id,
                        &service_tags_table,
                        &master_tags_table,
                    )?
                };
                if let Some(bad) = bad {
                    if Self::delete_tag_sibling_tx(tx, sid, actor_account_id, &bad, now)? {
                        rows_affected += 1;
                        budget -= 1;
                    }
                }
            }
        }

        // sweep the subject's own petition queues via the deny path
        if 0 < budget {
            let entries: Vec<(ContentKind, hoard_core::update::PetitionStatus, hoard_core::ReasonId)> = {
                let table = tx.open_table(&crate::petition_index::TABLE)?;
                let mut entries = vec![];
                for kind in ContentKind::ALL {
                    for status in [
                        hoard_core::update::PetitionStatus::Pending,
                        hoard_core::update::PetitionStatus::Petitioned,
                    ] {
                        for res in table.range(
                            (sid, kind, status, subject_account_id, hoard_core::ReasonId::ZERO)
                                ..=(sid, kind, status, subject_account_id, hoard_core::ReasonId::MAX),
                        )? {
                            let (k, _) = res?;
                            entries.push((kind, status, k.value().4));
                        }
                    }
                }
                entries
            };
            for (kind, status, reason_id) in entries {
                use hoard_core::update::PetitionStatus;
                let n = match (kind, status) {
                    (ContentKind::Files, PetitionStatus::Pending) => {
                        Self::deny_file_pends_tx(tx, sid, subject_account_id, reason_id)?
                    }
                    (ContentKind::Files, PetitionStatus::Petitioned) => {
                        Self::deny_file_petitions_tx(tx, sid, subject_account_id, reason_id)?
                    }
                    (ContentKind::Mappings, PetitionStatus::Pending) => {
                        Self::deny_mapping_pends_tx(tx, sid, subject_account_id, reason_id)?
                    }
                    (ContentKind::Mappings, PetitionStatus::Petitioned) => {
                        Self::deny_mapping_petitions_tx(tx, sid, subject_account_id, reason_id)?
                    }
                    (ContentKind::TagParents, PetitionStatus::Pending) => {
                        Self::deny_tag_parent_pends_tx(tx, sid, subject_account_id, reason_id)?
                    }
                    (ContentKind::TagParents, PetitionStatus::Petitioned) => {
                        Self::deny_tag_parent_petitions_tx(tx, sid, subject_account_id, reason_id)?
                    }
                    (ContentKind::TagSiblings, PetitionStatus::Pending) => {
                        Self::deny_tag_sibling_pends_tx(tx, sid, subject_account_id, reason_id)?
                    }
                    (ContentKind::TagSiblings, PetitionStatus::Petitioned) => {
                        Self::deny_tag_sibling_petitions_tx(tx, sid, subject_account_id, reason_id)?
                    }
                };
                rows_affected += n;
            }
        }

        // anything left?
        let fully_done = {
            let info = Self::get_account_info_tx(
                tx,
                sid,
                {
                    let accounts_table = tx.open_table(&accounts::TABLE)?;
                    Self::get_account_tx(sid, subject_account_id, &accounts_table)?
                        .ok_or_else(|| ApiError::not_found("unknown account"))?
                        .key
                },
                now,
            )?;
            info.content
                .values()
                .all(|c| c.current == 0 && c.pending == 0 && c.petitioned == 0)
        };

        Ok(DeleteAllContentOutcome {
            rows_affected,
            fully_done,
        })
    }
}
