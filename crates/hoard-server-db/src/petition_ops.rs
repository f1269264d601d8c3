//! Petition queries: actionable counts, summaries, and full materialization.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use hoard_core::content::{ClientAction, ClientContent, ContentKind};
use hoard_core::error::ApiError;
use hoard_core::id::AccountKey;
use hoard_core::tag::Tag;
use hoard_core::update::{Petition, PetitionHeader, PetitionStatus};
use hoard_core::{AccountId, ReasonId, ServiceId, Timestamp};
use itertools::Itertools as _;
use rand::seq::SliceRandom as _;

use crate::{
    Database, DbResult, WriteTransactionCtx, account_ids, files_pending, files_petitioned,
    mappings_pending, mappings_petitioned, master_hashes, master_tags, petition_index, reason_ids,
    reasons, service_hashes, service_tags, tag_parents_pending, tag_parents_petitioned,
    tag_siblings_pending, tag_siblings_petitioned,
};

/// Mapping petitions are capped to keep materialization bounded; the rest of
/// the petition stays queued and resurfaces after resolution.
pub const MAX_PETITION_MAPPING_ROWS: usize = 500_000;
pub const MAX_PETITION_TAG_IDS: usize = 10_000;
pub const MAX_PETITION_WALL_CLOCK_SECS: u64 = 10;

/// Actionable petition counts per (kind, status).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PetitionCounts {
    pub counts: BTreeMap<(ContentKind, PetitionStatus), u64>,
}

impl PetitionCounts {
    pub fn get(&self, kind: ContentKind, status: PetitionStatus) -> u64 {
        self.counts.get(&(kind, status)).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl Database {
    /// A pending petition on a pair kind is superseded by a petitioned
    /// petition of the same (account, reason): resolving the removal first
    /// may invalidate the addition, so only the removal is actionable.
    fn pending_is_superseded_tx(
        service_id: ServiceId,
        kind: ContentKind,
        account_id: AccountId,
        reason_id: ReasonId,
        petition_index_table: &impl petition_index::ReadableTable,
    ) -> DbResult<bool> {
        if !matches!(kind, ContentKind::TagParents | ContentKind::TagSiblings) {
            return Ok(false);
        }
        Ok(petition_index_table
            .get(&(
                service_id,
                kind,
                PetitionStatus::Petitioned,
                account_id,
                reason_id,
            ))?
            .is_some())
    }

    /// Count actionable (account, reason) petitions per kind and status.
    pub fn get_petition_counts_tx(
        service_id: ServiceId,
        petition_index_table: &impl petition_index::ReadableTable,
    ) -> DbResult<PetitionCounts> {
        let mut counts = PetitionCounts::default();
        for kind in ContentKind::ALL {
            for status in [PetitionStatus::Pending, PetitionStatus::Petitioned] {
                let mut n = 0u64;
                for res in petition_index_table.range(
                    (service_id, kind, status, AccountId::ZERO, ReasonId::ZERO)
                        ..=(service_id, kind, status, AccountId::MAX, ReasonId::MAX),
                )? {
                    let (k, _) = res?;
                    let (_, _, _, account_id, reason_id) = k.value();
                    if status == PetitionStatus::Pending
                        && Self::pending_is_superseded_tx(
                            service_id,
                            kind,
                            account_id,
                            reason_id,
                            petition_index_table,
                        )?
                    {
                        continue;
                    }
                    n += 1;
                }
                if 0 < n {
                    counts.counts.insert((kind, status), n);
                }
            }
        }
        Ok(counts)
    }

    /// Up to `limit` petition headers, spread fairly across accounts.
    ///
    /// Candidates are the maintained (account, reason) index entries, capped
    /// at `5 × limit`; the result round-robins across accounts in random
    /// order so one prolific petitioner cannot monopolize the page.
    pub fn get_petitions_summary_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        kind: ContentKind,
        status: PetitionStatus,
        limit: usize,
        account_filter: Option<AccountKey>,
        reason_filter: Option<&str>,
    ) -> DbResult<Vec<PetitionHeader>> {
        let account_filter_id = match account_filter {
            Some(key) => {
                let account_ids_table = tx.open_table(&account_ids::TABLE)?;
                match Self::get_account_id_tx(service_id, key, &account_ids_table)? {
                    Some(id) => Some(id),
                    // an unknown filter account matches nothing
                    None => return Ok(vec![]),
                }
            }
            None => None,
        };
        let reason_filter_id = match reason_filter {
            Some(reason) => {
                let reason_ids_table = tx.open_table(&reason_ids::TABLE)?;
                match reason_ids_table.get(&reason.to_owned())?.map(|g| g.value()) {
                    Some(id) => Some(id),
                    None => return Ok(vec![]),
                }
            }
            None => None,
        };

        let candidates: Vec<(AccountId, ReasonId)> = {
            let petition_index_table = tx.open_table(&petition_index::TABLE)?;
            let (account_lo, account_hi) = match account_filter_id {
                Some(id) => (id, id),
                None => (AccountId::ZERO, AccountId::MAX),
            };
            let mut candidates = vec![];
            for res in petition_index_table.range(
                (service_id, kind, status, account_lo, ReasonId::ZERO)
                    ..=(service_id, kind, status, account_hi, ReasonId::MAX),
            )? {
                let (k, _) = res?;
                let (_, _, _, account_id, reason_id) = k.value();
                if reason_filter_id.is_some_and(|id| id != reason_id) {
                    continue;
                }
                if status == PetitionStatus::Pending
                    && Self::pending_is_superseded_tx(
                        service_id,
                        kind,
                        account_id,
                        reason_id,
                        &petition_index_table,
                    )?
                {
                    continue;
                }
                candidates.push((account_id, reason_id));
                if 5 * limit <= candidates.len() {
                    break;
                }
            }
            candidates
        };

        // group by account, then round-robin across accounts in random order
        let mut by_account: BTreeMap<AccountId, Vec<ReasonId>> = BTreeMap::new();
        for (account_id, reason_id) in candidates {
            by_account.entry(account_id).or_default().push(reason_id);
        }
        let mut account_order: Vec<AccountId> = by_account.keys().copied().collect();
        account_order.shuffle(&mut rand::rng());

        let mut picked: Vec<(AccountId, ReasonId)> = vec![];
        let mut depth = 0usize;
        while picked.len() < limit {
            let mut any = false;
            for account_id in &account_order {
                let reasons = &by_account[account_id];
                if depth < reasons.len() {
                    any = true;
                    picked.push((*account_id, reasons[depth]));
                    if limit <= picked.len() {
                        break;
                    }
                }
            }
            if !any {
                break;
            }
            depth += 1;
        }

        let accounts_table = tx.open_table(&crate::accounts::TABLE)?;
        let reasons_table = tx.open_table(&reasons::TABLE)?;
        picked
            .into_iter()
            .map(|(account_id, reason_id)| {
                let account_key =
                    Self::get_account_tx(service_id, account_id, &accounts_table)?
                        .map(|r| r.key)
                        .ok_or_else(|| ApiError::internal("petition for unknown account"))?;
                let reason = Self::get_reason_tx(reason_id, &reasons_table)?
                    .ok_or_else(|| ApiError::internal("petition with unknown reason"))?;
                Ok(PetitionHeader {
                    content_kind: kind,
                    status,
                    account_key,
                    reason,
                })
            })
            .collect()
    }

    /// Materialize the full petition for one (account, reason).
    ///
    /// Mapping petitions are bounded (row cap, tag cap, wall clock); tags
    /// with the most hashes come first so truncation keeps the costliest
    /// evidence.
    pub fn get_petition_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        kind: ContentKind,
        status: PetitionStatus,
        account_key: AccountKey,
        reason: &str,
        now: Timestamp,
    ) -> DbResult<Petition> {
        let started = Instant::now();
        let account_id = {
            let account_ids_table = tx.open_table(&account_ids::TABLE)?;
            Self::get_account_id_tx(service_id, account_key, &account_ids_table)?
                .ok_or_else(|| ApiError::not_found("unknown account"))?
        };
        let reason_id = {
            let reason_ids_table = tx.open_table(&reason_ids::TABLE)?;
            reason_ids_table
                .get(&reason.to_owned())?
                .map(|g| g.value())
                .ok_or_else(|| ApiError::not_found("unknown petition reason"))?
        };

        {
            let petition_index_table = tx.open_table(&petition_index::TABLE)?;
            if petition_index_table
                .get(&(service_id, kind, status, account_id, reason_id))?
                .is_none()
            {
                return Err(ApiError::not_found("no such petition").into());
            }
        }

        let mut truncated = false;
        let contents: Vec<ClientContent> = match (kind, status) {
            (ContentKind::Files, PetitionStatus::Pending) => {
                let table = tx.open_table(&files_pending::TABLE)?;
                let master_hashes_table = tx.open_table(&master_hashes::TABLE)?;
                let mut hashes = vec![];
                for res in table.range(
                    (service_id, hoard_core::MasterHashId::ZERO, AccountId::ZERO)
                        ..=(service_id, hoard_core::MasterHashId::MAX, AccountId::MAX),
                )? {
                    let (k, v) = res?;
                    let (_, master_hash_id, row_account) = k.value();
                    if row_account != account_id || v.value().reason_id != reason_id {
                        continue;
                    }
                    if let Some(hash) =
                        Self::get_master_hash_tx(master_hash_id, &master_hashes_table)?
                    {
                        hashes.push(hash);
                    }
                }
                vec![ClientContent::Files { hashes }]
            }
            (ContentKind::Files, PetitionStatus::Petitioned) => {
                let table = tx.open_table(&files_petitioned::TABLE)?;
                let service_hashes_table = tx.open_table(&service_hashes::TABLE)?;
                let master_hashes_table = tx.open_table(&master_hashes::TABLE)?;
                let mut hashes = vec![];
                for res in table.range(
                    (service_id, hoard_core::ServiceHashId::ZERO, AccountId::ZERO)
                        ..=(service_id, hoard_core::ServiceHashId::MAX, AccountId::MAX),
                )? {
                    let (k, v) = res?;
                    let (_, hash_id, row_account) = k.value();
                    if row_account != account_id || v.value().reason_id != reason_id {
                        continue;
                    }
                    if let Some(hash) = Self::resolve_service_hash_tx(
                        service_id,
                        hash_id,
                        &service_hashes_table,
                        &master_hashes_table,
                    )? {
                        hashes.push(hash);
                    }
                }
                vec![ClientContent::Files { hashes }]
            }
            (ContentKind::Mappings, _) => {
                // collect rows per tag, then emit heaviest tags first
                let mut per_tag: BTreeMap<Tag, Vec<hoard_core::id::FileHash>> = BTreeMap::new();
                let mut total_rows = 0usize;

                match status {
                    PetitionStatus::Pending => {
                        let table = tx.open_table(&mappings_pending::TABLE)?;
                        let master_tags_table = tx.open_table(&master_tags::TABLE)?;
                        let master_hashes_table = tx.open_table(&master_hashes::TABLE)?;
                        for res in table.range(
                            (
                                service_id,
                                hoard_core::MasterTagId::ZERO,
                                hoard_core::MasterHashId::ZERO,
                                AccountId::ZERO,
                            )
                                ..=(
                                    service_id,
                                    hoard_core::MasterTagId::MAX,
                                    hoard_core::MasterHashId::MAX,
                                    AccountId::MAX,
                                ),
                        )? {
                            let (k, v) = res?;
                            let (_, master_tag_id, master_hash_id, row_account) = k.value();
                            if row_account != account_id || v.value().reason_id != reason_id {
                                continue;
                            }
                            if MAX_PETITION_MAPPING_ROWS <= total_rows
                                || MAX_PETITION_WALL_CLOCK_SECS
                                    <= started.elapsed().as_secs()
                            {
                                truncated = true;
                                break;
                            }
                            let (Some(tag), Some(hash)) = (
                                Self::get_master_tag_tx(master_tag_id, &master_tags_table)?,
                                Self::get_master_hash_tx(master_hash_id, &master_hashes_table)?,
                            ) else {
                                continue;
                            };
                            per_tag.entry(tag).or_default().push(hash);
                            total_rows += 1;
                        }
                    }
                    PetitionStatus::Petitioned => {
                        let table = tx.open_table(&mappings_petitioned::TABLE)?;
                        let service_tags_table = tx.open_table(&service_tags::TABLE)?;
                        let master_tags_table = tx.open_table(&master_tags::TABLE)?;
                        let service_hashes_table = tx.open_table(&service_hashes::TABLE)?;
                        let master_hashes_table = tx.open_table(&master_hashes::TABLE)?;
                        for res in table.range(
                            (
                                service_id,
                                hoard_core::ServiceTagId::ZERO,
                                hoard_core::ServiceHashId::ZERO,
                                AccountId::ZERO,
                            )
                                ..=(
                                    service_id,
                                    hoard_core::ServiceTagId::MAX,
                                    hoard_core::ServiceHashId::MAX,
                                    AccountId::MAX,
                                ),
                        )? {
                            let (k, v) = res?;
                            let (_, tag_id, hash_id, row_account) = k.value();
                            if row_account != account_id || v.value().reason_id != reason_id {
                                continue;
                            }
                            if MAX_PETITION_MAPPING_ROWS <= total_rows
                                || MAX_PETITION_WALL_CLOCK_SECS
                                    <= started.elapsed().as_secs()
                            {
                                truncated = true;
                                break;
                            }
                            let (Some(tag), Some(hash)) = (
                                Self::resolve_service_tag_tx(
                                    service_id,
                                    tag_id,
                                    &service_tags_table,
                                    &master_tags_table,
                                )?,
                                Self::resolve_service_hash_tx(
                                    service_id,
                                    hash_id,
                                    &service_hashes_table,
                                    &master_hashes_table,
                                )?,
                            ) else {
                                continue;
                            };
                            per_tag.entry(tag).or_default().push(hash);
                            total_rows += 1;
                        }
                    }
                }

                if MAX_PETITION_TAG_IDS < per_tag.len() {
                    truncated = true;
                }

                per_tag
                    .into_iter()
                    .sorted_by_key(|(_, hashes)| std::cmp::Reverse(hashes.len()))
                    .take(MAX_PETITION_TAG_IDS)
                    .map(|(tag, hashes)| ClientContent::Mappings { tag, hashes })
                    .collect()
            }
            (ContentKind::TagParents, _) => {
                Self::collect_pair_contents_tx(tx, service_id, kind, status, account_id, reason_id)?
                    .into_iter()
                    .map(|(child, parent)| ClientContent::TagParent { child, parent })
                    .collect()
            }
            (ContentKind::TagSiblings, _) => {
                Self::collect_pair_contents_tx(tx, service_id, kind, status, account_id, reason_id)?
                    .into_iter()
                    .map(|(bad, good)| ClientContent::TagSibling { bad, good })
                    .collect()
            }
        };

        let action = match status {
            PetitionStatus::Pending => ClientAction::Pend,
            PetitionStatus::Petitioned => ClientAction::Petition,
        };
        let account = Self::account_view_tx(tx, service_id, account_id, now)?;

        Ok(Petition {
            header: PetitionHeader {
                content_kind: kind,
                status,
                account_key,
                reason: reason.to_owned(),
            },
            account,
            actions: vec![(action, contents)],
            truncated,
        })
    }

    /// Tag pairs of one (account, reason) petition for a pair kind.
    fn collect_pair_contents_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        kind: ContentKind,
        status: PetitionStatus,
        account_id: AccountId,
        reason_id: ReasonId,
    ) -> DbResult<Vec<(Tag, Tag)>> {
        let mut out: BTreeSet<(Tag, Tag)> = BTreeSet::new();
        match status {
            PetitionStatus::Pending => {
                let master_tags_table = tx.open_table(&master_tags::TABLE)?;
                let rows: Vec<(hoard_core::MasterTagId, hoard_core::MasterTagId)> = {
                    let table = match kind {
                        ContentKind::TagParents => tx.open_table(&tag_parents_pending::TABLE)?,
                        ContentKind::TagSiblings => tx.open_table(&tag_siblings_pending::TABLE)?,
                        _ => unreachable!("pair kinds only"),
                    };
                    table
                        .range(
                            (
                                service_id,
                                hoard_core::MasterTagId::ZERO,
                                hoard_core::MasterTagId::ZERO,
                                AccountId::ZERO,
                            )
                                ..=(
                                    service_id,
                                    hoard_core::MasterTagId::MAX,
                                    hoard_core::MasterTagId::MAX,
                                    AccountId::MAX,
                                ),
                        )?
                        .filter_map(|res| match res {
                            Ok((k, v)) => {
                                let (_, a, b, row_account) = k.value();
                                (row_account == account_id && v.value().reason_id == reason_id)
                                    .then_some(Ok((a, b)))
                            }
                            Err(err) => Some(Err(err)),
                        })
                        .collect::<Result<Vec<_>, _>>()?
                };
                for (a, b) in rows {
                    let (Some(a), Some(b)) = (
                        Self::get_master_tag_tx(a, &master_tags_table)?,
                        Self::get_master_tag_tx(b, &master_tags_table)?,
                    ) else {
                        continue;
                    };
                    out.insert((a, b));
                }
            }
            PetitionStatus::Petitioned => {
                let service_tags_table = tx.open_table(&service_tags::TABLE)?;
                let master_tags_table = tx.open_table(&master_tags::TABLE)?;
                let rows: Vec<(hoard_core::ServiceTagId, hoard_core::ServiceTagId)> = {
                    let table = match kind {
                        ContentKind::TagParents => {
                            tx.open_table(&tag_parents_petitioned::TABLE)?
                        }
                        ContentKind::TagSiblings => {
                            tx.open_table(&tag_siblings_petitioned::TABLE)?
                        }
                        _ => unreachable!("pair kinds only"),
                    };
                    table
                        .range(
                            (
                                service_id,
                                hoard_core::ServiceTagId::ZERO,
                                hoard_core::ServiceTagId::ZERO,
                                AccountId::ZERO,
                            )
                                ..=(
                                    service_id,
                                    hoard_core::ServiceTagId::MAX,
                                    hoard_core::ServiceTagId::MAX,
                                    AccountId::MAX,
                                ),
                        )?
                        .filter_map(|res| match res {
                            Ok((k, v)) => {
                                let (_, a, b, row_account) = k.value();
                                (row_account == account_id && v.value().reason_id == reason_id)
                                    .then_some(Ok((a, b)))
                            }
                            Err(err) => Some(Err(err)),
                        })
                        .collect::<Result<Vec<_>, _>>()?
                };
                for (a, b) in rows {
                    let (Some(a), Some(b)) = (
                        Self::resolve_service_tag_tx(
                            service_id,
                            a,
                            &service_tags_table,
                            &master_tags_table,
                        )?,
                        Self::resolve_service_tag_tx(
                            service_id,
                            b,
                            &service_tags_table,
                            &master_tags_table,
                        )?,
                    ) else {
                        continue;
                    };
                    out.insert((a, b));
                }
            }
        }
        Ok(out.into_iter().collect())
    }
}
