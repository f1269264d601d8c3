//! Engine-side petition queue: counts, summaries, fetch, resolution.

use hoard_core::Timestamp;
use hoard_core::account::{ContentScope, PermissionLevel};
use hoard_core::content::{ClientAction, ClientContent, ContentKind};
use hoard_core::error::{ApiError, ApiResult};
use hoard_core::id::{AccountKey, ServiceKey};
use hoard_core::update::{Petition, PetitionHeader, PetitionStatus};
use hoard_server_db::{Database, PetitionCounts, account_ids, petition_index};
use tracing::info;

use crate::{Actor, Engine, LOG_TARGET};

impl Engine {
    fn check_moderates_kind(actor: &Actor, kind: ContentKind, now: Timestamp) -> ApiResult<()> {
        Engine::check_permission(actor, kind.into(), PermissionLevel::Moderate, now)
    }

    /// Actionable petition counts per (kind, status).
    pub async fn num_petitions(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
    ) -> ApiResult<PetitionCounts> {
        let now = Timestamp::now();
        // any moderator of any kind may see the totals
        let moderates_something = actor.account.is_admin()
            || ContentKind::ALL.iter().any(|kind| {
                actor
                    .account
                    .account_type
                    .has_permission(ContentScope::from(*kind), PermissionLevel::Moderate)
            });
        Self::check_account_usable(&actor.account, now)?;
        if !moderates_something {
            return Err(ApiError::forbidden("moderators only"));
        }

        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .read(move |tx| {
                let petition_index_table = tx.open_table(&petition_index::TABLE)?;
                Database::get_petition_counts_tx(service_id, &petition_index_table)
            })
            .await
    }

    /// Up to `limit` petition headers for one kind and status.
    pub async fn petitions_summary(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        kind: ContentKind,
        status: PetitionStatus,
        limit: usize,
        account_filter: Option<AccountKey>,
        reason_filter: Option<String>,
    ) -> ApiResult<Vec<PetitionHeader>> {
        let now = Timestamp::now();
        Self::check_moderates_kind(actor, kind, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .write(move |tx| {
                Database::get_petitions_summary_tx(
                    tx,
                    service_id,
                    kind,
                    status,
                    limit,
                    account_filter,
                    reason_filter.as_deref(),
                )
            })
            .await
    }

    /// Materialize one petition for moderation.
    pub async fn get_petition(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        kind: ContentKind,
        status: PetitionStatus,
        subject: AccountKey,
        reason: String,
    ) -> ApiResult<Petition> {
        let now = Timestamp::now();
        Self::check_moderates_kind(actor, kind, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .write(move |tx| {
                Database::get_petition_tx(tx, service_id, kind, status, subject, &reason, now)
            })
            .await
    }

    /// Approve a petition: replay its content through the same add/delete
    /// primitives a moderator's own submission would use.
    pub async fn approve_petition(&self, actor: &Actor, service_key: ServiceKey, petition: &Petition) -> ApiResult<()> {
        let now = Timestamp::now();
        let kind = petition.header.content_kind;
        Self::check_moderates_kind(actor, kind, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;

        let subject = petition.header.account_key;
        let actor_account_id = actor.account_id;
        let actions = petition.actions.clone();

        self.serializer()
            .write(move |tx| {
                let subject_account_id = {
                    let account_ids_table = tx.open_table(&account_ids::TABLE)?;
                    Database::get_account_id_tx(service_id, subject, &account_ids_table)?
                        .ok_or_else(|| ApiError::not_found("unknown account"))?
                };

                for (action, contents) in &actions {
                    for content in contents {
                        match (action, content) {
                            // approved pends commit attributed to the pender
                            (ClientAction::Pend, ClientContent::Files { hashes }) => {
                                Database::add_files_by_hash_tx(
                                    tx,
                                    service_id,
                                    subject_account_id,
                                    hashes,
                                    false,
                                    now,
                                )?;
                            }
                            (ClientAction::Pend, ClientContent::Mappings { tag, hashes }) => {
                                Database::add_mappings_tx(
                                    tx,
                                    service_id,
                                    subject_account_id,
                                    tag,
                                    hashes,
                                    false,
                                    now,
                                )?;
                            }
                            (ClientAction::Pend, ClientContent::TagParent { child, parent }) => {
                                Database::add_tag_parent_tx(
                                    tx,
                                    service_id,
                                    subject_account_id,
                                    child,
                                    parent,
                                    false,
                                    now,
                                )?;
                            }
                            (ClientAction::Pend, ClientContent::TagSibling { bad, good }) => {
                                Database::add_tag_sibling_tx(
                                    tx,
                                    service_id,
                                    subject_account_id,
                                    bad,
                                    good,
                                    false,
                                    now,
                                )?;
                            }
                            // approved petitions delete as the moderator
                            (ClientAction::Petition, ClientContent::Files { hashes }) => {
                                Database::delete_files_tx(
                                    tx,
                                    service_id,
                                    actor_account_id,
                                    hashes,
                                    now,
                                )?;
                            }
                            (ClientAction::Petition, ClientContent::Mappings { tag, hashes }) => {
                                Database::delete_mappings_tx(
                                    tx,
                                    service_id,
                                    actor_account_id,
                                    tag,
                                    hashes,
                                    now,
                                )?;
                            }
                            (ClientAction::Petition, ClientContent::TagParent { child, parent }) => {
                                Database::delete_tag_parent_tx(
                                    tx,
                                    service_id,
                                    actor_account_id,
                                    child,
                                    parent,
                                    now,
                                )?;
                            }
                            (ClientAction::Petition, ClientContent::TagSibling { bad, .. }) => {
                                Database::delete_tag_sibling_tx(
                                    tx,
                                    service_id,
                                    actor_account_id,
                                    bad,
                                    now,
                                )?;
                            }
                        }
                    }
                }
                Ok(())
            })
            .await?;

        info!(
            target: LOG_TARGET,
            %service_id,
            kind = %kind,
            subject = %subject,
            "Petition approved"
        );
        Ok(())
    }

    /// Deny a petition: drop its queued rows and dock the petitioner.
    pub async fn deny_petition(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        kind: ContentKind,
        status: PetitionStatus,
        subject: AccountKey,
        reason: String,
    ) -> ApiResult<u64> {
        let now = Timestamp::now();
        Self::check_moderates_kind(actor, kind, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;

        let dropped = self
            .serializer()
            .write(move |tx| {
                let subject_account_id = {
                    let account_ids_table = tx.open_table(&account_ids::TABLE)?;
                    Database::get_account_id_tx(service_id, subject, &account_ids_table)?
                        .ok_or_else(|| ApiError::not_found("unknown account"))?
                };
                let reason_id = Database::intern_reason_tx(tx, &reason)?;

                let dropped = match (kind, status) {
                    (ContentKind::Files, PetitionStatus::Pending) => {
                        Database::deny_file_pends_tx(tx, service_id, subject_account_id, reason_id)?
                    }
                    (ContentKind::Files, PetitionStatus::Petitioned) => {
                        Database::deny_file_petitions_tx(
                            tx,
                            service_id,
                            subject_account_id,
                            reason_id,
                        )?
                    }
                    (ContentKind::Mappings, PetitionStatus::Pending) => {
                        Database::deny_mapping_pends_tx(
                            tx,
                            service_id,
                            subject_account_id,
                            reason_id,
                        )?
                    }
                    (ContentKind::Mappings, PetitionStatus::Petitioned) => {
                        Database::deny_mapping_petitions_tx(
                            tx,
                            service_id,
                            subject_account_id,
                            reason_id,
                        )?
                    }
                    (ContentKind::TagParents, PetitionStatus::Pending) => {
                        Database::deny_tag_parent_pends_tx(
                            tx,
                            service_id,
                            subject_account_id,
                            reason_id,
                        )?
                    }
                    (ContentKind::TagParents, PetitionStatus::Petitioned) => {
                        Database::deny_tag_parent_petitions_tx(
                            tx,
                            service_id,
                            subject_account_id,
                            reason_id,
                        )?
                    }
                    (ContentKind::TagSiblings, PetitionStatus::Pending) => {
                        Database::deny_tag_sibling_pends_tx(
                            tx,
                            service_id,
                            subject_account_id,
                            reason_id,
                        )?
                    }
                    (ContentKind::TagSiblings, PetitionStatus::Petitioned) => {
                        Database::deny_tag_sibling_petitions_tx(
                            tx,
                            service_id,
                            subject_account_id,
                            reason_id,
                        )?
                    }
                };
                Ok(dropped)
            })
            .await?;

        info!(
            target: LOG_TARGET,
            %service_id,
            kind = %kind,
            subject = %subject,
            dropped,
            "Petition denied"
        );
        Ok(dropped)
    }
}
