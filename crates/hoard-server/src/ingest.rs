//! Client submission processing.
//!
//! A submission is a list of (action, content, reason) entries. The whole
//! submission applies in one serializer job: either every entry lands or
//! none do. What an entry does depends on the submitter's permission level
//! for that content kind:
//!
//! - `Pend` with Create commits the addition immediately; with Petition it
//!   queues a pending row.
//! - `Petition` with Moderate executes the removal immediately; with
//!   Petition it queues a petitioned row (a reason is required).
//!
//! Tags are normalized before they arrive here (they are [`Tag`]s already);
//! rows whose tags the service's tag filter rejects are skipped, matching
//! how the filter silently strips tags elsewhere.

use hoard_core::Timestamp;
use hoard_core::account::{ContentScope, PermissionLevel};
use hoard_core::content::{ClientAction, ClientContent};
use hoard_core::error::{ApiError, ApiResult};
use hoard_core::id::ServiceKey;
use hoard_core::update::ClientUpdate;
use hoard_server_db::Database;
use tracing::debug;

use crate::{Actor, Engine, LOG_TARGET};

impl Engine {
    /// Apply one client→server update submission atomically.
    pub async fn process_update(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        update: ClientUpdate,
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        let (service_id, service) = self.service(service_key)?;
        if service_id != actor.service_id {
            return Err(ApiError::bad_request("session is for a different service"));
        }
        if !service.kind.is_repository() {
            return Err(ApiError::bad_request("not a repository service"));
        }
        Self::check_account_usable(&actor.account, now)?;

        let entries = update.entries().to_vec();
        if entries.is_empty() {
            return Ok(());
        }

        // weigh the submission for bandwidth purposes: one request plus a
        // nominal byte per row
        let rows: usize = entries.iter().map(|e| e.content.num_rows()).sum();
        self.consume_bandwidth(actor, rows as u64).await?;

        // resolve permission level per entry before entering the job
        #[derive(Clone, Copy)]
        enum Disposition {
            Commit,
            Queue,
        }
        let mut planned = Vec::with_capacity(entries.len());
        for entry in entries {
            let scope = ContentScope::from(entry.content.kind());
            let is_admin = actor.account.is_admin();
            let disposition = match entry.action {
                ClientAction::Pend => {
                    if is_admin
                        || actor
                            .account
                            .account_type
                            .has_permission(scope, PermissionLevel::Create)
                    {
                        Disposition::Commit
                    } else if actor
                        .account
                        .account_type
                        .has_permission(scope, PermissionLevel::Petition)
                    {
                        Disposition::Queue
                    } else {
                        return Err(ApiError::forbidden(format!(
                            "no permission to submit {}",
                            entry.content.kind()
                        )));
                    }
                }
                ClientAction::Petition => {
                    if is_admin
                        || actor
                            .account
                            .account_type
                            .has_permission(scope, PermissionLevel::Moderate)
                    {
                        Disposition::Commit
                    } else if actor
                        .account
                        .account_type
                        .has_permission(scope, PermissionLevel::Petition)
                    {
                        if entry.reason.as_deref().unwrap_or("").is_empty() {
                            return Err(ApiError::bad_request("a petition needs a reason"));
                        }
                        Disposition::Queue
                    } else {
                        return Err(ApiError::forbidden(format!(
                            "no permission to petition {}",
                            entry.content.kind()
                        )));
                    }
                }
            };
            planned.push((disposition, entry));
        }

        let account_id = actor.account_id;
        let is_moderator_overwrite = actor.account.is_admin();
        let tag_filter = service.options.tag_filter.clone();

        self.serializer()
            .write(move |tx| {
                for (disposition, entry) in planned {
                    let reason = entry.reason.as_deref().unwrap_or("");
                    match (&entry.content, entry.action, disposition) {
                        (ClientContent::Files { hashes }, ClientAction::Pend, Disposition::Commit) => {
                            Database::add_files_by_hash_tx(
                                tx,
                                service_id,
                                account_id,
                                hashes,
                                is_moderator_overwrite,
                                now,
                            )?;
                        }
                        (ClientContent::Files { hashes }, ClientAction::Pend, Disposition::Queue) => {
                            Database::pend_files_tx(
                                tx, service_id, account_id, hashes, reason, now,
                            )?;
                        }
                        (
                            ClientContent::Files { hashes },
                            ClientAction::Petition,
                            Disposition::Commit,
                        ) => {
                            Database::delete_files_tx(tx, service_id, account_id, hashes, now)?;
                        }
                        (
                            ClientContent::Files { hashes },
                            ClientAction::Petition,
                            Disposition::Queue,
                        ) => {
                            Database::petition_files_tx(
                                tx, service_id, account_id, hashes, reason, now,
                            )?;
                        }
                        (
                            ClientContent::Mappings { tag, hashes },
                            action,
                            disposition,
                        ) => {
                            if !tag_filter.allows(tag) {
                                continue;
                            }
                            match (action, disposition) {
                                (ClientAction::Pend, Disposition::Commit) => {
                                    Database::add_mappings_tx(
                                        tx,
                                        service_id,
                                        account_id,
                                        tag,
                                        hashes,
                                        is_moderator_overwrite,
                                        now,
                                    )?;
                                }
                                (ClientAction::Pend, Disposition::Queue) => {
                                    Database::pend_mappings_tx(
                                        tx, service_id, account_id, tag, hashes, reason, now,
                                    )?;
                                }
                                (ClientAction::Petition, Disposition::Commit) => {
                                    Database::delete_mappings_tx(
                                        tx, service_id, account_id, tag, hashes, now,
                                    )?;
                                }
                                (ClientAction::Petition, Disposition::Queue) => {
                                    Database::petition_mappings_tx(
                                        tx, service_id, account_id, tag, hashes, reason, now,
                                    )?;
                                }
                            }
                        }
                        (ClientContent::TagParent { child, parent }, action, disposition) => {
                            if !tag_filter.allows(child) || !tag_filter.allows(parent) {
                                continue;
                            }
                            match (action, disposition) {
                                (ClientAction::Pend, Disposition::Commit) => {
                                    Database::add_tag_parent_tx(
                                        tx,
                                        service_id,
                                        account_id,
                                        child,
                                        parent,
                                        is_moderator_overwrite,
                                        now,
                                    )?;
                                }
                                (ClientAction::Pend, Disposition::Queue) => {
                                    Database::pend_tag_parent_tx(
                                        tx, service_id, account_id, child, parent, reason, now,
                                    )?;
                                }
                                (ClientAction::Petition, Disposition::Commit) => {
                                    Database::delete_tag_parent_tx(
                                        tx, service_id, account_id, child, parent, now,
                                    )?;
                                }
                                (ClientAction::Petition, Disposition::Queue) => {
                                    Database::petition_tag_parent_tx(
                                        tx, service_id, account_id, child, parent, reason, now,
                                    )?;
                                }
                            }
                        }
                        (ClientContent::TagSibling { bad, good }, action, disposition) => {
                            if !tag_filter.allows(bad) || !tag_filter.allows(good) {
                                continue;
                            }
                            match (action, disposition) {
                                (ClientAction::Pend, Disposition::Commit) => {
                                    Database::add_tag_sibling_tx(
                                        tx,
                                        service_id,
                                        account_id,
                                        bad,
                                        good,
                                        is_moderator_overwrite,
                                        now,
                                    )?;
                                }
                                (ClientAction::Pend, Disposition::Queue) => {
                                    Database::pend_tag_sibling_tx(
                                        tx, service_id, account_id, bad, good, reason, now,
                                    )?;
                                }
                                (ClientAction::Petition, Disposition::Commit) => {
                                    Database::delete_tag_sibling_tx(
                                        tx, service_id, account_id, bad, now,
                                    )?;
                                }
                                (ClientAction::Petition, Disposition::Queue) => {
                                    Database::petition_tag_sibling_tx(
                                        tx, service_id, account_id, bad, good, reason, now,
                                    )?;
                                }
                            }
                        }
                    }
                }
                Ok(())
            })
            .await?;

        debug!(
            target: LOG_TARGET,
            %service_id,
            account = %actor.account.key,
            rows,
            "Processed client update"
        );

        Ok(())
    }
}
