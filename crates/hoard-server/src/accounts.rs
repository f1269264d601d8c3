//! Engine operations on services, accounts and account types.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hoard_core::Timestamp;
use hoard_core::account::{AccountType, AccountView, ContentScope, PermissionLevel};
use hoard_core::error::{ApiError, ApiResult};
use hoard_core::id::{AccessKey, AccountKey, RegistrationKey, ServiceKey};
use hoard_core::service::{ServiceKind, ServiceOptions};
use hoard_core::{AccountTypeId, ServiceId};
use hoard_server_db::{
    AccountInfo, Database, IssuedRegistration, ServiceRecord, account_ids, account_types,
};
use tracing::info;

use crate::pubsub::Event;
use crate::{Actor, Engine, LOG_TARGET};

/// Per-slice row cap of `delete_all_content`.
const DELETE_ALL_SLICE_ROWS: usize = 500;
/// Wall-clock budget of one `delete_all_content` call; the caller resumes.
const DELETE_ALL_BUDGET: Duration = Duration::from_secs(20);

impl Engine {
    pub(crate) fn service(&self, service_key: ServiceKey) -> ApiResult<(ServiceId, Arc<ServiceRecord>)> {
        let service_id = self.registry().resolve_key(service_key)?;
        let record = self.registry().get(service_id)?;
        Ok((service_id, record))
    }

    // ========================================================================
    // Service roster (admin service)
    // ========================================================================

    /// Create a service. The returned admin access key is shown once.
    pub async fn create_service(
        &self,
        actor: &Actor,
        kind: ServiceKind,
        name: &str,
        port: u16,
        options: ServiceOptions,
    ) -> ApiResult<(ServiceKey, AccessKey)> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Services, PermissionLevel::Moderate, now)?;

        let service_key = ServiceKey::generate();
        let name = name.to_owned();
        let provisioned = self
            .serializer()
            .write(move |tx| {
                Database::create_service_tx(tx, service_key, kind, &name, port, options, now)
            })
            .await?;

        let record = self
            .serializer()
            .read(move |tx| {
                let services_table = tx.open_table(&hoard_server_db::services::TABLE)?;
                Database::get_service_tx(provisioned.service_id, &services_table)
            })
            .await?
            .ok_or_else(|| ApiError::internal("service vanished after creation"))?;
        self.registry().insert(provisioned.service_id, record);

        Ok((service_key, provisioned.admin_access_key))
    }

    /// Replace a service's options (update period, tag filter, …).
    pub async fn update_service_options(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        options: ServiceOptions,
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Options, PermissionLevel::Moderate, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.registry().update(service_id, |record| {
            record.options = options;
        })?;
        Ok(())
    }

    // ========================================================================
    // Account types
    // ========================================================================

    pub async fn list_account_types(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
    ) -> ApiResult<Vec<(AccountTypeId, AccountType)>> {
        Self::check_account_usable(&actor.account, Timestamp::now())?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        let rows = self
            .serializer()
            .read(move |tx| {
                let account_types_table = tx.open_table(&account_types::TABLE)?;
                Database::list_account_types_tx(service_id, &account_types_table)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, record)| (id, record.account_type))
            .collect())
    }

    pub async fn add_account_type(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        account_type: AccountType,
    ) -> ApiResult<AccountTypeId> {
        let now = Timestamp::now();
        Self::check_permission(
            actor,
            ContentScope::AccountTypes,
            PermissionLevel::Moderate,
            now,
        )?;
        if account_type.is_null {
            return Err(ApiError::bad_request("cannot create another null type"));
        }
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        let account_type_id = self
            .serializer()
            .write(move |tx| Database::create_account_type_tx(tx, service_id, account_type))
            .await?;
        self.pubsub().publish(Event::AccountTypesChanged { service_id });
        Ok(account_type_id)
    }

    pub async fn update_account_type(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        account_type_id: AccountTypeId,
        account_type: AccountType,
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        Self::check_permission(
            actor,
            ContentScope::AccountTypes,
            PermissionLevel::Moderate,
            now,
        )?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .write(move |tx| {
                Database::update_account_type_tx(tx, service_id, account_type_id, account_type)
            })
            .await?;

        // permissions may have shifted under every session of the service
        self.sessions.refresh_all(self.serializer(), service_id).await?;
        self.pubsub().publish(Event::AccountTypesChanged { service_id });
        Ok(())
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub async fn issue_registration_keys(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        account_type_id: AccountTypeId,
        count: usize,
        expires_at: Option<Timestamp>,
    ) -> ApiResult<Vec<IssuedRegistration>> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Accounts, PermissionLevel::Create, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .write(move |tx| {
                Database::issue_registration_keys_tx(tx, service_id, account_type_id, count, expires_at)
            })
            .await
    }

    /// Redeem a registration key; unauthenticated, rotates the access key.
    pub async fn fetch_access_key(
        &self,
        service_key: ServiceKey,
        registration_key: RegistrationKey,
    ) -> ApiResult<AccessKey> {
        let service_id = self.registry().resolve_key(service_key)?;
        let now = Timestamp::now();
        self.serializer()
            .write(move |tx| Database::fetch_access_key_tx(tx, service_id, registration_key, now))
            .await
    }

    /// Self-serve account creation, gated by the account type's velocity.
    pub async fn auto_create_account(
        &self,
        service_key: ServiceKey,
        account_type_id: AccountTypeId,
    ) -> ApiResult<AccessKey> {
        let service_id = self.registry().resolve_key(service_key)?;
        let now = Timestamp::now();
        self.serializer()
            .write(move |tx| {
                let record = {
                    let account_types_table = tx.open_table(&account_types::TABLE)?;
                    Database::get_account_type_tx(service_id, account_type_id, &account_types_table)?
                        .ok_or_else(|| ApiError::not_found("unknown account type"))?
                };
                if !record
                    .account_type
                    .can_auto_create_now(&record.auto_create_history, now)
                {
                    return Err(ApiError::conflict(
                        "this account type has no auto-creation allowance right now",
                    )
                    .into());
                }
                Database::report_auto_create_tx(tx, service_id, account_type_id, now)?;

                let access_key = AccessKey::generate();
                Database::create_account_tx(
                    tx,
                    service_id,
                    AccountKey::generate(),
                    account_type_id,
                    now,
                    None,
                    access_key.digest(),
                )?;
                Ok(access_key)
            })
            .await
    }

    /// The actor's own account view.
    pub fn get_account(&self, actor: &Actor) -> AccountView {
        actor.account.clone()
    }

    // ========================================================================
    // Moderator account operations
    // ========================================================================

    pub async fn get_account_info(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        subject: AccountKey,
    ) -> ApiResult<AccountInfo> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Accounts, PermissionLevel::Moderate, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .write(move |tx| Database::get_account_info_tx(tx, service_id, subject, now))
            .await
    }

    async fn after_account_mutation(&self, service_id: ServiceId, subject: AccountKey) -> ApiResult<()> {
        self.sessions
            .refresh_accounts(self.serializer(), service_id, &[subject])
            .await?;
        self.pubsub().publish(Event::AccountsChanged {
            service_id,
            account_keys: vec![subject],
        });
        Ok(())
    }

    pub async fn modify_account_type(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        subject: AccountKey,
        account_type_id: AccountTypeId,
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Accounts, PermissionLevel::Moderate, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .write(move |tx| {
                Database::set_account_type_of_account_tx(tx, service_id, subject, account_type_id)
            })
            .await?;
        self.after_account_mutation(service_id, subject).await
    }

    pub async fn ban_account(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        subject: AccountKey,
        reason: &str,
        banned_until: Option<Timestamp>,
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Accounts, PermissionLevel::Moderate, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        let reason = reason.to_owned();
        self.serializer()
            .write(move |tx| {
                Database::ban_account_tx(tx, service_id, subject, &reason, banned_until, now)
            })
            .await?;
        info!(target: LOG_TARGET, %service_id, subject = %subject, "Account banned");
        self.after_account_mutation(service_id, subject).await
    }

    pub async fn unban_account(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        subject: AccountKey,
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Accounts, PermissionLevel::Moderate, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .write(move |tx| Database::unban_account_tx(tx, service_id, subject))
            .await?;
        self.after_account_mutation(service_id, subject).await
    }

    pub async fn set_account_expires(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        subject: AccountKey,
        expires_at: Option<Timestamp>,
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Accounts, PermissionLevel::Moderate, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .write(move |tx| Database::set_account_expires_tx(tx, service_id, subject, expires_at))
            .await?;
        self.after_account_mutation(service_id, subject).await
    }

    pub async fn set_account_message(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        subject: AccountKey,
        message: &str,
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Accounts, PermissionLevel::Moderate, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        let message = message.to_owned();
        self.serializer()
            .write(move |tx| Database::set_account_message_tx(tx, service_id, subject, &message, now))
            .await?;
        self.after_account_mutation(service_id, subject).await
    }

    /// Delete everything a subject authored, in ≤500-row slices through the
    /// normal delete path, under the busy flag and a 20 s budget.
    ///
    /// Returns `false` when the budget ran out first; re-invocation is the
    /// caller's responsibility.
    pub async fn delete_all_content(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        subject: AccountKey,
    ) -> ApiResult<bool> {
        let now = Timestamp::now();
        Self::check_permission(actor, ContentScope::Accounts, PermissionLevel::Moderate, now)?;
        let service_id = self.registry().resolve_key(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        let _busy = self.try_busy()?;

        let subject_account_id = self
            .serializer()
            .read(move |tx| {
                let account_ids_table = tx.open_table(&account_ids::TABLE)?;
                Database::get_account_id_tx(service_id, subject, &account_ids_table)
            })
            .await?
            .ok_or_else(|| ApiError::not_found("unknown account"))?;

        {
            // the null account owns nullified history; sweeping it would
            // erase the archive wholesale
            let record = self.registry().get(service_id)?;
            if record.null_account_id == subject_account_id {
                return Err(ApiError::bad_request("the null account cannot be modified"));
            }
        }

        let actor_account_id = actor.account_id;
        let deadline = Instant::now() + DELETE_ALL_BUDGET;
        loop {
            let now = Timestamp::now();
            let outcome = self
                .serializer()
                .write(move |tx| {
                    Database::delete_account_content_slice_tx(
                        tx,
                        service_id,
                        actor_account_id,
                        subject_account_id,
                        DELETE_ALL_SLICE_ROWS,
                        now,
                    )
                })
                .await?;

            if outcome.fully_done {
                self.after_account_mutation(service_id, subject).await?;
                return Ok(true);
            }
            if deadline <= Instant::now() {
                self.after_account_mutation(service_id, subject).await?;
                return Ok(false);
            }
        }
    }
}
