//! File upload/download and the update index endpoints.

use hoard_core::Timestamp;
use hoard_core::account::{ContentScope, PermissionLevel};
use hoard_core::content::FileInfo;
use hoard_core::error::{ApiError, ApiResult};
use hoard_core::id::{FileHash, ServiceKey, UpdateHash};
use hoard_core::service::ServiceKind;
use hoard_core::update::UpdateMetadata;
use hoard_server_db::{Database, ServiceInfoKind, service_info, repo_states, update_metadata, updates};
use tracing::info;

use crate::blob::BlobKind;
use crate::{Actor, Engine, LOG_TARGET};

impl Engine {
    /// Accept a file upload: verify the digest, enforce the storage cap,
    /// store the blob (and thumbnail), and commit the current row.
    pub async fn put_file(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        info: FileInfo,
        bytes: Vec<u8>,
        thumbnail: Option<Vec<u8>>,
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        let (service_id, service) = self.service(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        if service.kind != ServiceKind::FileRepo {
            return Err(ApiError::bad_request("not a file repository"));
        }
        Self::check_permission(actor, ContentScope::Files, PermissionLevel::Create, now)?;

        if FileHash::digest_of(&bytes) != info.hash {
            return Err(ApiError::bad_request("file bytes do not match the hash"));
        }
        if bytes.len() as u64 != info.size {
            return Err(ApiError::bad_request("file bytes do not match the size"));
        }

        let is_moderator = actor.account.is_admin()
            || actor
                .account
                .account_type
                .has_permission(ContentScope::Files, PermissionLevel::Moderate);

        // storage admission: moderators bypass the cap
        if let Some(max_storage) = service.options.max_storage {
            if !is_moderator {
                let used = self
                    .serializer()
                    .read(move |tx| {
                        let service_info_table = tx.open_table(&service_info::TABLE)?;
                        Database::current_file_storage_tx(service_id, &service_info_table)
                    })
                    .await?;
                if max_storage < used + info.size {
                    return Err(ApiError::conflict("file repository is full"));
                }
            }
        }

        self.consume_bandwidth(actor, info.size).await?;

        // blob first: a crash between blob and row leaves an unreferenced
        // blob, never a row pointing at missing bytes
        self.blobs()
            .put_file(info.hash, &bytes)
            .await
            .map_err(|err| ApiError::internal(format!("blob write failed: {err}")))?;
        if let Some(thumbnail) = &thumbnail {
            self.blobs()
                .put_thumbnail(info.hash, thumbnail)
                .await
                .map_err(|err| ApiError::internal(format!("thumbnail write failed: {err}")))?;
        }

        let account_id = actor.account_id;
        self.serializer()
            .write(move |tx| {
                Database::add_file_tx(tx, service_id, account_id, &info, is_moderator, now)
            })
            .await?;

        info!(target: LOG_TARGET, %service_id, account = %actor.account.key, "File uploaded");
        Ok(())
    }

    /// Fetch a file blob by hash.
    pub async fn get_file(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        hash: FileHash,
    ) -> ApiResult<Vec<u8>> {
        self.get_blob(actor, service_key, hash, BlobKind::File).await
    }

    /// Fetch a thumbnail blob by (file) hash.
    pub async fn get_thumbnail(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        hash: FileHash,
    ) -> ApiResult<Vec<u8>> {
        self.get_blob(actor, service_key, hash, BlobKind::Thumbnail)
            .await
    }

    async fn get_blob(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        hash: FileHash,
        kind: BlobKind,
    ) -> ApiResult<Vec<u8>> {
        let now = Timestamp::now();
        let (service_id, service) = self.service(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        if service.kind != ServiceKind::FileRepo {
            return Err(ApiError::bad_request("not a file repository"));
        }
        Self::check_account_usable(&actor.account, now)?;

        let bytes = self
            .blobs()
            .read(hash, kind)
            .await
            .map_err(|err| ApiError::internal(format!("blob read failed: {err}")))?
            .ok_or_else(|| ApiError::not_found("no such file"))?;
        self.consume_bandwidth(actor, bytes.len() as u64).await?;
        Ok(bytes)
    }

    /// Fetch an update bundle by its hash.
    pub async fn get_update(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        hash: UpdateHash,
    ) -> ApiResult<Vec<u8>> {
        let now = Timestamp::now();
        let (service_id, _) = self.service(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        Self::check_account_usable(&actor.account, now)?;

        let known = self
            .serializer()
            .read(move |tx| {
                let updates_table = tx.open_table(&updates::TABLE)?;
                Database::has_update_hash_tx(service_id, hash, &updates_table)
            })
            .await?;
        if !known {
            return Err(ApiError::not_found("this service has no such update"));
        }

        let bytes = self
            .blobs()
            .read_update(hash)
            .await
            .map_err(|err| ApiError::internal(format!("blob read failed: {err}")))?
            .ok_or_else(|| ApiError::not_found("update blob missing"))?;
        self.consume_bandwidth(actor, bytes.len() as u64).await?;
        Ok(bytes)
    }

    /// The full per-service update index.
    pub async fn metadata(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
    ) -> ApiResult<UpdateMetadata> {
        Self::check_account_usable(&actor.account, Timestamp::now())?;
        let (service_id, _) = self.service(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .read(move |tx| {
                let update_metadata_table = tx.open_table(&update_metadata::TABLE)?;
                let repo_states_table = tx.open_table(&repo_states::TABLE)?;
                Database::get_update_metadata_tx(
                    service_id,
                    &update_metadata_table,
                    &repo_states_table,
                )
            })
            .await
    }

    /// The update index from `from_update_index` onward.
    pub async fn metadata_slice(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
        from_update_index: u64,
    ) -> ApiResult<UpdateMetadata> {
        Ok(self
            .metadata(actor, service_key)
            .await?
            .slice_from(from_update_index))
    }

    /// Current bytes stored for a file service, from the maintained total.
    pub async fn file_storage_used(&self, service_key: ServiceKey) -> ApiResult<u64> {
        let (service_id, _) = self.service(service_key)?;
        self.serializer()
            .read(move |tx| {
                let service_info_table = tx.open_table(&service_info::TABLE)?;
                Database::current_file_storage_tx(service_id, &service_info_table)
            })
            .await
    }

    /// All maintained totals of a service.
    pub async fn service_info(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
    ) -> ApiResult<Vec<(ServiceInfoKind, i64)>> {
        Self::check_account_usable(&actor.account, Timestamp::now())?;
        let (service_id, _) = self.service(service_key)?;
        Self::check_actor_service(actor, service_id)?;
        self.serializer()
            .read(move |tx| {
                let service_info_table = tx.open_table(&service_info::TABLE)?;
                Database::get_all_service_info_tx(service_id, &service_info_table)
            })
            .await
    }
}
