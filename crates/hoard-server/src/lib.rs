mod accounts;
pub mod blob;
mod config;
mod files;
mod ingest;
mod petitions;
pub mod pubsub;
pub mod registry;
pub mod scheduler;
mod serializer;
pub mod session;
pub mod task;
#[cfg(test)]
mod tests;

use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;
use std::{io, ops};

use hoard_core::Timestamp;
use hoard_core::account::{AccountView, ContentScope, PermissionLevel};
use hoard_core::error::{ApiError, ApiResult};
use hoard_core::id::{AccessKey, ServiceKey, SessionKey};
use hoard_core::service::{ServiceKind, ServiceOptions};
use hoard_core::{AccountId, ServiceId};
use hoard_server_db::{Database, DbError, account_bandwidth, account_ids};
use snafu::{ResultExt as _, Snafu};
use tokio::sync::Semaphore;
use tracing::{debug, info};

pub use crate::blob::{BlobError, BlobKind, BlobStore};
pub use crate::config::EngineConfig;
use crate::pubsub::PubSub;
use crate::registry::ServiceRegistry;
use crate::scheduler::{MAX_WORKERS, Scheduler};
pub use crate::serializer::Serializer;
use crate::session::SessionManager;

const LOG_TARGET: &str = "hoard::server";

/// The admin service every fresh install boots with.
const BOOTSTRAP_ADMIN_NAME: &str = "server admin";
const BOOTSTRAP_ADMIN_PORT: u16 = 45870;

#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("Database initialization error"))]
    InitDb { source: DbError },
    #[snafu(display("Blob store initialization error"))]
    InitBlobs { source: BlobError },
    #[snafu(display("Engine bootstrap error"))]
    Bootstrap { source: ApiError },
    #[snafu(display("Io error"))]
    Io { source: io::Error },
}
pub type InitResult<T> = std::result::Result<T, InitError>;

/// Weak handle to [`Engine`], safe for long-lived workers to hold.
#[derive(Clone)]
pub struct EngineHandle(Weak<Engine>);

impl EngineHandle {
    pub fn engine_ref(&self) -> Option<EngineRef<'_>> {
        let engine = self.0.upgrade()?;
        Some(EngineRef {
            engine,
            r: PhantomData,
        })
    }
}

impl From<Weak<Engine>> for EngineHandle {
    fn from(value: Weak<Engine>) -> Self {
        Self(value)
    }
}

/// A strong reference to [`Engine`].
///
/// Carries a phantom lifetime to discourage storing it anywhere; workers
/// should hold an [`EngineHandle`] and upgrade per iteration so shutdown
/// can proceed.
#[derive(Clone)]
pub struct EngineRef<'r> {
    engine: Arc<Engine>,
    r: PhantomData<&'r ()>,
}

impl ops::Deref for EngineRef<'_> {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Credentials first issued when a fresh install provisions its admin
/// service; surfaced exactly once by the CLI.
#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    pub service_key: ServiceKey,
    pub access_key: AccessKey,
}

/// The repository engine: every component of the server behind one value.
///
/// Lifecycle: [`Engine::start`] → serve → [`Engine::shutdown`]. There is no
/// ambient global; anything that needs the engine is handed an
/// [`EngineHandle`].
pub struct Engine {
    handle: EngineHandle,
    config: EngineConfig,

    serializer: Serializer,
    blobs: BlobStore,
    registry: ServiceRegistry,
    sessions: SessionManager,
    pubsub: PubSub,

    fast_scheduler: Scheduler,
    slow_scheduler: Scheduler,

    /// Held by heavy maintenance (bundler, nullifier, delete-all, backup).
    /// Never waited on: a busy conflict surfaces as [`ApiError::Busy`].
    server_busy: Arc<tokio::sync::Mutex<()>>,

    bootstrap_admin: Option<BootstrapAdmin>,
}

impl Engine {
    pub async fn start(config: EngineConfig) -> InitResult<Arc<Self>> {
        tokio::fs::create_dir_all(&config.db_dir)
            .await
            .context(IoSnafu)?;

        let db_path = Database::mk_db_path(&config.db_dir).await.context(IoSnafu)?;
        let db = Database::open(db_path).await.context(InitDbSnafu)?;
        let serializer = Serializer::start(
            db,
            Duration::from_secs(config.db_maintenance_period_secs),
        );

        let blobs = BlobStore::open(config.db_dir.join("server_files"))
            .await
            .context(InitBlobsSnafu)?;

        let registry = ServiceRegistry::load(&serializer)
            .await
            .context(BootstrapSnafu)?;

        // a fresh install gets its admin service; the access key is
        // surfaced exactly once
        let bootstrap_admin = if registry.list().is_empty() {
            let service_key = ServiceKey::generate();
            let now = Timestamp::now();
            let provisioned = serializer
                .write(move |tx| {
                    Database::create_service_tx(
                        tx,
                        service_key,
                        ServiceKind::Admin,
                        BOOTSTRAP_ADMIN_NAME,
                        BOOTSTRAP_ADMIN_PORT,
                        ServiceOptions::default(),
                        now,
                    )
                })
                .await
                .context(BootstrapSnafu)?;
            let record = serializer
                .read(move |tx| {
                    let services_table = tx.open_table(&hoard_server_db::services::TABLE)?;
                    Database::get_service_tx(provisioned.service_id, &services_table)
                })
                .await
                .context(BootstrapSnafu)?
                .expect("Just created");
            registry.insert(provisioned.service_id, record);
            info!(
                target: LOG_TARGET,
                service_key = %service_key,
                "Provisioned bootstrap admin service"
            );
            Some(BootstrapAdmin {
                service_key,
                access_key: provisioned.admin_access_key,
            })
        } else {
            None
        };

        let sessions = SessionManager::load(&serializer, config.session_ttl_secs)
            .await
            .context(BootstrapSnafu)?;

        let workers = Arc::new(Semaphore::new(MAX_WORKERS));
        let fast_scheduler = Scheduler::spawn("fast", workers.clone());
        let slow_scheduler = Scheduler::spawn("slow", workers);

        let engine = Arc::new_cyclic(|weak: &Weak<Engine>| Engine {
            handle: weak.clone().into(),
            config,
            serializer,
            blobs,
            registry,
            sessions,
            pubsub: PubSub::new(),
            fast_scheduler,
            slow_scheduler,
            server_busy: Arc::new(tokio::sync::Mutex::new(())),
            bootstrap_admin,
        });

        if engine.config.start_workers {
            engine.start_workers();
        }

        debug!(target: LOG_TARGET, "Engine started");
        Ok(engine)
    }

    fn start_workers(self: &Arc<Self>) {
        tokio::spawn(task::bundler::Bundler::new(self).run());
        tokio::spawn(task::nullifier::Nullifier::new(self).run());
        tokio::spawn(task::deferred_delete::DeferredDeleter::new(self).run());

        let handle = self.handle.clone();
        self.slow_scheduler.add_job(
            "registry-flush",
            Duration::from_secs(self.config.registry_flush_period_secs),
            Some(Duration::from_secs(self.config.registry_flush_period_secs)),
            move || {
                let handle = handle.clone();
                async move {
                    if let Some(engine) = handle.engine_ref() {
                        let _ = engine.registry.flush_dirty(&engine.serializer).await;
                    }
                }
            },
        );

        let handle = self.handle.clone();
        self.slow_scheduler.add_job(
            "session-prune",
            Duration::from_secs(60),
            Some(Duration::from_secs(60)),
            move || {
                let handle = handle.clone();
                async move {
                    if let Some(engine) = handle.engine_ref() {
                        engine.sessions.prune_expired(Timestamp::now());
                    }
                }
            },
        );
    }

    /// Deterministic teardown: stop schedulers, drain the serializer, then
    /// stop it. Workers holding only an [`EngineHandle`] die on their next
    /// upgrade attempt.
    pub async fn shutdown(&self) {
        debug!(target: LOG_TARGET, "Engine shutting down");
        self.fast_scheduler.shutdown();
        self.slow_scheduler.shutdown();
        let _ = self.registry.flush_dirty(&self.serializer).await;
        let _ = self.serializer.force_commit().await;
        self.serializer.shutdown();
    }

    pub(crate) fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The first-boot admin credentials, if this process created them.
    pub fn bootstrap_admin(&self) -> Option<&BootstrapAdmin> {
        self.bootstrap_admin.as_ref()
    }

    /// Wake a scheduled job whenever a matching event is published, so a
    /// repeating job can react immediately to manual triggers instead of
    /// waiting out its period.
    pub fn wake_on_event(
        &self,
        handle: scheduler::JobHandle,
        filter: impl Fn(&pubsub::Event) -> bool + Send + 'static,
    ) {
        let mut rx = self.pubsub.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if filter(&event) {
                    handle.wake();
                }
            }
        });
    }

    /// Acquire the process-wide busy flag, or fail with `busy`.
    pub(crate) fn try_busy(&self) -> ApiResult<tokio::sync::OwnedMutexGuard<()>> {
        self.server_busy
            .clone()
            .try_lock_owned()
            .map_err(|_| ApiError::Busy)
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Begin a session for an access key.
    pub async fn begin_session(
        &self,
        service_key: ServiceKey,
        access_key: AccessKey,
    ) -> ApiResult<(SessionKey, Timestamp)> {
        let service_id = self.registry.resolve_key(service_key)?;
        self.sessions
            .begin_session(&self.serializer, service_id, access_key)
            .await
    }

    /// Resolve a session cookie to an acting account.
    pub fn actor_for_session(
        &self,
        service_key: ServiceKey,
        session_key: SessionKey,
    ) -> ApiResult<Actor> {
        let service_id = self.registry.resolve_key(service_key)?;
        let session =
            self.sessions
                .account_for_session(service_id, session_key, Timestamp::now())?;
        Ok(Actor {
            service_id,
            account_id: session.account_id,
            account: session.account,
        })
    }

    /// Resolve a raw access key (header auth, no session) to an acting
    /// account, materializing the account on first use.
    pub async fn actor_for_access_key(
        &self,
        service_key: ServiceKey,
        access_key: AccessKey,
    ) -> ApiResult<Actor> {
        let service_id = self.registry.resolve_key(service_key)?;
        let now = Timestamp::now();
        let (account_id, account) = self
            .serializer
            .write(move |tx| {
                let account_key = Database::resolve_access_key_tx(tx, service_id, access_key, now)?;
                let account_id = {
                    let account_ids_table = tx.open_table(&account_ids::TABLE)?;
                    Database::get_account_id_tx(service_id, account_key, &account_ids_table)?
                        .ok_or_else(|| ApiError::internal("account vanished"))?
                };
                let account = Database::account_view_tx(tx, service_id, account_id, now)?;
                Ok((account_id, account))
            })
            .await?;
        Ok(Actor {
            service_id,
            account_id,
            account,
        })
    }

    // ========================================================================
    // Permission & bandwidth checks
    // ========================================================================

    /// Credentials are per-service; an actor may only address the service
    /// that issued its account.
    pub(crate) fn check_actor_service(actor: &Actor, service_id: ServiceId) -> ApiResult<()> {
        if actor.service_id != service_id {
            return Err(ApiError::unauthorized(
                "credentials are for a different service",
            ));
        }
        Ok(())
    }

    /// Ban and expiry gate; admins pass everything past this.
    pub(crate) fn check_account_usable(account: &AccountView, now: Timestamp) -> ApiResult<()> {
        if account.is_banned(now) {
            return Err(ApiError::unauthorized("this account is banned"));
        }
        if account.is_expired(now) {
            return Err(ApiError::unauthorized("this account has expired"));
        }
        Ok(())
    }

    pub(crate) fn check_permission(
        actor: &Actor,
        scope: ContentScope,
        level: PermissionLevel,
        now: Timestamp,
    ) -> ApiResult<()> {
        Self::check_account_usable(&actor.account, now)?;
        if actor.account.is_admin() {
            return Ok(());
        }
        if !actor.account.account_type.has_permission(scope, level) {
            return Err(ApiError::forbidden("you do not have permission to do that"));
        }
        Ok(())
    }

    /// Enforce the account type's bandwidth rules, then record the usage.
    /// One write job, so check and report cannot interleave with another
    /// request for the same account.
    pub(crate) async fn consume_bandwidth(&self, actor: &Actor, bytes: u64) -> ApiResult<()> {
        let rules = actor.account.account_type.bandwidth_rules.clone();
        let service_id = actor.service_id;
        let account_id = actor.account_id;
        let is_admin = actor.account.is_admin();
        let now = Timestamp::now();
        self.serializer
            .write(move |tx| {
                if !is_admin {
                    let tracker = {
                        let account_bandwidth_table = tx.open_table(&account_bandwidth::TABLE)?;
                        Database::get_account_bandwidth_tx(
                            service_id,
                            account_id,
                            &account_bandwidth_table,
                        )?
                    };
                    if !rules.can_start_request(&tracker, now) {
                        return Err(ApiError::BandwidthExceeded.into());
                    }
                }
                Database::report_account_bandwidth_tx(tx, service_id, account_id, bytes, now)?;
                Ok(())
            })
            .await
    }

    // ========================================================================
    // Admin locks & maintenance
    // ========================================================================

    /// Quiesce the database for an external snapshot.
    pub async fn lock_on(&self, actor: &Actor) -> ApiResult<()> {
        Self::require_admin(actor)?;
        self.serializer.force_commit().await?;
        self.serializer.pause_and_disconnect(true).await
    }

    pub async fn lock_off(&self, actor: &Actor) -> ApiResult<()> {
        Self::require_admin(actor)?;
        self.serializer.pause_and_disconnect(false).await
    }

    pub(crate) fn require_admin(actor: &Actor) -> ApiResult<()> {
        Self::check_account_usable(&actor.account, Timestamp::now())?;
        if !actor.account.is_admin() {
            return Err(ApiError::forbidden("administrators only"));
        }
        Ok(())
    }

    /// Rebuild the precomputed totals of a service from its row tables.
    pub async fn regenerate_service_info(
        &self,
        actor: &Actor,
        service_key: ServiceKey,
    ) -> ApiResult<()> {
        Self::require_admin(actor)?;
        let service_id = self.registry.resolve_key(service_key)?;
        self.serializer
            .write(move |tx| Database::regenerate_service_info_tx(tx, service_id))
            .await
    }
}

/// An authenticated account acting on one service.
#[derive(Debug, Clone)]
pub struct Actor {
    pub service_id: ServiceId,
    pub account_id: AccountId,
    pub account: AccountView,
}
