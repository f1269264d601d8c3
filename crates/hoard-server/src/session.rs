//! Session manager: a cache of session-key → account bindings over the
//! persisted `sessions` table.
//!
//! Sessions are authoritative in the database (so a restart keeps clients
//! logged in) but every lookup is served from memory. Any account mutation
//! publishes a refresh, which re-reads the affected account views from
//! storage; the cache is rebuilt, never patched field by field.

use std::collections::HashMap;
use std::sync::Mutex;

use hoard_core::account::AccountView;
use hoard_core::error::{ApiError, ApiResult};
use hoard_core::id::{AccessKey, AccountKey, SessionKey};
use hoard_core::{AccountId, ServiceId, Timestamp};
use hoard_server_db::{Database, SessionRecord, account_ids, sessions};
use tracing::debug;

use crate::serializer::Serializer;

const LOG_TARGET: &str = "hoard::session";

#[derive(Debug, Clone)]
pub struct Session {
    pub account_id: AccountId,
    pub account: AccountView,
    pub expires_at: Timestamp,
}

pub struct SessionManager {
    ttl_secs: u64,
    cache: Mutex<HashMap<(ServiceId, SessionKey), Session>>,
}

impl SessionManager {
    /// Rehydrate the cache from the sessions table, dropping expired rows.
    pub async fn load(serializer: &Serializer, ttl_secs: u64) -> ApiResult<Self> {
        let now = Timestamp::now();
        let loaded = serializer
            .write(move |tx| {
                let live = {
                    let mut sessions_table = tx.open_table(&sessions::TABLE)?;
                    Database::load_sessions_tx(now, &mut sessions_table)?
                };
                let mut out = vec![];
                for (service_id, session_key, record) in live {
                    let Some(account_id) = ({
                        let account_ids_table = tx.open_table(&account_ids::TABLE)?;
                        Database::get_account_id_tx(
                            service_id,
                            record.account_key,
                            &account_ids_table,
                        )?
                    }) else {
                        continue;
                    };
                    let account = Database::account_view_tx(tx, service_id, account_id, now)?;
                    out.push((
                        service_id,
                        session_key,
                        Session {
                            account_id,
                            account,
                            expires_at: record.expires_at,
                        },
                    ));
                }
                Ok(out)
            })
            .await?;

        let mut cache = HashMap::new();
        for (service_id, session_key, session) in loaded {
            cache.insert((service_id, session_key), session);
        }
        debug!(target: LOG_TARGET, count = cache.len(), "Rehydrated sessions");

        Ok(Self {
            ttl_secs,
            cache: Mutex::new(cache),
        })
    }

    /// Exchange an access key for a fresh session.
    pub async fn begin_session(
        &self,
        serializer: &Serializer,
        service_id: ServiceId,
        access_key: AccessKey,
    ) -> ApiResult<(SessionKey, Timestamp)> {
        let now = Timestamp::now();
        let expires_at = now.saturating_add_secs(self.ttl_secs);
        let session_key = SessionKey::generate();

        let (account_id, account) = serializer
            .write(move |tx| {
                let account_key = Database::resolve_access_key_tx(tx, service_id, access_key, now)?;
                let account_id = {
                    let account_ids_table = tx.open_table(&account_ids::TABLE)?;
                    Database::get_account_id_tx(service_id, account_key, &account_ids_table)?
                        .ok_or_else(|| ApiError::internal("account vanished during login"))?
                };
                let account = Database::account_view_tx(tx, service_id, account_id, now)?;
                {
                    let mut sessions_table = tx.open_table(&sessions::TABLE)?;
                    Database::insert_session_tx(
                        service_id,
                        session_key,
                        &SessionRecord {
                            account_key,
                            expires_at,
                        },
                        &mut sessions_table,
                    )?;
                }
                Ok((account_id, account))
            })
            .await?;

        self.cache.lock().expect("Locking failed").insert(
            (service_id, session_key),
            Session {
                account_id,
                account,
                expires_at,
            },
        );

        Ok((session_key, expires_at))
    }

    /// The account bound to a session, or `unauthorized` when the session
    /// is unknown or expired.
    pub fn account_for_session(
        &self,
        service_id: ServiceId,
        session_key: SessionKey,
        now: Timestamp,
    ) -> ApiResult<Session> {
        let mut cache = self.cache.lock().expect("Locking failed");
        let Some(session) = cache.get(&(service_id, session_key)) else {
            return Err(ApiError::unauthorized("unknown session"));
        };
        if session.expires_at.has_passed(now) {
            cache.remove(&(service_id, session_key));
            return Err(ApiError::unauthorized("session expired"));
        }
        Ok(session.clone())
    }

    /// Re-read fresh state for every session bound to one of `account_keys`.
    pub async fn refresh_accounts(
        &self,
        serializer: &Serializer,
        service_id: ServiceId,
        account_keys: &[AccountKey],
    ) -> ApiResult<()> {
        let now = Timestamp::now();
        let keys: Vec<AccountKey> = account_keys.to_vec();
        let views = serializer
            .write(move |tx| {
                let mut out = vec![];
                for account_key in keys {
                    let Some(account_id) = ({
                        let account_ids_table = tx.open_table(&account_ids::TABLE)?;
                        Database::get_account_id_tx(service_id, account_key, &account_ids_table)?
                    }) else {
                        continue;
                    };
                    let account = Database::account_view_tx(tx, service_id, account_id, now)?;
                    out.push((account_key, account_id, account));
                }
                Ok(out)
            })
            .await?;

        let mut cache = self.cache.lock().expect("Locking failed");
        for session in cache.values_mut() {
            for (account_key, account_id, account) in &views {
                if session.account.key == *account_key {
                    session.account_id = *account_id;
                    session.account = account.clone();
                }
            }
        }
        Ok(())
    }

    /// Bulk reload of every session of a service; used after account-type
    /// changes, which can affect any account.
    pub async fn refresh_all(&self, serializer: &Serializer, service_id: ServiceId) -> ApiResult<()> {
        let account_keys: Vec<AccountKey> = {
            let cache = self.cache.lock().expect("Locking failed");
            cache
                .iter()
                .filter(|((sid, _), _)| *sid == service_id)
                .map(|(_, session)| session.account.key)
                .collect()
        };
        self.refresh_accounts(serializer, service_id, &account_keys)
            .await
    }

    /// Drop expired sessions from the cache.
    pub fn prune_expired(&self, now: Timestamp) {
        self.cache
            .lock()
            .expect("Locking failed")
            .retain(|_, session| !session.expires_at.has_passed(now));
    }
}
