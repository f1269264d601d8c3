//! The update bundler worker.
//!
//! Wakes on a fixed cadence, and for every repository service whose
//! `next_update_due` has passed, cuts the due window(s): build bundles,
//! write the blobs, then register the window in the update index. Blob
//! writes happen before registration, so the index never references bytes
//! that are not on disk.

use std::time::Duration;

use hoard_core::error::ApiResult;
use hoard_core::id::UpdateHash;
use hoard_core::{ServiceId, Timestamp};
use hoard_server_db::{Database, ServiceRecord, repo_states, update_metadata};
use hoard_util_error::FmtCompact as _;
use tracing::{debug, info, instrument, warn};

use crate::pubsub::Event;
use crate::{Engine, EngineHandle, EngineRef};

const LOG_TARGET: &str = "hoard::bundler";

pub struct Bundler {
    engine: EngineHandle,
}

impl Bundler {
    pub fn new(engine: &std::sync::Arc<Engine>) -> Self {
        debug!(target: LOG_TARGET, "Starting bundler");
        Self {
            engine: engine.handle(),
        }
    }

    #[instrument(name = "bundler", skip(self))]
    pub async fn run(self) {
        let period = {
            let Some(engine) = self.engine.engine_ref() else {
                return;
            };
            Duration::from_secs(engine.config().bundler_check_period_secs)
        };
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let Some(engine) = self.engine.engine_ref() else {
                break;
            };

            for (service_id, record) in engine.registry().list() {
                if !record.kind.is_repository() {
                    continue;
                }
                if let Err(err) = Self::sync_service(&engine, service_id, &record).await {
                    warn!(
                        target: LOG_TARGET,
                        %service_id,
                        err = %err.fmt_compact(),
                        "Update sync failed"
                    );
                }
            }
        }
    }

    /// Cut every due window for one service. Skips quietly when the busy
    /// flag is held by other maintenance.
    pub async fn sync_service(
        engine: &EngineRef<'_>,
        service_id: ServiceId,
        record: &ServiceRecord,
    ) -> ApiResult<bool> {
        let now = Timestamp::now();
        let due = Self::next_due(engine, service_id).await?;
        if !due.has_passed(now) {
            return Ok(false);
        }

        let Ok(_busy) = engine.try_busy() else {
            return Ok(false);
        };

        let update_period = record.options.clamped_update_period();
        let mut created_any = false;
        loop {
            let now = Timestamp::now();
            let due = Self::next_due(engine, service_id).await?;
            if !due.has_passed(now) {
                break;
            }

            // the window is (last end, last end + period], seeded backwards
            // from the due time on a virgin service
            let begin = engine
                .serializer()
                .read(move |tx| {
                    let update_metadata_table = tx.open_table(&update_metadata::TABLE)?;
                    Database::next_update_begin_tx(service_id, &update_metadata_table)
                })
                .await?
                .unwrap_or_else(|| due.saturating_sub_secs(update_period));
            let end = begin.saturating_add_secs(update_period);

            let bundles = engine
                .serializer()
                .read(move |tx| Database::build_update_tx(tx, service_id, begin, end))
                .await?;

            let mut hashes: Vec<UpdateHash> = Vec::with_capacity(bundles.len());
            for bundle in &bundles {
                let bytes = bundle.to_bytes();
                let hash = UpdateHash::digest_of(&bytes);
                engine
                    .blobs()
                    .put_update(hash, &bytes)
                    .await
                    .map_err(|err| {
                        hoard_core::error::ApiError::internal(format!(
                            "update blob write failed: {err}"
                        ))
                    })?;
                hashes.push(hash);
            }

            let index = engine
                .serializer()
                .write(move |tx| {
                    Database::register_update_tx(tx, service_id, &hashes, begin, end, update_period)
                })
                .await?;

            info!(
                target: LOG_TARGET,
                %service_id,
                update_index = index,
                bundles = bundles.len(),
                "Created update"
            );
            created_any = true;
        }

        if created_any {
            engine.pubsub().publish(Event::UpdateCreated { service_id });
        }
        Ok(created_any)
    }

    async fn next_due(engine: &EngineRef<'_>, service_id: ServiceId) -> ApiResult<Timestamp> {
        Ok(engine
            .serializer()
            .read(move |tx| {
                let repo_states_table = tx.open_table(&repo_states::TABLE)?;
                Database::get_repo_state_tx(service_id, &repo_states_table)
            })
            .await?
            .map(|state| state.next_update_due)
            .unwrap_or(Timestamp::MAX))
    }
}
