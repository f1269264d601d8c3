//! The nullification worker.
//!
//! Once an update window is older than the service's nullification period,
//! every row committed in that window loses its author: `account_id` is
//! rewritten to the service's null account. Each cycle is budgeted to an
//! hour, runs under the busy flag, and backs off between windows so
//! foreground work is not starved.

use std::time::{Duration, Instant};

use hoard_core::error::ApiResult;
use hoard_core::{ServiceId, Timestamp};
use hoard_server_db::{Database, ServiceRecord, repo_states, update_metadata};
use hoard_util_error::FmtCompact as _;
use tracing::{debug, info, instrument, warn};

use crate::pubsub::Event;
use crate::{Engine, EngineHandle, EngineRef};

const LOG_TARGET: &str = "hoard::nullifier";

/// Per-cycle wall-clock budget.
const CYCLE_BUDGET: Duration = Duration::from_secs(3600);
/// Longest pause between windows inside one cycle.
const MAX_BACKOFF: Duration = Duration::from_secs(120);

pub struct Nullifier {
    engine: EngineHandle,
}

impl Nullifier {
    pub fn new(engine: &std::sync::Arc<Engine>) -> Self {
        debug!(target: LOG_TARGET, "Starting nullifier");
        Self {
            engine: engine.handle(),
        }
    }

    #[instrument(name = "nullifier", skip(self))]
    pub async fn run(self) {
        let period = {
            let Some(engine) = self.engine.engine_ref() else {
                return;
            };
            Duration::from_secs(engine.config().nullifier_check_period_secs)
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
                if let Err(err) = Self::nullify_service(&engine, service_id, &record).await {
                    warn!(
                        target: LOG_TARGET,
                        %service_id,
                        err = %err.fmt_compact(),
                        "Nullification failed"
                    );
                }
            }
        }
    }

    /// Work through every due window of one service, oldest first.
    pub async fn nullify_service(
        engine: &EngineRef<'_>,
        service_id: ServiceId,
        record: &ServiceRecord,
    ) -> ApiResult<u64> {
        let nullification_period = record.options.clamped_nullification_period();
        let null_account_id = record.null_account_id;
        let cycle_deadline = Instant::now() + CYCLE_BUDGET;
        let mut total_rewritten = 0u64;

        loop {
            let (cursor, next_index, entry) = engine
                .serializer()
                .read(move |tx| {
                    let repo_states_table = tx.open_table(&repo_states::TABLE)?;
                    let update_metadata_table = tx.open_table(&update_metadata::TABLE)?;
                    let cursor = Database::get_repo_state_tx(service_id, &repo_states_table)?
                        .map(|s| s.next_nullification_update_index)
                        .unwrap_or(0);
                    let next_index =
                        Database::next_update_index_tx(service_id, &update_metadata_table)?;
                    let entry = Database::get_update_metadata_entry_tx(
                        service_id,
                        cursor,
                        &update_metadata_table,
                    )?;
                    Ok((cursor, next_index, entry))
                })
                .await?;

            // caught up: everything published so far has been anonymised
            if next_index <= cursor {
                break;
            }
            let Some(entry) = entry else {
                break;
            };

            let now = Timestamp::now();
            if !entry
                .end
                .saturating_add_secs(nullification_period)
                .has_passed(now)
            {
                break;
            }

            // an empty window still advances the cursor
            if entry.update_hashes.is_empty() {
                engine
                    .serializer()
                    .write(move |tx| {
                        let mut repo_states_table = tx.open_table(&repo_states::TABLE)?;
                        Database::advance_nullification_cursor_tx(service_id, &mut repo_states_table)
                    })
                    .await?;
                debug!(
                    target: LOG_TARGET,
                    %service_id,
                    update_index = cursor,
                    "Empty window, nothing to anonymise"
                );
                continue;
            }

            let Ok(_busy) = engine.try_busy() else {
                break;
            };

            let started = Instant::now();
            let (begin, end) = (entry.begin, entry.end);
            let rewritten = engine
                .serializer()
                .write(move |tx| {
                    let rewritten =
                        Database::nullify_window_tx(tx, service_id, null_account_id, begin, end)?;
                    let mut repo_states_table = tx.open_table(&repo_states::TABLE)?;
                    Database::advance_nullification_cursor_tx(service_id, &mut repo_states_table)?;
                    Ok(rewritten)
                })
                .await?;
            let took = started.elapsed();
            total_rewritten += rewritten;

            info!(
                target: LOG_TARGET,
                %service_id,
                update_index = cursor,
                rewritten,
                took_ms = took.as_millis() as u64,
                "Anonymised window"
            );
            engine
                .pubsub()
                .publish(Event::NullificationAdvanced { service_id });

            if cycle_deadline <= Instant::now() {
                break;
            }
            if Duration::from_millis(500) <= took {
                tokio::time::sleep(took.min(MAX_BACKOFF)).await;
            }
        }

        Ok(total_rewritten)
    }
}
