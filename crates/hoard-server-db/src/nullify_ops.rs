//! Authorship erasure on aged rows.

use hoard_core::{AccountId, ServiceHashId, ServiceId, ServiceTagId, Timestamp};
use tracing::info;

use crate::{
    Database, DbResult, LOG_TARGET, WriteTransactionCtx, files_current, files_deleted,
    mappings_current, mappings_deleted, repo_states, tag_parents_current, tag_parents_deleted,
    tag_siblings_current, tag_siblings_deleted,
};

impl Database {
    /// Replace `account_id` with the service's null account on every
    /// current and deleted row committed in `[begin, end]`, all kinds.
    /// Returns the number of rows rewritten.
    pub fn nullify_window_tx(
        tx: &WriteTransactionCtx,
        service_id: ServiceId,
        null_account_id: AccountId,
        begin: Timestamp,
        end: Timestamp,
    ) -> DbResult<u64> {
        let mut rewritten = 0u64;

        macro_rules! nullify_row_table {
            ($table:ident, $lo:expr, $hi:expr) => {{
                let mut table = tx.open_table(&$table::TABLE)?;
                let targets: Vec<_> = table
                    .range($lo..=$hi)?
                    .filter_map(|res| match res {
                        Ok((k, v)) => {
                            let record = v.value();
                            (record.account_id != null_account_id
                                && begin <= record.committed_at
                                && record.committed_at <= end)
                                .then_some(Ok((k.value(), record)))
                        }
                        Err(err) => Some(Err(err)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                for (key, mut record) in targets {
                    record.account_id = null_account_id;
                    table.insert(&key, &record)?;
                    rewritten += 1;
                }
            }};
        }

        nullify_row_table!(
            files_current,
            (service_id, ServiceHashId::ZERO),
            (service_id, ServiceHashId::MAX)
        );
        nullify_row_table!(
            files_deleted,
            (service_id, ServiceHashId::ZERO),
            (service_id, ServiceHashId::MAX)
        );
        nullify_row_table!(
            mappings_current,
            (service_id, ServiceTagId::ZERO, ServiceHashId::ZERO),
            (service_id, ServiceTagId::MAX, ServiceHashId::MAX)
        );
        nullify_row_table!(
            mappings_deleted,
            (service_id, ServiceTagId::ZERO, ServiceHashId::ZERO),
            (service_id, ServiceTagId::MAX, ServiceHashId::MAX)
        );
        nullify_row_table!(
            tag_parents_current,
            (service_id, ServiceTagId::ZERO, ServiceTagId::ZERO),
            (service_id, ServiceTagId::MAX, ServiceTagId::MAX)
        );
        nullify_row_table!(
            tag_parents_deleted,
            (service_id, ServiceTagId::ZERO, ServiceTagId::ZERO),
            (service_id, ServiceTagId::MAX, ServiceTagId::MAX)
        );
        nullify_row_table!(
            tag_siblings_current,
            (service_id, ServiceTagId::ZERO),
            (service_id, ServiceTagId::MAX)
        );
        nullify_row_table!(
            tag_siblings_deleted,
            (service_id, ServiceTagId::ZERO, ServiceTagId::ZERO),
            (service_id, ServiceTagId::MAX, ServiceTagId::MAX)
        );

        info!(
            target: LOG_TARGET,
            %service_id,
            %begin,
            %end,
            rewritten,
            "Nullified account history window"
        );

        Ok(rewritten)
    }

    /// Bump the nullification cursor past one update.
    pub fn advance_nullification_cursor_tx(
        service_id: ServiceId,
        repo_states_table: &mut repo_states::Table,
    ) -> DbResult<u64> {
        let Some(mut state) = repo_states_table.get(&service_id)?.map(|g| g.value()) else {
            return Ok(0);
        };
        state.next_nullification_update_index += 1;
        repo_states_table.insert(&service_id, &state)?;
        Ok(state.next_nullification_update_index)
    }
}
