//! Persisted session rows; the in-memory session manager's backing store.

use hoard_core::id::SessionKey;
use hoard_core::{ServiceId, Timestamp};

use crate::{Database, DbResult, SessionRecord, sessions};

impl Database {
    pub fn insert_session_tx(
        service_id: ServiceId,
        session_key: SessionKey,
        record: &SessionRecord,
        sessions_table: &mut sessions::Table,
    ) -> DbResult<()> {
        sessions_table.insert(&(service_id, session_key), record)?;
        Ok(())
    }

    pub fn get_session_tx(
        service_id: ServiceId,
        session_key: SessionKey,
        sessions_table: &impl sessions::ReadableTable,
    ) -> DbResult<Option<SessionRecord>> {
        Ok(sessions_table
            .get(&(service_id, session_key))?
            .map(|g| g.value()))
    }

    pub fn remove_session_tx(
        service_id: ServiceId,
        session_key: SessionKey,
        sessions_table: &mut sessions::Table,
    ) -> DbResult<bool> {
        Ok(sessions_table.remove(&(service_id, session_key))?.is_some())
    }

    /// All live sessions, dropping expired rows as they are encountered.
    pub fn load_sessions_tx(
        now: Timestamp,
        sessions_table: &mut sessions::Table,
    ) -> DbResult<Vec<(ServiceId, SessionKey, SessionRecord)>> {
        let all: Vec<((ServiceId, SessionKey), SessionRecord)> = sessions_table
            .range(..)?
            .map(|res| res.map(|(k, v)| (k.value(), v.value())))
            .collect::<Result<Vec<_>, _>>()?;

        let mut live = Vec::with_capacity(all.len());
        for ((service_id, session_key), record) in all {
            if record.expires_at.has_passed(now) {
                sessions_table.remove(&(service_id, session_key))?;
            } else {
                live.push((service_id, session_key, record));
            }
        }
        Ok(live)
    }
}
