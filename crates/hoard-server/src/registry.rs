//! In-memory service registry.
//!
//! The boot path loads every service row; afterwards reads are lock-cheap
//! clones of immutable `Arc<ServiceRecord>`s. A mutation swaps the record
//! wholesale and marks the service dirty; a periodic job persists dirty
//! records through the serializer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use hoard_core::ServiceId;
use hoard_core::error::{ApiError, ApiResult};
use hoard_core::id::ServiceKey;
use hoard_server_db::{Database, ServiceRecord, services};
use tracing::debug;

use crate::serializer::Serializer;

const LOG_TARGET: &str = "hoard::registry";

#[derive(Default)]
struct RegistryInner {
    services: HashMap<ServiceId, Arc<ServiceRecord>>,
    by_key: HashMap<ServiceKey, ServiceId>,
    dirty: HashSet<ServiceId>,
}

pub struct ServiceRegistry {
    inner: Mutex<RegistryInner>,
}

impl ServiceRegistry {
    pub async fn load(serializer: &Serializer) -> ApiResult<Self> {
        let rows = serializer
            .read(|tx| {
                let services_table = tx.open_table(&services::TABLE)?;
                Database::list_services_tx(&services_table)
            })
            .await?;

        let mut inner = RegistryInner::default();
        for (service_id, record) in rows {
            inner.by_key.insert(record.key, service_id);
            inner.services.insert(service_id, Arc::new(record));
        }
        debug!(target: LOG_TARGET, count = inner.services.len(), "Loaded services");

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    pub fn get(&self, service_id: ServiceId) -> ApiResult<Arc<ServiceRecord>> {
        self.inner
            .lock()
            .expect("Locking failed")
            .services
            .get(&service_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("unknown service"))
    }

    pub fn resolve_key(&self, key: ServiceKey) -> ApiResult<ServiceId> {
        self.inner
            .lock()
            .expect("Locking failed")
            .by_key
            .get(&key)
            .copied()
            .ok_or_else(|| ApiError::not_found("unknown service"))
    }

    pub fn list(&self) -> Vec<(ServiceId, Arc<ServiceRecord>)> {
        self.inner
            .lock()
            .expect("Locking failed")
            .services
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    /// Register a freshly created (already persisted) service.
    pub fn insert(&self, service_id: ServiceId, record: ServiceRecord) {
        let mut inner = self.inner.lock().expect("Locking failed");
        inner.by_key.insert(record.key, service_id);
        inner.services.insert(service_id, Arc::new(record));
    }

    /// Replace a service's record in memory and mark it dirty.
    pub fn update(
        &self,
        service_id: ServiceId,
        f: impl FnOnce(&mut ServiceRecord),
    ) -> ApiResult<Arc<ServiceRecord>> {
        let mut inner = self.inner.lock().expect("Locking failed");
        let current = inner
            .services
            .get(&service_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("unknown service"))?;
        let mut record = (*current).clone();
        f(&mut record);
        let record = Arc::new(record);
        inner.services.insert(service_id, record.clone());
        inner.dirty.insert(service_id);
        Ok(record)
    }

    /// Persist every dirty record. Records dirtied while the write is in
    /// flight stay dirty for the next flush.
    pub async fn flush_dirty(&self, serializer: &Serializer) -> ApiResult<usize> {
        let to_flush: Vec<(ServiceId, Arc<ServiceRecord>)> = {
            let mut inner = self.inner.lock().expect("Locking failed");
            let ids: Vec<ServiceId> = inner.dirty.drain().collect();
            ids.into_iter()
                .filter_map(|id| inner.services.get(&id).map(|r| (id, r.clone())))
                .collect()
        };

        if to_flush.is_empty() {
            return Ok(0);
        }

        let count = to_flush.len();
        serializer
            .write(move |tx| {
                let mut services_table = tx.open_table(&services::TABLE)?;
                for (service_id, record) in &to_flush {
                    Database::persist_service_tx(*service_id, record, &mut services_table)?;
                }
                Ok(())
            })
            .await?;

        debug!(target: LOG_TARGET, count, "Flushed dirty services");
        Ok(count)
    }
}
