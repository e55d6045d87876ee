use std::future::Future;
use std::sync::Arc;

use crate::app::services::{ServiceError, SqliteRoamingStore};
use crate::domain::session_state::Clock;
use crate::roaming::error::RoamingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub tenant_id: String,
    pub name: String,
    holder: String,
}

#[derive(Clone)]
pub struct LockService {
    store: SqliteRoamingStore,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
}

impl LockService {
    pub fn new(store: SqliteRoamingStore, clock: Arc<dyn Clock>, ttl_secs: u64) -> Self {
        Self {
            store,
            clock,
            ttl_secs,
        }
    }

    // `None` when another holder owns a live lock.
    pub fn acquire(&self, name: &str, tenant_id: &str) -> Result<Option<LockHandle>, ServiceError> {
        let holder = uuid::Uuid::new_v4().to_string();
        let acquired = self.store.try_acquire_lock(
            tenant_id,
            name,
            &holder,
            self.clock.now(),
            self.ttl_secs,
        )?;

        Ok(acquired.then(|| LockHandle {
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            holder,
        }))
    }

    pub fn release(&self, handle: &LockHandle) {
        match self
            .store
            .release_lock(&handle.tenant_id, &handle.name, &handle.holder)
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                tenant = %handle.tenant_id,
                lock = %handle.name,
                "lock was already reclaimed before release"
            ),
            Err(error) => tracing::error!(
                tenant = %handle.tenant_id,
                lock = %handle.name,
                error = %error,
                "failed to release lock"
            ),
        }
    }

    pub async fn run_exclusive<T, F>(
        &self,
        tenant_id: &str,
        name: &str,
        job: F,
    ) -> Result<Option<T>, RoamingError>
    where
        F: Future<Output = Result<T, RoamingError>>,
    {
        let Some(handle) = self.acquire(name, tenant_id)? else {
            tracing::info!(tenant = %tenant_id, lock = %name, "lock busy, skipping run");
            return Ok(None);
        };

        let _guard = ReleaseOnDrop {
            locks: self,
            handle,
        };
        job.await.map(Some)
    }
}

struct ReleaseOnDrop<'a> {
    locks: &'a LockService,
    handle: LockHandle,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.handle);
    }
}
