use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::{DbError, Filter, Page, Paging};
use crate::domain::models::{ChargingStation, Document, RoamingEndpoint, Transaction};

const STATION_SCAN_PAGE_SIZE: u32 = 200;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

#[derive(Clone)]
pub struct SqliteRoamingStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteRoamingStore {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection)
    }

    // Write lock taken up front; commits only when `op` succeeds.
    pub fn atomically<T, E>(
        &self,
        op: impl FnOnce(&Documents<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<ServiceError>,
    {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|error| ServiceError::from(DbError::from(error)))?;

        let value = op(&Documents::new(&transaction))?;

        transaction
            .commit()
            .map_err(|error| ServiceError::from(DbError::from(error)))?;
        Ok(value)
    }

    pub fn find<T: Document>(
        &self,
        tenant_id: &str,
        filter: &Filter,
        paging: Paging,
    ) -> Result<Page<T>, ServiceError> {
        self.with_connection(|connection| {
            Documents::new(connection).find(tenant_id, filter, paging)
        })
    }

    pub fn find_one<T: Document>(
        &self,
        tenant_id: &str,
        filter: &Filter,
    ) -> Result<Option<T>, ServiceError> {
        self.with_connection(|connection| Documents::new(connection).find_one(tenant_id, filter))
    }

    pub fn get<T: Document>(&self, tenant_id: &str, id: &str) -> Result<Option<T>, ServiceError> {
        self.with_connection(|connection| Documents::new(connection).get(tenant_id, id))
    }

    pub fn upsert<T: Document>(&self, tenant_id: &str, document: &T) -> Result<String, ServiceError> {
        self.with_connection(|connection| Documents::new(connection).upsert(tenant_id, document))
    }

    pub fn transaction_by_session_id(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<Transaction>, ServiceError> {
        self.with_connection(|connection| {
            Documents::new(connection).transaction_by_session_id(tenant_id, session_id)
        })
    }

    pub fn station_by_evse(
        &self,
        tenant_id: &str,
        location_id: &str,
        evse_uid: &str,
    ) -> Result<Option<ChargingStation>, ServiceError> {
        self.with_connection(|connection| {
            Documents::new(connection).station_by_evse(tenant_id, location_id, evse_uid)
        })
    }

    pub fn endpoint_by_local_token(
        &self,
        tenant_id: &str,
        local_token: &str,
    ) -> Result<Option<RoamingEndpoint>, ServiceError> {
        self.find_one(tenant_id, &Filter::new().eq("$.local_token", local_token))
    }

    pub fn tenants_with_endpoints(&self) -> Result<Vec<String>, ServiceError> {
        self.with_connection(|connection| {
            Ok(db::list_tenants(connection, RoamingEndpoint::COLLECTION)?)
        })
    }

    pub fn try_acquire_lock(
        &self,
        tenant_id: &str,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: u64,
    ) -> Result<bool, ServiceError> {
        self.with_connection(|connection| {
            Ok(db::try_acquire_lock(connection, tenant_id, name, holder, now, ttl_secs)?)
        })
    }

    pub fn release_lock(
        &self,
        tenant_id: &str,
        name: &str,
        holder: &str,
    ) -> Result<bool, ServiceError> {
        self.with_connection(|connection| {
            Ok(db::release_lock(connection, tenant_id, name, holder)?)
        })
    }
}

pub struct Documents<'c> {
    connection: &'c Connection,
}

impl<'c> Documents<'c> {
    fn new(connection: &'c Connection) -> Self {
        Self { connection }
    }

    pub fn find<T: Document>(
        &self,
        tenant_id: &str,
        filter: &Filter,
        paging: Paging,
    ) -> Result<Page<T>, ServiceError> {
        Ok(db::find_documents(self.connection, tenant_id, filter, paging)?)
    }

    pub fn find_one<T: Document>(
        &self,
        tenant_id: &str,
        filter: &Filter,
    ) -> Result<Option<T>, ServiceError> {
        Ok(db::find_one(self.connection, tenant_id, filter)?)
    }

    pub fn get<T: Document>(&self, tenant_id: &str, id: &str) -> Result<Option<T>, ServiceError> {
        Ok(db::get_document(self.connection, tenant_id, id)?)
    }

    pub fn upsert<T: Document>(&self, tenant_id: &str, document: &T) -> Result<String, ServiceError> {
        Ok(db::upsert_document(self.connection, tenant_id, document, Utc::now())?)
    }

    pub fn transaction_by_session_id(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<Transaction>, ServiceError> {
        self.find_one(
            tenant_id,
            &Filter::new().eq("$.roaming_data.session.id", session_id),
        )
    }

    pub fn station_by_evse(
        &self,
        tenant_id: &str,
        location_id: &str,
        evse_uid: &str,
    ) -> Result<Option<ChargingStation>, ServiceError> {
        let filter = Filter::new().eq("$.location_id", location_id);
        let mut paging = Paging::first(STATION_SCAN_PAGE_SIZE);

        loop {
            let page: Page<ChargingStation> = self.find(tenant_id, &filter, paging)?;
            if page.result.is_empty() {
                return Ok(None);
            }
            if let Some(station) = page
                .result
                .into_iter()
                .find(|station| station.connector_by_evse_uid(evse_uid).is_some())
            {
                return Ok(Some(station));
            }
            paging = paging.next();
        }
    }
}
