use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::app::services::SqliteRoamingStore;
use crate::domain::consumption::{hours_to_secs, kwh_to_wh};
use crate::domain::models::{ChargingStation, Site, Tag, Transaction, TransactionStop};
use crate::domain::ocpi::{
    AuthMethod, Cdr, CdrDimension, ChargingPeriod, SessionStatus, parse_cdr, validate_cdr,
};
use crate::domain::policy::PolicyTable;
use crate::roaming::error::RoamingError;
use crate::roaming::locations::station_to_location;
use crate::domain::session_state::Clock;
use crate::roaming::reconciler::{ConnectorUse, TransactionObserver, update_connector};

pub struct CdrProcessor {
    store: SqliteRoamingStore,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn TransactionObserver>,
}

impl CdrProcessor {
    pub fn new(
        store: SqliteRoamingStore,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn TransactionObserver>,
    ) -> Self {
        Self {
            store,
            clock,
            observer,
        }
    }

    pub fn process_value(&self, tenant_id: &str, payload: &Value) -> Result<Transaction, RoamingError> {
        let cdr = parse_cdr(payload)?;
        self.process(tenant_id, cdr)
    }

    // Reapplying a CDR overwrites the first application.
    pub fn process(&self, tenant_id: &str, cdr: Cdr) -> Result<Transaction, RoamingError> {
        validate_cdr(&cdr)?;

        let (transaction, was_open) = self.store.atomically(|docs| -> Result<_, RoamingError> {
            let mut transaction = docs
                .transaction_by_session_id(tenant_id, &cdr.id)?
                .ok_or_else(|| RoamingError::UnknownSession(cdr.id.clone()))?;

            if transaction.roaming_data.cdr.is_some() {
                tracing::info!(
                    tenant = %tenant_id,
                    session_id = %cdr.id,
                    transaction_id = %transaction.id,
                    "cdr received again, replacing the stored one"
                );
            }

            let total_consumption_wh = kwh_to_wh(cdr.total_energy);
            let was_open = transaction.stop.is_none();

            transaction.stop = Some(TransactionStop {
                meter_stop: transaction.meter_start + total_consumption_wh,
                price: cdr.total_cost,
                rounded_price: (cdr.total_cost * 100.0).round() / 100.0,
                price_unit: cdr.currency.clone(),
                total_consumption_wh,
                total_duration_secs: hours_to_secs(cdr.total_time),
                total_inactivity_secs: cdr.total_parking_time * 3600.0,
                timestamp: cdr.stop_date_time,
                tag_id: transaction.tag_id.clone(),
                user_id: transaction.user_id.clone(),
            });
            transaction.price = cdr.total_cost;
            transaction.rounded_price = (cdr.total_cost * 100.0).round() / 100.0;
            transaction.currency = cdr.currency.clone();
            if let Some(session) = transaction.roaming_data.session.as_mut()
                && session.status != SessionStatus::Invalid
            {
                session.status = SessionStatus::Completed;
            }
            transaction.roaming_data.cdr = Some(cdr);

            docs.upsert(tenant_id, &transaction)?;
            update_connector(
                docs,
                tenant_id,
                &transaction,
                ConnectorUse::Released,
                self.clock.now(),
            )?;
            Ok((transaction, was_open))
        })?;

        tracing::info!(
            tenant = %tenant_id,
            transaction_id = %transaction.id,
            consumption_wh = ?transaction.stop.as_ref().map(|stop| stop.total_consumption_wh),
            price = transaction.price,
            "cdr applied to transaction"
        );

        if was_open {
            self.observer.transaction_stopped(tenant_id, &transaction);
        }
        Ok(transaction)
    }
}

pub fn build_cdr(
    tenant_id: &str,
    transaction: &Transaction,
    station: &ChargingStation,
    site: Option<&Site>,
    tag: &Tag,
    policies: &PolicyTable,
    now: DateTime<Utc>,
) -> Result<Cdr, RoamingError> {
    let stop = transaction.stop.as_ref().ok_or_else(|| {
        RoamingError::InvalidParameters(format!("transaction {} is not stopped", transaction.id))
    })?;

    let mut location = station_to_location(tenant_id, station, site, policies);
    location
        .evses
        .retain(|evse| {
            station
                .connectors
                .iter()
                .any(|connector| {
                    connector.connector_id == transaction.connector_id
                        && connector.evse_uid == evse.uid
                })
        });
    if location.evses.len() != 1 {
        return Err(RoamingError::UnknownLocation {
            location_id: location.id,
            evse_uid: format!("{}*{}", station.id, transaction.connector_id),
        });
    }

    let total_energy = stop.total_consumption_wh / 1000.0;
    let total_time = stop.total_duration_secs as f64 / 3600.0;
    let auth_id = tag
        .ocpi_token
        .as_ref()
        .map(|token| token.auth_id.clone())
        .unwrap_or_else(|| tag.id.clone());

    Ok(Cdr {
        id: transaction
            .session_id()
            .unwrap_or(transaction.id.as_str())
            .to_string(),
        start_date_time: transaction.timestamp,
        stop_date_time: stop.timestamp,
        auth_id,
        auth_method: AuthMethod::AuthRequest,
        location,
        meter_id: None,
        currency: transaction.currency.clone(),
        charging_periods: vec![ChargingPeriod {
            start_date_time: transaction.timestamp,
            dimensions: vec![
                CdrDimension {
                    dimension_type: "ENERGY".to_string(),
                    volume: total_energy,
                },
                CdrDimension {
                    dimension_type: "TIME".to_string(),
                    volume: total_time,
                },
            ],
        }],
        total_cost: stop.rounded_price,
        total_energy,
        total_time,
        total_parking_time: stop.total_inactivity_secs / 3600.0,
        remark: None,
        last_updated: now,
    })
}
