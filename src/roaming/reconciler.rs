use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::app::services::{Documents, SqliteRoamingStore};
use crate::domain::consumption::{compute_consumption_delta, kwh_to_wh, round_secs_between};
use crate::domain::models::{
    ChargingStation, Consumption, ConnectorStatus, LastConsumption, RoamingData, Tag, Transaction,
    TransactionStop, User,
};
use crate::domain::ocpi::{Session, SessionStatus, parse_session, validate_session};
use crate::domain::session_state::{
    Clock, consume_remote_authorization, is_terminal, transition,
};
use crate::roaming::error::RoamingError;

pub trait TransactionObserver: Send + Sync {
    fn transaction_stopped(&self, tenant_id: &str, transaction: &Transaction);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl TransactionObserver for LoggingObserver {
    fn transaction_stopped(&self, tenant_id: &str, transaction: &Transaction) {
        if let Some(stop) = &transaction.stop {
            tracing::info!(
                tenant = %tenant_id,
                transaction_id = %transaction.id,
                charge_box_id = %transaction.charge_box_id,
                consumption_wh = stop.total_consumption_wh,
                duration_secs = stop.total_duration_secs,
                price = stop.price,
                "roaming transaction stopped"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Stopped,
    SkippedFinalized,
    SkippedOutOfOrder,
    SkippedInvalidTransition,
}

pub struct SessionReconciler {
    store: SqliteRoamingStore,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn TransactionObserver>,
}

impl SessionReconciler {
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

    pub fn reconcile_value(
        &self,
        tenant_id: &str,
        payload: &Value,
    ) -> Result<ReconcileOutcome, RoamingError> {
        let session = parse_session(payload)?;
        self.reconcile(tenant_id, session)
    }

    pub fn reconcile(
        &self,
        tenant_id: &str,
        session: Session,
    ) -> Result<ReconcileOutcome, RoamingError> {
        validate_session(&session)?;

        let (outcome, transaction) = self.store.atomically(|docs| -> Result<_, RoamingError> {
            match docs.transaction_by_session_id(tenant_id, &session.id)? {
                Some(existing) => self.update_existing(docs, tenant_id, existing, session),
                None => self.create(docs, tenant_id, session),
            }
        })?;

        if outcome == ReconcileOutcome::Stopped {
            self.observer.transaction_stopped(tenant_id, &transaction);
        }
        Ok(outcome)
    }

    fn create(
        &self,
        docs: &Documents<'_>,
        tenant_id: &str,
        session: Session,
    ) -> Result<(ReconcileOutcome, Transaction), RoamingError> {
        let location_id = session.location.id.clone();
        let evse_uid = session
            .location
            .single_evse()
            .map(|evse| evse.uid.clone())
            .unwrap_or_default();

        let unknown_location = || RoamingError::UnknownLocation {
            location_id: location_id.clone(),
            evse_uid: evse_uid.clone(),
        };
        let mut station = docs
            .station_by_evse(tenant_id, &location_id, &evse_uid)?
            .ok_or_else(unknown_location)?;
        let connector_id = station
            .connector_by_evse_uid(&evse_uid)
            .map(|connector| connector.connector_id)
            .ok_or_else(unknown_location)?;

        let tag: Tag = docs
            .get(tenant_id, &session.auth_id)?
            .ok_or_else(|| RoamingError::UnknownTag(session.auth_id.clone()))?;
        let user_id = tag
            .user_id
            .clone()
            .ok_or_else(|| RoamingError::UnknownUser(format!("no user on tag {}", tag.id)))?;
        let user: User = docs
            .get(tenant_id, &user_id)?
            .ok_or(RoamingError::UnknownUser(user_id))?;

        if consume_remote_authorization(&mut station, connector_id, &tag.id, self.clock.now()) {
            docs.upsert(tenant_id, &station)?;
            tracing::info!(
                tenant = %tenant_id,
                station_id = %station.id,
                connector_id,
                tag_id = %tag.id,
                "remote authorization consumed by opened session"
            );
        }

        let transaction = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            issuer: false,
            charge_box_id: station.id.clone(),
            connector_id,
            site_id: station.site_id.clone(),
            site_area_id: station.site_area_id.clone(),
            tag_id: tag.id,
            user_id: user.id,
            timestamp: session.start_datetime,
            meter_start: 0.0,
            currency: session.currency.clone(),
            price: 0.0,
            rounded_price: 0.0,
            last_consumption: LastConsumption {
                value: 0.0,
                timestamp: session.start_datetime,
            },
            current_instant_watts: 0.0,
            current_total_consumption_wh: 0.0,
            current_total_inactivity_secs: 0.0,
            current_total_duration_secs: 0,
            roaming_data: RoamingData::default(),
            stop: None,
        };

        tracing::info!(
            tenant = %tenant_id,
            session_id = %session.id,
            transaction_id = %transaction.id,
            charge_box_id = %transaction.charge_box_id,
            connector_id,
            "roaming session opened a transaction"
        );

        match self.apply(docs, tenant_id, transaction, session)? {
            (ReconcileOutcome::Updated, transaction) => Ok((ReconcileOutcome::Created, transaction)),
            other => Ok(other),
        }
    }

    fn update_existing(
        &self,
        docs: &Documents<'_>,
        tenant_id: &str,
        transaction: Transaction,
        session: Session,
    ) -> Result<(ReconcileOutcome, Transaction), RoamingError> {
        let previous_status = transaction
            .roaming_data
            .session
            .as_ref()
            .map(|stored| stored.status);

        if transaction.roaming_data.cdr.is_some() || previous_status.is_some_and(is_terminal) {
            tracing::warn!(
                tenant = %tenant_id,
                session_id = %session.id,
                transaction_id = %transaction.id,
                "session update ignored, transaction already finalized"
            );
            return Ok((ReconcileOutcome::SkippedFinalized, transaction));
        }

        if session.last_updated <= transaction.last_consumption.timestamp {
            tracing::info!(
                tenant = %tenant_id,
                session_id = %session.id,
                last_updated = %session.last_updated,
                last_consumption = %transaction.last_consumption.timestamp,
                "stale session update ignored"
            );
            return Ok((ReconcileOutcome::SkippedOutOfOrder, transaction));
        }

        if let Some(from) = previous_status {
            let step = transition(from, session.status);
            if !step.is_allowed() {
                tracing::warn!(
                    tenant = %tenant_id,
                    session_id = %session.id,
                    step = ?step,
                    "session status transition rejected"
                );
                return Ok((ReconcileOutcome::SkippedInvalidTransition, transaction));
            }
        }

        self.apply(docs, tenant_id, transaction, session)
    }

    fn apply(
        &self,
        docs: &Documents<'_>,
        tenant_id: &str,
        mut transaction: Transaction,
        session: Session,
    ) -> Result<(ReconcileOutcome, Transaction), RoamingError> {
        let delta =
            compute_consumption_delta(&transaction.last_consumption, session.kwh, session.last_updated);

        transaction.current_total_consumption_wh += delta.consumed_wh;
        transaction.current_total_inactivity_secs += delta.inactivity_secs;
        transaction.current_total_duration_secs =
            round_secs_between(transaction.timestamp, session.last_updated).max(0);
        transaction.current_instant_watts = delta.instant_watts;

        if delta.has_progress() {
            let consumption = Consumption {
                id: uuid::Uuid::new_v4().to_string(),
                transaction_id: transaction.id.clone(),
                charge_box_id: transaction.charge_box_id.clone(),
                connector_id: transaction.connector_id,
                site_area_id: transaction.site_area_id.clone(),
                user_id: transaction.user_id.clone(),
                started_at: transaction.last_consumption.timestamp,
                ended_at: session.last_updated,
                consumption_wh: delta.consumed_wh,
                instant_watts: delta.instant_watts,
                cumulated_consumption_wh: transaction.current_total_consumption_wh,
                total_inactivity_secs: transaction.current_total_inactivity_secs,
                total_duration_secs: transaction.current_total_duration_secs,
            };
            docs.upsert(tenant_id, &consumption)?;
        }

        transaction.price = session.total_cost;
        transaction.rounded_price = round_price(session.total_cost);
        transaction.currency = session.currency.clone();
        transaction.last_consumption = LastConsumption {
            value: kwh_to_wh(session.kwh),
            timestamp: session.last_updated,
        };

        let finished = session.end_datetime.is_some() || session.status == SessionStatus::Completed;
        let newly_stopped = finished && transaction.stop.is_none();
        if finished {
            let stopped_at = session.end_datetime.unwrap_or(session.last_updated);
            transaction.stop = Some(TransactionStop {
                meter_stop: kwh_to_wh(session.kwh),
                price: session.total_cost,
                rounded_price: round_price(session.total_cost),
                price_unit: session.currency.clone(),
                total_consumption_wh: transaction.current_total_consumption_wh,
                total_duration_secs: round_secs_between(transaction.timestamp, stopped_at),
                total_inactivity_secs: transaction.current_total_inactivity_secs,
                timestamp: stopped_at,
                tag_id: transaction.tag_id.clone(),
                user_id: transaction.user_id.clone(),
            });
        }

        let connector_use = if finished || session.status == SessionStatus::Invalid {
            ConnectorUse::Released
        } else if session.status == SessionStatus::Pending {
            ConnectorUse::Preparing
        } else {
            ConnectorUse::Charging
        };
        transaction.roaming_data.session = Some(session);

        docs.upsert(tenant_id, &transaction)?;
        update_connector(docs, tenant_id, &transaction, connector_use, self.clock.now())?;

        if newly_stopped {
            return Ok((ReconcileOutcome::Stopped, transaction));
        }
        Ok((ReconcileOutcome::Updated, transaction))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectorUse {
    Preparing,
    Charging,
    Released,
}

// Frees the connector only if no other transaction took it over.
pub(crate) fn update_connector(
    docs: &Documents<'_>,
    tenant_id: &str,
    transaction: &Transaction,
    connector_use: ConnectorUse,
    now: DateTime<Utc>,
) -> Result<(), RoamingError> {
    let Some(mut station) = docs.get::<ChargingStation>(tenant_id, &transaction.charge_box_id)?
    else {
        tracing::warn!(
            tenant = %tenant_id,
            charge_box_id = %transaction.charge_box_id,
            "charging station vanished, connector status not updated"
        );
        return Ok(());
    };
    let Some(connector) = station.connector_mut(transaction.connector_id) else {
        return Ok(());
    };

    let (status, current_transaction_id) = match connector_use {
        ConnectorUse::Released => {
            let other_transaction = connector
                .current_transaction_id
                .clone()
                .filter(|current| current != &transaction.id);
            match other_transaction {
                Some(other) => (connector.status, Some(other)),
                None => (ConnectorStatus::Available, None),
            }
        }
        ConnectorUse::Preparing => (ConnectorStatus::Preparing, Some(transaction.id.clone())),
        ConnectorUse::Charging => (ConnectorStatus::Charging, Some(transaction.id.clone())),
    };

    if connector.status == status && connector.current_transaction_id == current_transaction_id {
        return Ok(());
    }
    connector.status = status;
    connector.current_transaction_id = current_transaction_id;
    station.last_changed_on = now;
    docs.upsert(tenant_id, &station)?;
    Ok(())
}

fn round_price(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}
