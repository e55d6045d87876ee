use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::adapters::partner_http::PartnerApi;
use crate::adapters::station_commands::{
    ChargingStationCommands, StationCommandError, StationCommandStatus,
};
use crate::app::services::SqliteRoamingStore;
use crate::domain::models::{
    ChargingStation, ConnectorStatus, RemoteAuthorization, Tag, Transaction, User,
};
use crate::domain::ocpi::{
    CommandResponse, CommandType, StartSession, StopSession, validate_start_session,
    validate_stop_session,
};
use crate::domain::session_state::{Clock, remote_authorization_is_valid};
use crate::roaming::error::RoamingError;

pub struct CommandOutcome {
    pub response: CommandResponse,
    pub follow_up: Option<JoinHandle<()>>,
}

impl CommandOutcome {
    fn answered(response: CommandResponse) -> Self {
        Self {
            response,
            follow_up: None,
        }
    }
}

pub struct CommandCorrelator {
    store: SqliteRoamingStore,
    clock: Arc<dyn Clock>,
    stations: Arc<dyn ChargingStationCommands>,
}

impl CommandCorrelator {
    pub fn new(
        store: SqliteRoamingStore,
        clock: Arc<dyn Clock>,
        stations: Arc<dyn ChargingStationCommands>,
    ) -> Self {
        Self {
            store,
            clock,
            stations,
        }
    }

    // Rejections are answers; only storage failures are `Err`.
    pub fn handle(
        &self,
        tenant_id: &str,
        command: CommandType,
        payload: &Value,
        callback: Arc<dyn PartnerApi>,
    ) -> Result<CommandOutcome, RoamingError> {
        match command {
            CommandType::StartSession => self.start_session(tenant_id, payload, callback),
            CommandType::StopSession => self.stop_session(tenant_id, payload, callback),
            CommandType::ReserveNow
            | CommandType::UnlockConnector
            | CommandType::CancelReservation => {
                tracing::info!(tenant = %tenant_id, command = ?command, "command not supported");
                Ok(CommandOutcome::answered(CommandResponse::not_supported()))
            }
        }
    }

    fn start_session(
        &self,
        tenant_id: &str,
        payload: &Value,
        callback: Arc<dyn PartnerApi>,
    ) -> Result<CommandOutcome, RoamingError> {
        let command: StartSession = match parse_command(payload) {
            Ok(command) => command,
            Err(reason) => return Ok(reject(tenant_id, "START_SESSION", &reason)),
        };
        if let Err(error) = validate_start_session(&command) {
            return Ok(reject(tenant_id, "START_SESSION", &error.to_string()));
        }
        if !command.token.valid {
            return Ok(reject(tenant_id, "START_SESSION", "token is not valid"));
        }

        let Some(tag) = self.store.get::<Tag>(tenant_id, &command.token.uid)? else {
            return Ok(reject(tenant_id, "START_SESSION", "unknown token"));
        };
        if !tag.active || tag.issuer {
            return Ok(reject(
                tenant_id,
                "START_SESSION",
                "token is inactive or not issued by a partner",
            ));
        }
        let user = match tag.user_id.as_deref() {
            Some(user_id) => self.store.get::<User>(tenant_id, user_id)?,
            None => None,
        };
        if !user.is_some_and(|user| !user.issuer) {
            return Ok(reject(
                tenant_id,
                "START_SESSION",
                "token is not attached to a partner user",
            ));
        }

        let evse_uid = command.evse_uid.clone().unwrap_or_default();
        let Some(mut station) =
            self.store
                .station_by_evse(tenant_id, &command.location_id, &evse_uid)?
        else {
            return Ok(reject(tenant_id, "START_SESSION", "unknown EVSE"));
        };
        if !station.issuer || !station.public || station.inactive {
            return Ok(reject(
                tenant_id,
                "START_SESSION",
                "station is not open to roaming",
            ));
        }
        let Some(connector) = station.connector_by_evse_uid(&evse_uid) else {
            return Ok(reject(tenant_id, "START_SESSION", "unknown EVSE"));
        };
        if !matches!(
            connector.status,
            ConnectorStatus::Available | ConnectorStatus::Preparing
        ) {
            return Ok(reject(tenant_id, "START_SESSION", "connector is busy"));
        }
        let connector_id = connector.connector_id;

        let now = self.clock.now();
        if station.remote_authorizations.iter().any(|authorization| {
            authorization.connector_id == connector_id
                && remote_authorization_is_valid(authorization, now)
        }) {
            return Ok(reject(
                tenant_id,
                "START_SESSION",
                "connector is reserved by a pending remote start",
            ));
        }

        station
            .remote_authorizations
            .retain(|authorization| authorization.connector_id != connector_id);
        let authorization = RemoteAuthorization {
            id: command
                .authorization_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            connector_id,
            tag_id: tag.id.clone(),
            timestamp: now,
        };
        station.remote_authorizations.push(authorization.clone());
        self.store.upsert(tenant_id, &station)?;

        tracing::info!(
            tenant = %tenant_id,
            station_id = %station.id,
            connector_id,
            authorization_id = %authorization.id,
            tag_id = %tag.id,
            "remote start accepted"
        );

        let stations = Arc::clone(&self.stations);
        let tenant = tenant_id.to_string();
        let station_id = station.id.clone();
        let tag_id = tag.id;
        let follow_up = tokio::spawn(async move {
            let dispatched = stations
                .remote_start(&tenant, &station_id, connector_id, &tag_id)
                .await;
            let response = dispatch_result(&tenant, &station_id, dispatched);
            deliver(&tenant, callback.as_ref(), &command.response_url, response).await;
        });

        Ok(CommandOutcome {
            response: CommandResponse::accepted(),
            follow_up: Some(follow_up),
        })
    }

    fn stop_session(
        &self,
        tenant_id: &str,
        payload: &Value,
        callback: Arc<dyn PartnerApi>,
    ) -> Result<CommandOutcome, RoamingError> {
        let command: StopSession = match parse_command(payload) {
            Ok(command) => command,
            Err(reason) => return Ok(reject(tenant_id, "STOP_SESSION", &reason)),
        };
        if let Err(error) = validate_stop_session(&command) {
            return Ok(reject(tenant_id, "STOP_SESSION", &error.to_string()));
        }

        let transaction = match self
            .store
            .transaction_by_session_id(tenant_id, &command.session_id)?
        {
            Some(transaction) => Some(transaction),
            None => self
                .store
                .get::<Transaction>(tenant_id, &command.session_id)?,
        };
        let Some(transaction) = transaction else {
            return Ok(reject(tenant_id, "STOP_SESSION", "unknown session"));
        };
        if transaction.stop.is_some() {
            return Ok(reject(tenant_id, "STOP_SESSION", "session already stopped"));
        }
        let tag = self.store.get::<Tag>(tenant_id, &transaction.tag_id)?;
        if !tag.is_some_and(|tag| !tag.issuer) {
            return Ok(reject(
                tenant_id,
                "STOP_SESSION",
                "session was not started with a partner token",
            ));
        }
        let station = self
            .store
            .get::<ChargingStation>(tenant_id, &transaction.charge_box_id)?;
        if !station.is_some_and(|station| !station.inactive) {
            return Ok(reject(tenant_id, "STOP_SESSION", "station is unreachable"));
        }

        tracing::info!(
            tenant = %tenant_id,
            session_id = %command.session_id,
            transaction_id = %transaction.id,
            "remote stop accepted"
        );

        let stations = Arc::clone(&self.stations);
        let tenant = tenant_id.to_string();
        let follow_up = tokio::spawn(async move {
            let dispatched = stations
                .remote_stop(&tenant, &transaction.charge_box_id, &transaction.id)
                .await;
            let response = dispatch_result(&tenant, &transaction.charge_box_id, dispatched);
            deliver(&tenant, callback.as_ref(), &command.response_url, response).await;
        });

        Ok(CommandOutcome {
            response: CommandResponse::accepted(),
            follow_up: Some(follow_up),
        })
    }
}

fn parse_command<T: DeserializeOwned>(payload: &Value) -> Result<T, String> {
    serde_json::from_value(payload.clone()).map_err(|error| error.to_string())
}

fn reject(tenant_id: &str, command: &str, reason: &str) -> CommandOutcome {
    tracing::info!(tenant = %tenant_id, command, reason, "command rejected");
    CommandOutcome::answered(CommandResponse::rejected())
}

fn dispatch_result(
    tenant_id: &str,
    station_id: &str,
    dispatched: Result<StationCommandStatus, StationCommandError>,
) -> CommandResponse {
    match dispatched {
        Ok(StationCommandStatus::Accepted) => CommandResponse::accepted(),
        Ok(StationCommandStatus::Rejected) => CommandResponse::rejected(),
        Err(error) => {
            tracing::warn!(
                tenant = %tenant_id,
                station_id,
                error = %error,
                "station command dispatch failed"
            );
            CommandResponse::rejected()
        }
    }
}

async fn deliver(
    tenant_id: &str,
    callback: &dyn PartnerApi,
    response_url: &str,
    response: CommandResponse,
) {
    if let Err(error) = callback.post_command_result(response_url, &response).await {
        tracing::warn!(
            tenant = %tenant_id,
            response_url,
            result = ?response.result,
            error = %error,
            "command result could not be delivered, dropping it"
        );
    }
}
