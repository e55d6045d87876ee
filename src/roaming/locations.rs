use chrono::{DateTime, Utc};

use crate::adapters::db::{Filter, Page, Paging};
use crate::app::services::SqliteRoamingStore;
use crate::domain::models::{ChargingStation, Company, Connector, ConnectorStatus, Site};
use crate::domain::ocpi::{BusinessDetails, Evse, EvseStatus, Location, OcpiConnector};
use crate::domain::oicp::{EvseStatusRecord, OicpEvseStatus};
use crate::domain::policy::PolicyTable;
use crate::roaming::error::RoamingError;

const DEFAULT_CONNECTOR_STANDARD: &str = "IEC_62196_T2";
const UNKNOWN_OPERATOR: &str = "Unknown operator";

pub fn evse_status(status: ConnectorStatus) -> EvseStatus {
    match status {
        ConnectorStatus::Available => EvseStatus::Available,
        ConnectorStatus::Preparing
        | ConnectorStatus::Charging
        | ConnectorStatus::SuspendedEv
        | ConnectorStatus::SuspendedEvse
        | ConnectorStatus::Finishing => EvseStatus::Charging,
        ConnectorStatus::Reserved => EvseStatus::Reserved,
        ConnectorStatus::Unavailable => EvseStatus::Inoperative,
        ConnectorStatus::Faulted => EvseStatus::Outoforder,
    }
}

pub fn connector_status(status: EvseStatus) -> ConnectorStatus {
    match status {
        EvseStatus::Available => ConnectorStatus::Available,
        EvseStatus::Charging => ConnectorStatus::Charging,
        EvseStatus::Reserved => ConnectorStatus::Reserved,
        EvseStatus::Outoforder => ConnectorStatus::Faulted,
        EvseStatus::Blocked
        | EvseStatus::Inoperative
        | EvseStatus::Planned
        | EvseStatus::Removed
        | EvseStatus::Unknown => ConnectorStatus::Unavailable,
    }
}

pub fn oicp_evse_status(status: EvseStatus) -> OicpEvseStatus {
    match status {
        EvseStatus::Available => OicpEvseStatus::Available,
        EvseStatus::Charging => OicpEvseStatus::Occupied,
        EvseStatus::Reserved => OicpEvseStatus::Reserved,
        EvseStatus::Blocked | EvseStatus::Inoperative | EvseStatus::Outoforder => {
            OicpEvseStatus::OutOfService
        }
        EvseStatus::Removed => OicpEvseStatus::EvseNotFound,
        EvseStatus::Planned | EvseStatus::Unknown => OicpEvseStatus::Unknown,
    }
}

pub fn evse_status_records(station: &ChargingStation) -> Vec<EvseStatusRecord> {
    station
        .connectors
        .iter()
        .map(|connector| EvseStatusRecord {
            evse_id: connector
                .evse_id
                .clone()
                .unwrap_or_else(|| connector.evse_uid.clone()),
            evse_status: if station.inactive {
                OicpEvseStatus::OutOfService
            } else {
                oicp_evse_status(evse_status(connector.status))
            },
        })
        .collect()
}

pub fn station_to_location(
    tenant_id: &str,
    station: &ChargingStation,
    site: Option<&Site>,
    policies: &PolicyTable,
) -> Location {
    let tariff_id = policies
        .tariff_for(tenant_id, station.site_area_id.as_deref(), &station.id)
        .map(|policy| policy.tariff_id.clone());

    let evses = station
        .connectors
        .iter()
        .map(|connector| Evse {
            uid: connector.evse_uid.clone(),
            evse_id: connector.evse_id.clone(),
            status: if station.inactive {
                EvseStatus::Inoperative
            } else {
                evse_status(connector.status)
            },
            connectors: vec![OcpiConnector {
                id: connector.connector_id.to_string(),
                standard: connector
                    .standard
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CONNECTOR_STANDARD.to_string()),
                format: Some("SOCKET".to_string()),
                power_type: None,
                voltage: None,
                amperage: None,
                tariff_id: tariff_id.clone(),
                last_updated: Some(station.last_changed_on),
            }],
            last_updated: Some(station.last_changed_on),
        })
        .collect();

    Location {
        id: station
            .location_id
            .clone()
            .or_else(|| station.site_id.clone())
            .unwrap_or_else(|| station.id.clone()),
        name: site.map(|site| site.name.clone()),
        address: site.and_then(|site| site.address.clone()),
        city: site.and_then(|site| site.city.clone()),
        postal_code: None,
        country: site.and_then(|site| site.country.clone()),
        coordinates: None,
        evses,
        operator: None,
        last_updated: Some(station.last_changed_on),
    }
}

pub fn list_public_locations(
    store: &SqliteRoamingStore,
    tenant_id: &str,
    policies: &PolicyTable,
    paging: Paging,
) -> Result<Page<Location>, RoamingError> {
    let filter = Filter::new().eq("$.issuer", true).eq("$.public", true);
    let stations: Page<ChargingStation> = store.find(tenant_id, &filter, paging)?;

    let mut result = Vec::with_capacity(stations.result.len());
    for station in &stations.result {
        let site: Option<Site> = match &station.site_id {
            Some(site_id) => store.get(tenant_id, site_id)?,
            None => None,
        };
        result.push(station_to_location(tenant_id, station, site.as_ref(), policies));
    }

    Ok(Page {
        count: stations.count,
        result,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedLocation {
    pub company_id: String,
    pub site_id: String,
    pub station_ids: Vec<String>,
}

// Two concurrent imports for one tenant duplicate companies.
pub fn import_location(
    store: &SqliteRoamingStore,
    tenant_id: &str,
    location: &Location,
    now: DateTime<Utc>,
) -> Result<ImportedLocation, RoamingError> {
    if location.id.trim().is_empty() {
        return Err(RoamingError::InvalidParameters(
            "location without id".to_string(),
        ));
    }

    let company = find_or_create_company(store, tenant_id, location.operator.as_ref())?;
    let site = upsert_site(store, tenant_id, &company, location)?;

    let mut station_ids = Vec::with_capacity(location.evses.len());
    for evse in &location.evses {
        let existing: Option<ChargingStation> = store.get(tenant_id, &evse.uid)?;
        if existing.as_ref().is_some_and(|station| station.issuer) {
            tracing::warn!(
                tenant = %tenant_id,
                evse_uid = %evse.uid,
                "partner EVSE collides with a local station, skipped"
            );
            continue;
        }

        let station = ChargingStation {
            id: evse.uid.clone(),
            issuer: false,
            public: true,
            inactive: evse.status == EvseStatus::Removed,
            site_id: Some(site.id.clone()),
            site_area_id: None,
            location_id: Some(location.id.clone()),
            connectors: imported_connectors(evse, existing.as_ref()),
            remote_authorizations: existing
                .map(|station| station.remote_authorizations)
                .unwrap_or_default(),
            last_changed_on: now,
        };
        station_ids.push(store.upsert(tenant_id, &station)?);
    }

    tracing::debug!(
        tenant = %tenant_id,
        location_id = %location.id,
        stations = station_ids.len(),
        "partner location imported"
    );

    Ok(ImportedLocation {
        company_id: company.id,
        site_id: site.id,
        station_ids,
    })
}

fn find_or_create_company(
    store: &SqliteRoamingStore,
    tenant_id: &str,
    operator: Option<&BusinessDetails>,
) -> Result<Company, RoamingError> {
    let name = operator
        .map(|operator| operator.name.trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_OPERATOR)
        .to_string();

    let filter = Filter::new().eq("$.issuer", false).eq("$.name", name.clone());
    if let Some(company) = store.find_one::<Company>(tenant_id, &filter)? {
        return Ok(company);
    }

    let company = Company {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        issuer: false,
    };
    store.upsert(tenant_id, &company)?;
    Ok(company)
}

fn upsert_site(
    store: &SqliteRoamingStore,
    tenant_id: &str,
    company: &Company,
    location: &Location,
) -> Result<Site, RoamingError> {
    let filter = Filter::new()
        .eq("$.issuer", false)
        .eq("$.location_id", location.id.clone());
    let id = store
        .find_one::<Site>(tenant_id, &filter)?
        .map(|site| site.id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let site = Site {
        id,
        name: location
            .name
            .clone()
            .unwrap_or_else(|| location.id.clone()),
        company_id: company.id.clone(),
        issuer: false,
        location_id: Some(location.id.clone()),
        address: location.address.clone(),
        city: location.city.clone(),
        country: location.country.clone(),
    };
    store.upsert(tenant_id, &site)?;
    Ok(site)
}

fn imported_connectors(evse: &Evse, existing: Option<&ChargingStation>) -> Vec<Connector> {
    let status = connector_status(evse.status);
    let current_transaction = |connector_id: u32| {
        existing
            .and_then(|station| {
                station
                    .connectors
                    .iter()
                    .find(|connector| connector.connector_id == connector_id)
            })
            .and_then(|connector| connector.current_transaction_id.clone())
    };

    if evse.connectors.is_empty() {
        return vec![Connector {
            connector_id: 1,
            evse_uid: evse.uid.clone(),
            evse_id: evse.evse_id.clone(),
            status,
            standard: None,
            current_transaction_id: current_transaction(1),
        }];
    }

    evse.connectors
        .iter()
        .enumerate()
        .map(|(index, connector)| {
            let connector_id = connector
                .id
                .trim()
                .parse()
                .unwrap_or(index as u32 + 1);
            Connector {
                connector_id,
                evse_uid: evse.uid.clone(),
                evse_id: evse.evse_id.clone(),
                status,
                standard: Some(connector.standard.clone()),
                current_transaction_id: current_transaction(connector_id),
            }
        })
        .collect()
}
