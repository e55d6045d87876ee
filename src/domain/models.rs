use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::domain::ocpi::{Cdr, Session, Token};
use crate::domain::sync_result::SyncJobSummary;

pub trait Document: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastConsumption {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStop {
    pub meter_stop: f64,
    pub price: f64,
    pub rounded_price: f64,
    pub price_unit: String,
    pub total_consumption_wh: f64,
    pub total_duration_secs: i64,
    pub total_inactivity_secs: f64,
    pub timestamp: DateTime<Utc>,
    pub tag_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoamingData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdr: Option<Cdr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdr_pushed_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    // false: session came from a partner
    pub issuer: bool,
    pub charge_box_id: String,
    pub connector_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_area_id: Option<String>,
    pub tag_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub meter_start: f64,
    pub currency: String,
    pub price: f64,
    pub rounded_price: f64,
    pub last_consumption: LastConsumption,
    pub current_instant_watts: f64,
    pub current_total_consumption_wh: f64,
    pub current_total_inactivity_secs: f64,
    pub current_total_duration_secs: i64,
    #[serde(default)]
    pub roaming_data: RoamingData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<TransactionStop>,
}

impl Transaction {
    pub fn session_id(&self) -> Option<&str> {
        self.roaming_data
            .session
            .as_ref()
            .map(|session| session.id.as_str())
    }
}

impl Document for Transaction {
    const COLLECTION: &'static str = "transactions";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    pub id: String,
    pub transaction_id: String,
    pub charge_box_id: String,
    pub connector_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_area_id: Option<String>,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub consumption_wh: f64,
    pub instant_watts: f64,
    pub cumulated_consumption_wh: f64,
    pub total_inactivity_secs: f64,
    pub total_duration_secs: i64,
}

impl Document for Consumption {
    const COLLECTION: &'static str = "consumptions";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEv,
    SuspendedEvse,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub connector_id: u32,
    pub evse_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<String>,
    pub status: ConnectorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_transaction_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAuthorization {
    pub id: String,
    pub connector_id: u32,
    pub tag_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingStation {
    pub id: String,
    // false: imported from a partner
    pub issuer: bool,
    pub public: bool,
    #[serde(default)]
    pub inactive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_area_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default)]
    pub connectors: Vec<Connector>,
    #[serde(default)]
    pub remote_authorizations: Vec<RemoteAuthorization>,
    pub last_changed_on: DateTime<Utc>,
}

impl ChargingStation {
    pub fn connector_by_evse_uid(&self, evse_uid: &str) -> Option<&Connector> {
        self.connectors
            .iter()
            .find(|connector| connector.evse_uid == evse_uid)
    }

    pub fn connector_mut(&mut self, connector_id: u32) -> Option<&mut Connector> {
        self.connectors
            .iter_mut()
            .find(|connector| connector.connector_id == connector_id)
    }
}

impl Document for ChargingStation {
    const COLLECTION: &'static str = "charging_stations";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    // false: issued by a partner eMSP
    pub issuer: bool,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocpi_token: Option<Token>,
    pub last_changed_on: DateTime<Utc>,
}

impl Document for Tag {
    const COLLECTION: &'static str = "tags";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub issuer: bool,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Document for User {
    const COLLECTION: &'static str = "users";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub issuer: bool,
}

impl Document for Company {
    const COLLECTION: &'static str = "companies";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub company_id: String,
    pub issuer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl Document for Site {
    const COLLECTION: &'static str = "sites";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoamingRole {
    Cpo,
    Emsp,
}

impl RoamingRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpo => "cpo",
            Self::Emsp => "emsp",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoamingProtocol {
    #[default]
    Ocpi,
    Oicp,
}

impl RoamingProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocpi => "ocpi",
            Self::Oicp => "oicp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastJobRun {
    pub on: DateTime<Utc>,
    pub result: SyncJobSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoamingEndpoint {
    pub id: String,
    pub role: RoamingRole,
    #[serde(default)]
    pub protocol: RoamingProtocol,
    pub version: String,
    pub country_code: String,
    pub party_id: String,
    pub base_url: String,
    pub partner_token: String,
    pub local_token: String,
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub background_patch_job: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_patch_job: Option<LastJobRun>,
    #[serde(default)]
    pub last_pull_jobs: BTreeMap<String, LastJobRun>,
}

impl Document for RoamingEndpoint {
    const COLLECTION: &'static str = "roaming_endpoints";

    fn id(&self) -> &str {
        &self.id
    }
}
