use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const STATUS_SUCCESS: u32 = 1000;
pub const STATUS_CLIENT_ERROR: u32 = 2000;
pub const STATUS_INVALID_PARAMETERS: u32 = 2001;
pub const STATUS_UNKNOWN_LOCATION: u32 = 2003;
pub const STATUS_UNKNOWN_OBJECT: u32 = 2004;
pub const STATUS_SERVER_ERROR: u32 = 3000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("payload does not match the expected object: {0}")]
    Malformed(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("location must reference exactly one EVSE, got {0}")]
    EvseCount(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    AdHocUser,
    AppUser,
    Other,
    Rfid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WhitelistType {
    Always,
    Allowed,
    AllowedOffline,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub uid: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub auth_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_number: Option<String>,
    pub issuer: String,
    pub valid: bool,
    pub whitelist: WhitelistType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMethod {
    AuthRequest,
    Whitelist,
}

// `Completed` and `Invalid` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessDetails {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: String,
    pub longitude: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvseStatus {
    Available,
    Blocked,
    Charging,
    Inoperative,
    Outoforder,
    Planned,
    Removed,
    Reserved,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcpiConnector {
    pub id: String,
    pub standard: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amperage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tariff_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evse {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<String>,
    pub status: EvseStatus,
    #[serde(default)]
    pub connectors: Vec<OcpiConnector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<GeoLocation>,
    #[serde(default)]
    pub evses: Vec<Evse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<BusinessDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Location {
    pub fn single_evse(&self) -> Option<&Evse> {
        match self.evses.as_slice() {
            [evse] => Some(evse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrDimension {
    #[serde(rename = "type")]
    pub dimension_type: String,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingPeriod {
    pub start_date_time: DateTime<Utc>,
    #[serde(default)]
    pub dimensions: Vec<CdrDimension>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_datetime: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_datetime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub kwh: f64,
    pub auth_id: String,
    pub auth_method: AuthMethod,
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_id: Option<String>,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charging_periods: Vec<ChargingPeriod>,
    #[serde(default)]
    pub total_cost: f64,
    pub status: SessionStatus,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cdr {
    pub id: String,
    pub start_date_time: DateTime<Utc>,
    pub stop_date_time: DateTime<Utc>,
    pub auth_id: String,
    pub auth_method: AuthMethod,
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_id: Option<String>,
    pub currency: String,
    #[serde(default)]
    pub charging_periods: Vec<ChargingPeriod>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub total_energy: f64,
    #[serde(default)]
    pub total_time: f64,
    #[serde(default)]
    pub total_parking_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    StartSession,
    StopSession,
    ReserveNow,
    UnlockConnector,
    CancelReservation,
}

impl CommandType {
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment.trim().to_ascii_uppercase().as_str() {
            "START_SESSION" => Some(Self::StartSession),
            "STOP_SESSION" => Some(Self::StopSession),
            "RESERVE_NOW" => Some(Self::ReserveNow),
            "UNLOCK_CONNECTOR" => Some(Self::UnlockConnector),
            "CANCEL_RESERVATION" => Some(Self::CancelReservation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSession {
    pub response_url: String,
    pub token: Token,
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evse_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopSession {
    pub response_url: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandResult {
    Accepted,
    Rejected,
    NotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub result: CommandResult,
}

impl CommandResponse {
    pub fn accepted() -> Self {
        Self {
            result: CommandResult::Accepted,
        }
    }

    pub fn rejected() -> Self {
        Self {
            result: CommandResult::Rejected,
        }
    }

    pub fn not_supported() -> Self {
        Self {
            result: CommandResult::NotSupported,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcpiResponse<T> {
    pub status_code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub data: Option<T>,
    pub timestamp: DateTime<Utc>,
}

impl<T> OcpiResponse<T> {
    pub fn success(data: T, timestamp: DateTime<Utc>) -> Self {
        Self {
            status_code: STATUS_SUCCESS,
            status_message: None,
            data: Some(data),
            timestamp,
        }
    }

    pub fn error(status_code: u32, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            status_code,
            status_message: Some(message.into()),
            data: None,
            timestamp,
        }
    }

    pub fn is_success(&self) -> bool {
        (1000..2000).contains(&self.status_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointEntry {
    pub identifier: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDetails {
    pub version: String,
    pub endpoints: Vec<EndpointEntry>,
}

pub fn parse_session(payload: &Value) -> Result<Session, ValidationError> {
    let session: Session = serde_json::from_value(payload.clone())
        .map_err(|error| ValidationError::Malformed(error.to_string()))?;
    validate_session(&session)?;
    Ok(session)
}

pub fn parse_cdr(payload: &Value) -> Result<Cdr, ValidationError> {
    let cdr: Cdr = serde_json::from_value(payload.clone())
        .map_err(|error| ValidationError::Malformed(error.to_string()))?;
    validate_cdr(&cdr)?;
    Ok(cdr)
}

pub fn validate_session(session: &Session) -> Result<(), ValidationError> {
    require_text(&session.id, "id")?;
    require_text(&session.auth_id, "auth_id")?;
    require_text(&session.currency, "currency")?;
    validate_location(&session.location)
}

pub fn validate_cdr(cdr: &Cdr) -> Result<(), ValidationError> {
    require_text(&cdr.id, "id")?;
    require_text(&cdr.auth_id, "auth_id")?;
    require_text(&cdr.currency, "currency")?;
    validate_location(&cdr.location)
}

pub fn validate_start_session(command: &StartSession) -> Result<(), ValidationError> {
    require_text(&command.response_url, "response_url")?;
    require_text(&command.location_id, "location_id")?;
    require_text(&command.token.uid, "token.uid")?;
    match command.evse_uid.as_deref() {
        Some(uid) if !uid.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::MissingField("evse_uid")),
    }
}

pub fn validate_stop_session(command: &StopSession) -> Result<(), ValidationError> {
    require_text(&command.response_url, "response_url")?;
    require_text(&command.session_id, "session_id")
}

fn validate_location(location: &Location) -> Result<(), ValidationError> {
    require_text(&location.id, "location.id")?;
    if location.evses.len() != 1 {
        return Err(ValidationError::EvseCount(location.evses.len()));
    }
    Ok(())
}

fn require_text(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}
