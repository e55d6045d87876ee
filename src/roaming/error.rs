use thiserror::Error;

use crate::adapters::partner_http::PartnerError;
use crate::app::services::ServiceError;
use crate::domain::ocpi::{
    STATUS_CLIENT_ERROR, STATUS_INVALID_PARAMETERS, STATUS_SERVER_ERROR, STATUS_UNKNOWN_LOCATION,
    STATUS_UNKNOWN_OBJECT, ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    Validation,
    NotFound,
    Internal,
}

#[derive(Debug, Error)]
pub enum RoamingError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("unknown location {location_id} with EVSE {evse_uid}")]
    UnknownLocation {
        location_id: String,
        evse_uid: String,
    },
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("unknown tag: {0}")]
    UnknownTag(String),
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("unknown charging station: {0}")]
    UnknownStation(String),
    #[error("unknown roaming endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("unsupported roaming protocol: {role} {version}")]
    UnsupportedVersion { role: String, version: String },
    #[error("operation {operation} is not offered by the {role} role")]
    UnsupportedOperation {
        role: &'static str,
        operation: &'static str,
    },
    #[error("storage failure: {0}")]
    Storage(#[from] ServiceError),
    #[error("partner call failed: {0}")]
    Partner(#[from] PartnerError),
}

impl From<ValidationError> for RoamingError {
    fn from(error: ValidationError) -> Self {
        Self::InvalidParameters(error.to_string())
    }
}

impl RoamingError {
    pub fn family(&self) -> ErrorFamily {
        match self {
            Self::InvalidParameters(_) | Self::UnsupportedOperation { .. } => {
                ErrorFamily::Validation
            }
            Self::UnknownLocation { .. }
            | Self::UnknownSession(_)
            | Self::UnknownTag(_)
            | Self::UnknownUser(_)
            | Self::UnknownStation(_)
            | Self::UnknownEndpoint(_) => ErrorFamily::NotFound,
            Self::UnsupportedVersion { .. } | Self::Storage(_) | Self::Partner(_) => {
                ErrorFamily::Internal
            }
        }
    }

    pub fn ocpi_status(&self) -> u32 {
        match self {
            Self::InvalidParameters(_) => STATUS_INVALID_PARAMETERS,
            Self::UnknownLocation { .. } => STATUS_UNKNOWN_LOCATION,
            Self::UnknownSession(_)
            | Self::UnknownTag(_)
            | Self::UnknownUser(_)
            | Self::UnknownStation(_)
            | Self::UnknownEndpoint(_) => STATUS_UNKNOWN_OBJECT,
            Self::UnsupportedOperation { .. } => STATUS_CLIENT_ERROR,
            Self::UnsupportedVersion { .. } | Self::Storage(_) | Self::Partner(_) => {
                STATUS_SERVER_ERROR
            }
        }
    }
}
