use chrono::{DateTime, Duration, Utc};

use crate::domain::models::{ChargingStation, RemoteAuthorization};
use crate::domain::ocpi::SessionStatus;

// A remote start blocks other starts on the connector for this long.
pub const REMOTE_AUTHORIZATION_VALIDITY_SECS: i64 = 120;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    Unchanged,
    Advanced {
        from: SessionStatus,
        to: SessionStatus,
    },
    Rejected {
        from: SessionStatus,
        to: SessionStatus,
    },
}

impl StatusTransition {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

pub fn is_terminal(status: SessionStatus) -> bool {
    matches!(status, SessionStatus::Completed | SessionStatus::Invalid)
}

// PENDING -> ACTIVE -> COMPLETED, INVALID from any open state.
pub fn transition(from: SessionStatus, to: SessionStatus) -> StatusTransition {
    if from == to {
        return StatusTransition::Unchanged;
    }

    let allowed = match (from, to) {
        (SessionStatus::Completed | SessionStatus::Invalid, _) => false,
        (_, SessionStatus::Invalid) => true,
        (SessionStatus::Pending, SessionStatus::Active | SessionStatus::Completed) => true,
        (SessionStatus::Active, SessionStatus::Completed) => true,
        _ => false,
    };

    if allowed {
        StatusTransition::Advanced { from, to }
    } else {
        StatusTransition::Rejected { from, to }
    }
}

pub fn remote_authorization_is_valid(
    authorization: &RemoteAuthorization,
    now: DateTime<Utc>,
) -> bool {
    now - authorization.timestamp < Duration::seconds(REMOTE_AUTHORIZATION_VALIDITY_SECS)
}

pub fn consume_remote_authorization(
    station: &mut ChargingStation,
    connector_id: u32,
    tag_id: &str,
    now: DateTime<Utc>,
) -> bool {
    let mut consumed = false;
    station.remote_authorizations.retain(|authorization| {
        if !remote_authorization_is_valid(authorization, now) {
            return false;
        }
        let matches = authorization.connector_id == connector_id && authorization.tag_id == tag_id;
        consumed |= matches;
        !matches
    });
    consumed
}
