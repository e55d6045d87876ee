use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::Connection;
use serde_json::{Value, json};

use crate::adapters::db::{open_connection, run_migrations};
use crate::adapters::partner_http::{PartnerApi, PartnerError, RemotePage};
use crate::adapters::station_commands::{
    ChargingStationCommands, StationCommandError, StationCommandStatus,
};
use crate::app::services::SqliteRoamingStore;
use crate::domain::models::{
    ChargingStation, Connector, ConnectorStatus, LastConsumption, RoamingData, RoamingEndpoint,
    RoamingProtocol, RoamingRole, Tag, Transaction, TransactionStop, User,
};
use crate::domain::ocpi::{Cdr, CommandResponse, Token};
use crate::domain::oicp::{ActionType, PushEvseStatusRequest};
use crate::domain::session_state::Clock;
use crate::roaming::registry::ClientRegistry;

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

fn open_test_connection(test_name: &str) -> Connection {
    let template = ensure_template_db();
    let test_db_path = unique_test_db_path(test_name);

    if let Some(parent) = test_db_path.parent() {
        std::fs::create_dir_all(parent).expect("test db dir should be creatable");
    }

    std::fs::copy(&template, &test_db_path).expect("template db should be copied");
    open_connection(test_db_path.to_string_lossy().as_ref()).expect("test db should open")
}

pub fn test_store(test_name: &str) -> SqliteRoamingStore {
    SqliteRoamingStore::new(Arc::new(Mutex::new(open_test_connection(test_name))))
}

fn ensure_template_db() -> PathBuf {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH
        .get_or_init(|| {
            let template_path = std::env::var("TEST_DB_TEMPLATE_PATH")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_template_path);

            if let Some(parent) = template_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).expect("template parent dir should be creatable");
            }

            let mut connection = open_connection(template_path.to_string_lossy().as_ref())
                .expect("template db opens");
            run_migrations(&mut connection).expect("template migrations should succeed");

            template_path
        })
        .clone()
}

fn default_template_path() -> PathBuf {
    if cfg!(windows) {
        Path::new(".\\data\\roaming_test.db").to_path_buf()
    } else {
        Path::new("./data/roaming_test.db").to_path_buf()
    }
}

fn unique_test_db_path(test_name: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    Path::new("./target/testdb")
        .join(format!("{test_name}-{now}-{counter}.sqlite"))
        .to_path_buf()
}

pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, second)
        .unwrap()
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

pub fn station(id: &str, location_id: &str, issuer: bool) -> ChargingStation {
    ChargingStation {
        id: id.to_string(),
        issuer,
        public: true,
        inactive: false,
        site_id: Some("site-1".to_string()),
        site_area_id: Some("area-1".to_string()),
        location_id: Some(location_id.to_string()),
        connectors: vec![Connector {
            connector_id: 1,
            evse_uid: format!("{id}*1"),
            evse_id: Some(format!("FR*SLF*E{id}*1")),
            status: ConnectorStatus::Available,
            standard: Some("IEC_62196_T2".to_string()),
            current_transaction_id: None,
        }],
        remote_authorizations: Vec::new(),
        last_changed_on: at(9, 0, 0),
    }
}

pub fn tag(id: &str, issuer: bool, user_id: &str) -> Tag {
    Tag {
        id: id.to_string(),
        issuer,
        active: true,
        user_id: Some(user_id.to_string()),
        description: String::new(),
        visual_id: None,
        ocpi_token: None,
        last_changed_on: at(9, 0, 0),
    }
}

pub fn user(id: &str, issuer: bool) -> User {
    User {
        id: id.to_string(),
        issuer,
        name: format!("Driver {id}"),
        email: None,
    }
}

pub fn endpoint(id: &str, role: RoamingRole) -> RoamingEndpoint {
    RoamingEndpoint {
        id: id.to_string(),
        role,
        protocol: RoamingProtocol::Ocpi,
        version: "2.1.1".to_string(),
        country_code: "FR".to_string(),
        party_id: "SLF".to_string(),
        base_url: "http://partner.test/ocpi/versions".to_string(),
        partner_token: "partner-token".to_string(),
        local_token: format!("local-{id}"),
        endpoints: [
            ("tokens", "http://partner.test/tokens"),
            ("locations", "http://partner.test/locations"),
            ("sessions", "http://partner.test/sessions"),
            ("cdrs", "http://partner.test/cdrs"),
        ]
        .into_iter()
        .map(|(service, url)| (service.to_string(), url.to_string()))
        .collect(),
        background_patch_job: true,
        last_patch_job: None,
        last_pull_jobs: Default::default(),
    }
}

pub fn transaction(id: &str, station_id: &str, tag_id: &str, user_id: &str) -> Transaction {
    Transaction {
        id: id.to_string(),
        issuer: true,
        charge_box_id: station_id.to_string(),
        connector_id: 1,
        site_id: Some("site-1".to_string()),
        site_area_id: Some("area-1".to_string()),
        tag_id: tag_id.to_string(),
        user_id: user_id.to_string(),
        timestamp: at(10, 0, 0),
        meter_start: 0.0,
        currency: "EUR".to_string(),
        price: 0.0,
        rounded_price: 0.0,
        last_consumption: LastConsumption {
            value: 0.0,
            timestamp: at(10, 0, 0),
        },
        current_instant_watts: 0.0,
        current_total_consumption_wh: 0.0,
        current_total_inactivity_secs: 0.0,
        current_total_duration_secs: 0,
        roaming_data: RoamingData::default(),
        stop: None,
    }
}

pub fn stopped(mut transaction: Transaction, stopped_at: DateTime<Utc>) -> Transaction {
    let total_duration_secs = (stopped_at - transaction.timestamp).num_seconds();
    transaction.stop = Some(TransactionStop {
        meter_stop: transaction.meter_start + 6_000.0,
        price: 4.2,
        rounded_price: 4.2,
        price_unit: "EUR".to_string(),
        total_consumption_wh: 6_000.0,
        total_duration_secs,
        total_inactivity_secs: 0.0,
        timestamp: stopped_at,
        tag_id: transaction.tag_id.clone(),
        user_id: transaction.user_id.clone(),
    });
    transaction
}

pub fn session_payload(
    id: &str,
    evse_uid: &str,
    kwh: f64,
    status: &str,
    last_updated: DateTime<Utc>,
) -> Value {
    json!({
        "id": id,
        "start_datetime": at(10, 0, 0),
        "kwh": kwh,
        "auth_id": "TAG-1",
        "auth_method": "WHITELIST",
        "location": {
            "id": "LOC-1",
            "evses": [{"uid": evse_uid, "status": "CHARGING", "connectors": []}]
        },
        "currency": "EUR",
        "total_cost": 1.5,
        "status": status,
        "last_updated": last_updated
    })
}

pub fn cdr_payload(id: &str, evse_uid: &str) -> Value {
    json!({
        "id": id,
        "start_date_time": at(10, 0, 0),
        "stop_date_time": at(11, 0, 0),
        "auth_id": "TAG-1",
        "auth_method": "WHITELIST",
        "location": {
            "id": "LOC-1",
            "evses": [{"uid": evse_uid, "status": "AVAILABLE"}]
        },
        "currency": "EUR",
        "total_cost": 9.99,
        "total_energy": 12.5,
        "total_time": 1.25,
        "total_parking_time": 0.25,
        "last_updated": at(11, 5, 0)
    })
}

#[derive(Default)]
pub struct FakePartner {
    pub pages: Mutex<Vec<(String, RemotePage)>>,
    pub fetched: Mutex<Vec<String>>,
    pub pushed_tokens: Mutex<Vec<String>>,
    pub failing_tokens: Vec<String>,
    pub posted_cdrs: Mutex<Vec<Cdr>>,
    pub callbacks: Mutex<Vec<(String, CommandResponse)>>,
    pub evse_pushes: Mutex<Vec<PushEvseStatusRequest>>,
    pub refused_actions: Vec<ActionType>,
}

impl FakePartner {
    pub fn with_page(self, url: &str, items: Vec<Value>, next: Option<&str>) -> Self {
        self.pages.lock().expect("pages lock").push((
            url.to_string(),
            RemotePage {
                items,
                next: next.map(ToString::to_string),
                total_count: None,
            },
        ));
        self
    }
}

#[async_trait]
impl PartnerApi for FakePartner {
    fn endpoint_url(&self, service: &str) -> Result<String, PartnerError> {
        Ok(format!("http://partner.test/{service}"))
    }

    async fn get_page(&self, url: &str) -> Result<RemotePage, PartnerError> {
        self.fetched.lock().expect("fetched lock").push(url.to_string());
        let pages = self.pages.lock().expect("pages lock");
        pages
            .iter()
            .find(|(page_url, _)| url == page_url)
            .or_else(|| {
                pages
                    .iter()
                    .find(|(page_url, _)| url.starts_with(&format!("{page_url}?")))
            })
            .map(|(_, page)| page.clone())
            .ok_or_else(|| PartnerError::Status {
                url: url.to_string(),
                status: 404,
            })
    }

    async fn put_token(&self, token: &Token) -> Result<(), PartnerError> {
        if self.failing_tokens.contains(&token.uid) {
            return Err(PartnerError::Ocpi {
                url: format!("http://partner.test/tokens/{}", token.uid),
                status_code: 2001,
                message: "rejected".to_string(),
            });
        }
        self.pushed_tokens
            .lock()
            .expect("tokens lock")
            .push(token.uid.clone());
        Ok(())
    }

    async fn post_cdr(&self, cdr: &Cdr) -> Result<(), PartnerError> {
        self.posted_cdrs.lock().expect("cdrs lock").push(cdr.clone());
        Ok(())
    }

    async fn push_evse_statuses(&self, request: &PushEvseStatusRequest) -> Result<(), PartnerError> {
        self.evse_pushes
            .lock()
            .expect("evse pushes lock")
            .push(request.clone());
        if self.refused_actions.contains(&request.action_type) {
            return Err(PartnerError::Refused {
                url: "http://partner.test/evse_status".to_string(),
                code: "019".to_string(),
                description: "refused".to_string(),
            });
        }
        Ok(())
    }

    async fn post_command_result(
        &self,
        response_url: &str,
        response: &CommandResponse,
    ) -> Result<(), PartnerError> {
        self.callbacks
            .lock()
            .expect("callbacks lock")
            .push((response_url.to_string(), *response));
        Ok(())
    }
}

pub fn fixed_registry(partner: Arc<dyn PartnerApi>) -> ClientRegistry {
    ClientRegistry::with_factory(Arc::new(
        move |_: &RoamingEndpoint| -> Result<Arc<dyn PartnerApi>, PartnerError> {
            Ok(Arc::clone(&partner))
        },
    ))
}

pub struct FakeStations {
    pub answer: Option<StationCommandStatus>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeStations {
    pub fn answering(answer: StationCommandStatus) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(answer),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn reply(&self, call: String) -> Result<StationCommandStatus, StationCommandError> {
        self.calls.lock().expect("calls lock").push(call);
        self.answer.ok_or(StationCommandError::Status(503))
    }
}

#[async_trait]
impl ChargingStationCommands for FakeStations {
    async fn remote_start(
        &self,
        _tenant_id: &str,
        station_id: &str,
        connector_id: u32,
        tag_id: &str,
    ) -> Result<StationCommandStatus, StationCommandError> {
        self.reply(format!("start {station_id}/{connector_id} {tag_id}"))
    }

    async fn remote_stop(
        &self,
        _tenant_id: &str,
        station_id: &str,
        transaction_id: &str,
    ) -> Result<StationCommandStatus, StationCommandError> {
        self.reply(format!("stop {station_id} {transaction_id}"))
    }
}
