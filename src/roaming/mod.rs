pub mod bulk_sync;
pub mod cdr;
pub mod commands;
pub mod error;
pub mod jobs;
pub mod locations;
pub mod locking;
pub mod reconciler;
pub mod registry;
pub mod roles;
pub mod worker_pool;

use std::sync::Arc;

use crate::adapters::station_commands::ChargingStationCommands;
use crate::app::services::SqliteRoamingStore;
use crate::domain::policy::PolicyTable;
use crate::domain::session_state::{Clock, SystemClock};

use self::cdr::CdrProcessor;
use self::commands::CommandCorrelator;
use self::locking::LockService;
use self::reconciler::{LoggingObserver, SessionReconciler, TransactionObserver};
use self::registry::ClientRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub max_parallel_requests: usize,
    pub page_size: u32,
    pub lock_ttl_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_parallel_requests: 5,
            page_size: 100,
            lock_ttl_secs: 600,
        }
    }
}

#[derive(Clone)]
pub struct RoamingContext {
    pub store: SqliteRoamingStore,
    pub clock: Arc<dyn Clock>,
    pub stations: Arc<dyn ChargingStationCommands>,
    pub observer: Arc<dyn TransactionObserver>,
    pub clients: ClientRegistry,
    pub policies: Arc<PolicyTable>,
    pub settings: SyncSettings,
}

impl RoamingContext {
    pub fn new(
        store: SqliteRoamingStore,
        stations: Arc<dyn ChargingStationCommands>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            stations,
            observer: Arc::new(LoggingObserver),
            clients: ClientRegistry::http(),
            policies: Arc::new(PolicyTable::default()),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_clients(mut self, clients: ClientRegistry) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = Arc::new(policies);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn locks(&self) -> LockService {
        LockService::new(
            self.store.clone(),
            Arc::clone(&self.clock),
            self.settings.lock_ttl_secs,
        )
    }

    pub fn reconciler(&self) -> SessionReconciler {
        SessionReconciler::new(
            self.store.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.observer),
        )
    }

    pub fn cdr_processor(&self) -> CdrProcessor {
        CdrProcessor::new(
            self.store.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.observer),
        )
    }

    pub fn command_correlator(&self) -> CommandCorrelator {
        CommandCorrelator::new(
            self.store.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.stations),
        )
    }
}
