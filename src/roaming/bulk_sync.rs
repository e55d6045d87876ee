use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::adapters::db::{Condition, Filter, Paging};
use crate::adapters::partner_http::{PartnerApi, with_date_from};
use crate::domain::models::{
    ChargingStation, LastJobRun, RoamingEndpoint, Site, Tag, Transaction,
};
use crate::domain::ocpi::{Location, Token, TokenType, WhitelistType};
use crate::domain::oicp::{ActionType, EvseStatusRecord, OperatorEvseStatus, PushEvseStatusRequest};
use crate::domain::sync_result::SyncJobResult;
use crate::roaming::RoamingContext;
use crate::roaming::cdr::build_cdr;
use crate::roaming::error::RoamingError;
use crate::roaming::locations::{evse_status_records, import_location};
use crate::roaming::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    PushTokens,
    PullLocations,
    PullSessions,
    PullCdrs,
    PushCdrs,
    PushEvseStatuses,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PushTokens => "push-tokens",
            Self::PullLocations => "pull-locations",
            Self::PullSessions => "pull-sessions",
            Self::PullCdrs => "pull-cdrs",
            Self::PushCdrs => "push-cdrs",
            Self::PushEvseStatuses => "push-evse-statuses",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Refuses any URL it already handed out.
#[derive(Debug)]
pub struct PageCursor {
    pending: Option<String>,
    visited: HashSet<String>,
}

impl PageCursor {
    pub fn new(first: String) -> Self {
        Self {
            pending: Some(first),
            visited: HashSet::new(),
        }
    }

    pub fn next_url(&mut self) -> Option<String> {
        let url = self.pending.take()?;
        if !self.visited.insert(url.clone()) {
            tracing::warn!(url = %url, "partner pagination points back to a fetched page, stopping");
            return None;
        }
        Some(url)
    }

    pub fn follow(&mut self, next: Option<String>) {
        self.pending = next;
    }
}

pub fn tag_to_token(tenant_id: &str, tag: &Tag) -> Token {
    Token {
        uid: tag.id.clone(),
        token_type: TokenType::Rfid,
        auth_id: tag.user_id.clone().unwrap_or_else(|| tag.id.clone()),
        visual_number: tag.visual_id.clone(),
        issuer: tenant_id.to_string(),
        valid: tag.active,
        whitelist: WhitelistType::Allowed,
        language: None,
        last_updated: tag.last_changed_on,
    }
}

pub struct BulkSyncJob {
    ctx: RoamingContext,
    tenant_id: String,
    endpoint: RoamingEndpoint,
    client: Arc<dyn PartnerApi>,
    pool: WorkerPool,
}

impl BulkSyncJob {
    pub fn new(
        ctx: RoamingContext,
        tenant_id: &str,
        endpoint: RoamingEndpoint,
        client: Arc<dyn PartnerApi>,
    ) -> Self {
        let pool = WorkerPool::new(ctx.settings.max_parallel_requests);
        Self {
            ctx,
            tenant_id: tenant_id.to_string(),
            endpoint,
            client,
            pool,
        }
    }

    pub async fn push_tokens(&mut self, partial: bool) -> Result<SyncJobResult, RoamingError> {
        let started = self.ctx.clock.now();
        let filter = self.token_filter(partial);
        let mut result = SyncJobResult::default();

        let outcome = self.push_token_pages(&filter, &mut result).await;
        if let Err(error) = &outcome {
            result.log(format!("run aborted: {error}"));
        }
        self.persist(|endpoint| {
            endpoint.last_patch_job = Some(LastJobRun {
                on: started,
                result: result.summary(),
            });
        })?;
        outcome?;

        self.finished(JobKind::PushTokens, &result);
        Ok(result)
    }

    fn token_filter(&self, partial: bool) -> Filter {
        let filter = Filter::new().eq("$.issuer", true);
        match (&self.endpoint.last_patch_job, partial) {
            (Some(last), true) => {
                let failed = last
                    .result
                    .object_ids_in_failure
                    .iter()
                    .cloned()
                    .map(Value::from)
                    .collect();
                filter.any_of(vec![
                    Condition::In("$.id", failed),
                    Condition::After("$.last_changed_on", last.on),
                ])
            }
            _ => filter,
        }
    }

    async fn push_token_pages(
        &self,
        filter: &Filter,
        result: &mut SyncJobResult,
    ) -> Result<(), RoamingError> {
        let tenant_id = self.tenant_id.as_str();
        let client = self.client.as_ref();
        let mut paging = Paging::first(self.ctx.settings.page_size);

        loop {
            let page = self.ctx.store.find::<Tag>(tenant_id, filter, paging)?;
            if page.result.is_empty() {
                return Ok(());
            }

            let ids: Vec<String> = page.result.iter().map(|tag| tag.id.clone()).collect();
            let outcomes = self
                .pool
                .run(page.result, |tag: Tag| async move {
                    client.put_token(&tag_to_token(tenant_id, &tag)).await
                })
                .await;
            for (id, outcome) in ids.iter().zip(outcomes) {
                self.account(result, JobKind::PushTokens, id, outcome);
            }

            paging = paging.next();
        }
    }

    // One at a time: the company lookup by operator name is not atomic.
    pub async fn pull_locations(&mut self, partial: bool) -> Result<SyncJobResult, RoamingError> {
        let started = self.ctx.clock.now();
        let mut cursor = PageCursor::new(self.pull_url(JobKind::PullLocations, "locations", partial)?);
        let mut result = SyncJobResult::default();

        while let Some(url) = cursor.next_url() {
            let page = self.client.get_page(&url).await?;
            for item in &page.items {
                let imported = serde_json::from_value::<Location>(item.clone())
                    .map_err(|error| RoamingError::InvalidParameters(error.to_string()))
                    .and_then(|location| {
                        import_location(&self.ctx.store, &self.tenant_id, &location, started)
                    });
                self.account(&mut result, JobKind::PullLocations, &item_id(item), imported);
            }
            cursor.follow(page.next);
        }

        self.record_pull(JobKind::PullLocations, started, &result)?;
        Ok(result)
    }

    pub async fn pull_sessions(&mut self, partial: bool) -> Result<SyncJobResult, RoamingError> {
        let reconciler = self.ctx.reconciler();
        self.pull_concurrently(JobKind::PullSessions, "sessions", partial, |tenant_id, item| {
            reconciler
                .reconcile_value(tenant_id, item)
                .map(|outcome| tracing::debug!(tenant = %tenant_id, outcome = ?outcome, "session pulled"))
        })
        .await
    }

    pub async fn pull_cdrs(&mut self, partial: bool) -> Result<SyncJobResult, RoamingError> {
        let processor = self.ctx.cdr_processor();
        self.pull_concurrently(JobKind::PullCdrs, "cdrs", partial, |tenant_id, item| {
            processor.process_value(tenant_id, item).map(|_| ())
        })
        .await
    }

    async fn pull_concurrently<F>(
        &mut self,
        kind: JobKind,
        service: &str,
        partial: bool,
        apply: F,
    ) -> Result<SyncJobResult, RoamingError>
    where
        F: Fn(&str, &Value) -> Result<(), RoamingError> + Sync,
    {
        let started = self.ctx.clock.now();
        let mut cursor = PageCursor::new(self.pull_url(kind, service, partial)?);
        let mut result = SyncJobResult::default();
        let tenant_id = self.tenant_id.as_str();
        let apply = &apply;

        while let Some(url) = cursor.next_url() {
            let page = self.client.get_page(&url).await?;
            let ids: Vec<String> = page.items.iter().map(item_id).collect();
            let outcomes = self
                .pool
                .run(page.items, |item: Value| async move { apply(tenant_id, &item) })
                .await;
            for (id, outcome) in ids.iter().zip(outcomes) {
                self.account(&mut result, kind, id, outcome);
            }
            cursor.follow(page.next);
        }

        self.record_pull(kind, started, &result)?;
        Ok(result)
    }

    pub async fn push_cdrs(&mut self) -> Result<SyncJobResult, RoamingError> {
        let candidates = self.cdr_candidates()?;
        let ids: Vec<String> = candidates.iter().map(|tx| tx.id.clone()).collect();
        let mut result = SyncJobResult::default();

        let this = &*self;
        let outcomes = self
            .pool
            .run(candidates, |transaction: Transaction| this.push_cdr(transaction))
            .await;
        for (id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                Ok(true) => result.record_success(),
                Ok(false) => result.log(format!("{id}: skipped, already pushed or locked")),
                Err(error) => {
                    tracing::warn!(
                        tenant = %self.tenant_id,
                        transaction_id = %id,
                        error = %error,
                        "cdr push failed"
                    );
                    result.record_failure(id, error.to_string());
                }
            }
        }

        self.finished(JobKind::PushCdrs, &result);
        Ok(result)
    }

    fn cdr_candidates(&self) -> Result<Vec<Transaction>, RoamingError> {
        let filter = Filter::new()
            .eq("$.issuer", true)
            .not_null("$.stop")
            .is_null("$.roaming_data.cdr");
        let mut paging = Paging::first(self.ctx.settings.page_size);
        let mut candidates = Vec::new();

        loop {
            let page = self
                .ctx
                .store
                .find::<Transaction>(&self.tenant_id, &filter, paging)?;
            if page.result.is_empty() {
                return Ok(candidates);
            }
            for transaction in page.result {
                let tag: Option<Tag> = self.ctx.store.get(&self.tenant_id, &transaction.tag_id)?;
                if tag.is_some_and(|tag| !tag.issuer) {
                    candidates.push(transaction);
                }
            }
            paging = paging.next();
        }
    }

    async fn push_cdr(&self, candidate: Transaction) -> Result<bool, RoamingError> {
        let lock_name = format!("push-cdr-{}", candidate.id);
        let locks = self.ctx.locks();
        let pushed = locks
            .run_exclusive(&self.tenant_id, &lock_name, self.push_cdr_locked(&candidate.id))
            .await?;
        Ok(pushed.unwrap_or(false))
    }

    async fn push_cdr_locked(&self, transaction_id: &str) -> Result<bool, RoamingError> {
        let store = &self.ctx.store;
        let Some(mut transaction) = store.get::<Transaction>(&self.tenant_id, transaction_id)? else {
            return Ok(false);
        };
        if transaction.roaming_data.cdr.is_some() {
            return Ok(false);
        }

        let station: ChargingStation = store
            .get(&self.tenant_id, &transaction.charge_box_id)?
            .ok_or_else(|| RoamingError::UnknownStation(transaction.charge_box_id.clone()))?;
        let site: Option<Site> = match station.site_id.as_deref() {
            Some(site_id) => store.get(&self.tenant_id, site_id)?,
            None => None,
        };
        let tag: Tag = store
            .get(&self.tenant_id, &transaction.tag_id)?
            .ok_or_else(|| RoamingError::UnknownTag(transaction.tag_id.clone()))?;

        let now = self.ctx.clock.now();
        let cdr = build_cdr(
            &self.tenant_id,
            &transaction,
            &station,
            site.as_ref(),
            &tag,
            &self.ctx.policies,
            now,
        )?;
        self.client.post_cdr(&cdr).await?;

        transaction.roaming_data.cdr = Some(cdr);
        transaction.roaming_data.cdr_pushed_on = Some(now);
        store.upsert(&self.tenant_id, &transaction)?;
        tracing::info!(
            tenant = %self.tenant_id,
            transaction_id = %transaction.id,
            endpoint = %self.endpoint.id,
            "cdr pushed to partner"
        );
        Ok(true)
    }

    pub async fn push_evse_statuses(
        &mut self,
        partial: bool,
    ) -> Result<SyncJobResult, RoamingError> {
        let started = self.ctx.clock.now();
        let since = match &self.endpoint.last_patch_job {
            Some(last) if partial && last.result.failure == 0 => Some(last.on),
            _ => None,
        };
        let operator_id = format!("{}*{}", self.endpoint.country_code, self.endpoint.party_id);
        let requests: Vec<PushEvseStatusRequest> = self
            .evse_status_batches(since)?
            .into_iter()
            .map(|(action_type, records)| PushEvseStatusRequest {
                action_type,
                operator_evse_status: OperatorEvseStatus {
                    operator_id: operator_id.clone(),
                    operator_name: None,
                    evse_status_record: records,
                },
            })
            .collect();

        let batches: Vec<(ActionType, Vec<String>)> = requests
            .iter()
            .map(|request| (request.action_type, request.evse_ids()))
            .collect();
        let client = self.client.as_ref();
        let outcomes = self
            .pool
            .run(requests, |request: PushEvseStatusRequest| async move {
                client.push_evse_statuses(&request).await
            })
            .await;

        let mut result = SyncJobResult::default();
        for ((action_type, evse_ids), outcome) in batches.into_iter().zip(outcomes) {
            let mut batch = SyncJobResult::default();
            match outcome {
                Ok(()) => {
                    for _ in &evse_ids {
                        batch.record_success();
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        tenant = %self.tenant_id,
                        endpoint = %self.endpoint.id,
                        action = ?action_type,
                        records = evse_ids.len(),
                        error = %error,
                        "evse status batch failed"
                    );
                    for evse_id in &evse_ids {
                        batch.record_failure(evse_id, error.to_string());
                    }
                }
            }
            result.merge(batch);
        }

        self.persist(|endpoint| {
            endpoint.last_patch_job = Some(LastJobRun {
                on: started,
                result: result.summary(),
            });
        })?;
        self.finished(JobKind::PushEvseStatuses, &result);
        Ok(result)
    }

    fn evse_status_batches(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(ActionType, Vec<EvseStatusRecord>)>, RoamingError> {
        let mut filter = Filter::new().eq("$.issuer", true);
        if let Some(since) = since {
            filter = filter.after("$.last_changed_on", since);
        }
        let mut paging = Paging::first(self.ctx.settings.page_size);
        let mut published = Vec::new();
        let mut withdrawn = Vec::new();

        loop {
            let page = self
                .ctx
                .store
                .find::<ChargingStation>(&self.tenant_id, &filter, paging)?;
            if page.result.is_empty() {
                break;
            }
            for station in &page.result {
                if station.public {
                    published.extend(evse_status_records(station));
                } else {
                    withdrawn.extend(evse_status_records(station));
                }
            }
            paging = paging.next();
        }

        if since.is_none() {
            return Ok(vec![(ActionType::FullLoad, published)]);
        }
        let batch_size = self.ctx.settings.page_size.max(1) as usize;
        Ok(published
            .chunks(batch_size)
            .map(|chunk| (ActionType::Update, chunk.to_vec()))
            .chain(
                withdrawn
                    .chunks(batch_size)
                    .map(|chunk| (ActionType::Delete, chunk.to_vec())),
            )
            .collect())
    }

    fn pull_url(&self, kind: JobKind, service: &str, partial: bool) -> Result<String, RoamingError> {
        let url = self.client.endpoint_url(service)?;
        match self.endpoint.last_pull_jobs.get(kind.as_str()) {
            Some(last) if partial => Ok(with_date_from(&url, last.on)?),
            _ => Ok(url),
        }
    }

    fn account<T, E: fmt::Display>(
        &self,
        result: &mut SyncJobResult,
        kind: JobKind,
        object_id: &str,
        outcome: Result<T, E>,
    ) {
        match outcome {
            Ok(_) => result.record_success(),
            Err(error) => {
                tracing::warn!(
                    tenant = %self.tenant_id,
                    endpoint = %self.endpoint.id,
                    job = %kind,
                    object_id,
                    error = %error,
                    "item failed"
                );
                result.record_failure(object_id, error.to_string());
            }
        }
    }

    fn record_pull(
        &mut self,
        kind: JobKind,
        started: DateTime<Utc>,
        result: &SyncJobResult,
    ) -> Result<(), RoamingError> {
        self.persist(|endpoint| {
            endpoint.last_pull_jobs.insert(
                kind.as_str().to_string(),
                LastJobRun {
                    on: started,
                    result: result.summary(),
                },
            );
        })?;
        self.finished(kind, result);
        Ok(())
    }

    fn persist(&mut self, update: impl FnOnce(&mut RoamingEndpoint)) -> Result<(), RoamingError> {
        let mut endpoint = self
            .ctx
            .store
            .get::<RoamingEndpoint>(&self.tenant_id, &self.endpoint.id)?
            .unwrap_or_else(|| self.endpoint.clone());
        update(&mut endpoint);
        self.ctx.store.upsert(&self.tenant_id, &endpoint)?;
        self.endpoint = endpoint;
        Ok(())
    }

    fn finished(&self, kind: JobKind, result: &SyncJobResult) {
        tracing::info!(
            tenant = %self.tenant_id,
            endpoint = %self.endpoint.id,
            job = %kind,
            success = result.success,
            failure = result.failure,
            total = result.total,
            "sync job finished"
        );
    }
}

fn item_id(item: &Value) -> String {
    item.get("id")
        .and_then(Value::as_str)
        .unwrap_or("<no id>")
        .to_string()
}
