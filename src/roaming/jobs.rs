use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;

use crate::adapters::db::{Filter, Paging};
use crate::adapters::partner_http::PartnerClient;
use crate::domain::models::RoamingEndpoint;
use crate::roaming::RoamingContext;
use crate::roaming::error::RoamingError;
use crate::roaming::roles::{JobReport, role_client};

const ENDPOINT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRun {
    pub tenant_id: String,
    pub endpoint_id: String,
    pub outcome: Result<Vec<JobReport>, String>,
}

#[derive(Clone)]
pub struct JobScheduler {
    ctx: RoamingContext,
}

impl JobScheduler {
    pub fn new(ctx: RoamingContext) -> Self {
        Self { ctx }
    }

    pub async fn run_cycle(&self) -> Result<Vec<EndpointRun>, RoamingError> {
        let tenants = self.ctx.store.tenants_with_endpoints()?;

        let mut handles = Vec::with_capacity(tenants.len());
        for tenant_id in &tenants {
            let scheduler = self.clone();
            let tenant_id = tenant_id.clone();
            handles.push(tokio::spawn(async move { scheduler.run_tenant(&tenant_id).await }));
        }

        let mut runs = Vec::new();
        for (tenant_id, joined) in tenants.iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(tenant_runs)) => runs.extend(tenant_runs),
                Ok(Err(error)) => {
                    tracing::error!(tenant = %tenant_id, error = %error, "tenant job run failed");
                }
                Err(error) => {
                    tracing::error!(tenant = %tenant_id, error = %error, "tenant job task aborted");
                }
            }
        }
        Ok(runs)
    }

    pub async fn run_tenant(&self, tenant_id: &str) -> Result<Vec<EndpointRun>, RoamingError> {
        let mut runs = Vec::new();
        for endpoint in self.scheduled_endpoints(tenant_id)? {
            let endpoint_id = endpoint.id.clone();
            let outcome = self
                .trigger_endpoint(tenant_id, endpoint)
                .await
                .map_err(|error| {
                    tracing::warn!(
                        tenant = %tenant_id,
                        endpoint = %endpoint_id,
                        error = %error,
                        "endpoint skipped"
                    );
                    error.to_string()
                });
            runs.push(EndpointRun {
                tenant_id: tenant_id.to_string(),
                endpoint_id,
                outcome,
            });
        }
        Ok(runs)
    }

    pub async fn run_forever(&self, every: Duration, stop: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !stop.load(Ordering::Relaxed) {
            ticker.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match self.run_cycle().await {
                Ok(runs) => tracing::info!(endpoints = runs.len(), "job cycle finished"),
                Err(error) => tracing::warn!(error = %error, "job cycle failed"),
            }
        }
    }

    fn scheduled_endpoints(&self, tenant_id: &str) -> Result<Vec<RoamingEndpoint>, RoamingError> {
        let filter = Filter::new().eq("$.background_patch_job", true);
        let mut paging = Paging::first(ENDPOINT_PAGE_SIZE);
        let mut endpoints = Vec::new();

        loop {
            let page = self
                .ctx
                .store
                .find::<RoamingEndpoint>(tenant_id, &filter, paging)?;
            if page.result.is_empty() {
                return Ok(endpoints);
            }
            endpoints.extend(page.result);
            paging = paging.next();
        }
    }

    async fn trigger_endpoint(
        &self,
        tenant_id: &str,
        endpoint: RoamingEndpoint,
    ) -> Result<Vec<JobReport>, RoamingError> {
        let endpoint = if endpoint.endpoints.is_empty() {
            self.discover(tenant_id, endpoint).await?
        } else {
            endpoint
        };
        let client = role_client(&self.ctx, tenant_id, &endpoint)?;
        Ok(client.trigger_jobs().await)
    }

    async fn discover(
        &self,
        tenant_id: &str,
        mut endpoint: RoamingEndpoint,
    ) -> Result<RoamingEndpoint, RoamingError> {
        let client = PartnerClient::new(&endpoint)?;
        endpoint.endpoints = client
            .discover_endpoints(&endpoint.base_url, &endpoint.version)
            .await?;
        self.ctx.store.upsert(tenant_id, &endpoint)?;
        self.ctx.clients.evict(tenant_id, &endpoint.id);

        tracing::info!(
            tenant = %tenant_id,
            endpoint = %endpoint.id,
            modules = endpoint.endpoints.len(),
            "partner modules discovered"
        );
        Ok(endpoint)
    }
}
