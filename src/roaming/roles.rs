use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::partner_http::PartnerApi;
use crate::domain::models::{RoamingEndpoint, RoamingProtocol, RoamingRole};
use crate::domain::sync_result::{SyncJobResult, SyncJobSummary};
use crate::roaming::RoamingContext;
use crate::roaming::bulk_sync::{BulkSyncJob, JobKind};
use crate::roaming::error::RoamingError;

pub const OCPI_VERSION: &str = "2.1.1";
pub const OICP_VERSION: &str = "2.3";

const EMSP_JOBS: &[JobKind] = &[
    JobKind::PushTokens,
    JobKind::PullLocations,
    JobKind::PullSessions,
    JobKind::PullCdrs,
];
const CPO_JOBS: &[JobKind] = &[JobKind::PushCdrs];
const OICP_CPO_JOBS: &[JobKind] = &[JobKind::PushEvseStatuses];

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(SyncJobSummary),
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub kind: JobKind,
    pub outcome: JobOutcome,
}

#[async_trait]
pub trait RoamingRoleClient: Send + Sync {
    fn role(&self) -> RoamingRole;
    fn context(&self) -> &RoamingContext;
    fn tenant_id(&self) -> &str;
    fn scheduled_jobs(&self) -> &'static [JobKind];

    async fn push_tokens(&self, _partial: bool) -> Result<SyncJobResult, RoamingError> {
        Err(unsupported(self.role(), "push tokens"))
    }

    async fn pull_locations(&self, _partial: bool) -> Result<SyncJobResult, RoamingError> {
        Err(unsupported(self.role(), "pull locations"))
    }

    async fn pull_sessions(&self, _partial: bool) -> Result<SyncJobResult, RoamingError> {
        Err(unsupported(self.role(), "pull sessions"))
    }

    async fn pull_cdrs(&self, _partial: bool) -> Result<SyncJobResult, RoamingError> {
        Err(unsupported(self.role(), "pull cdrs"))
    }

    async fn push_cdrs(&self) -> Result<SyncJobResult, RoamingError> {
        Err(unsupported(self.role(), "push cdrs"))
    }

    async fn push_evse_statuses(&self, _partial: bool) -> Result<SyncJobResult, RoamingError> {
        Err(unsupported(self.role(), "push evse statuses"))
    }

    // Scheduled runs are always deltas.
    async fn run_job(&self, kind: JobKind) -> Result<SyncJobResult, RoamingError> {
        match kind {
            JobKind::PushTokens => self.push_tokens(true).await,
            JobKind::PullLocations => self.pull_locations(true).await,
            JobKind::PullSessions => self.pull_sessions(true).await,
            JobKind::PullCdrs => self.pull_cdrs(true).await,
            JobKind::PushCdrs => self.push_cdrs().await,
            JobKind::PushEvseStatuses => self.push_evse_statuses(true).await,
        }
    }

    // Lock name is `<role>-<job>`.
    async fn trigger_jobs(&self) -> Vec<JobReport> {
        let locks = self.context().locks();
        let mut reports = Vec::with_capacity(self.scheduled_jobs().len());

        for &kind in self.scheduled_jobs() {
            let lock_name = format!("{}-{}", self.role().as_str(), kind.as_str());
            let outcome = match locks
                .run_exclusive(self.tenant_id(), &lock_name, self.run_job(kind))
                .await
            {
                Ok(Some(result)) => JobOutcome::Completed(result.summary()),
                Ok(None) => JobOutcome::Skipped,
                Err(error) => {
                    tracing::error!(
                        tenant = %self.tenant_id(),
                        job = %kind,
                        error = %error,
                        "sync job failed"
                    );
                    JobOutcome::Failed(error.to_string())
                }
            };
            reports.push(JobReport { kind, outcome });
        }

        reports
    }
}

fn unsupported(role: RoamingRole, operation: &'static str) -> RoamingError {
    RoamingError::UnsupportedOperation {
        role: role.as_str(),
        operation,
    }
}

struct PartnerLink {
    ctx: RoamingContext,
    tenant_id: String,
    endpoint: RoamingEndpoint,
    client: Arc<dyn PartnerApi>,
}

impl PartnerLink {
    fn job(&self) -> Result<BulkSyncJob, RoamingError> {
        let endpoint = self
            .ctx
            .store
            .get::<RoamingEndpoint>(&self.tenant_id, &self.endpoint.id)?
            .unwrap_or_else(|| self.endpoint.clone());
        Ok(BulkSyncJob::new(
            self.ctx.clone(),
            &self.tenant_id,
            endpoint,
            Arc::clone(&self.client),
        ))
    }
}

pub struct EmspRoleClient {
    link: PartnerLink,
}

#[async_trait]
impl RoamingRoleClient for EmspRoleClient {
    fn role(&self) -> RoamingRole {
        RoamingRole::Emsp
    }

    fn context(&self) -> &RoamingContext {
        &self.link.ctx
    }

    fn tenant_id(&self) -> &str {
        &self.link.tenant_id
    }

    fn scheduled_jobs(&self) -> &'static [JobKind] {
        EMSP_JOBS
    }

    async fn push_tokens(&self, partial: bool) -> Result<SyncJobResult, RoamingError> {
        self.link.job()?.push_tokens(partial).await
    }

    async fn pull_locations(&self, partial: bool) -> Result<SyncJobResult, RoamingError> {
        self.link.job()?.pull_locations(partial).await
    }

    async fn pull_sessions(&self, partial: bool) -> Result<SyncJobResult, RoamingError> {
        self.link.job()?.pull_sessions(partial).await
    }

    async fn pull_cdrs(&self, partial: bool) -> Result<SyncJobResult, RoamingError> {
        self.link.job()?.pull_cdrs(partial).await
    }
}

pub struct CpoRoleClient {
    link: PartnerLink,
}

#[async_trait]
impl RoamingRoleClient for CpoRoleClient {
    fn role(&self) -> RoamingRole {
        RoamingRole::Cpo
    }

    fn context(&self) -> &RoamingContext {
        &self.link.ctx
    }

    fn tenant_id(&self) -> &str {
        &self.link.tenant_id
    }

    fn scheduled_jobs(&self) -> &'static [JobKind] {
        CPO_JOBS
    }

    async fn push_cdrs(&self) -> Result<SyncJobResult, RoamingError> {
        self.link.job()?.push_cdrs().await
    }
}

pub struct OicpCpoRoleClient {
    link: PartnerLink,
}

#[async_trait]
impl RoamingRoleClient for OicpCpoRoleClient {
    fn role(&self) -> RoamingRole {
        RoamingRole::Cpo
    }

    fn context(&self) -> &RoamingContext {
        &self.link.ctx
    }

    fn tenant_id(&self) -> &str {
        &self.link.tenant_id
    }

    fn scheduled_jobs(&self) -> &'static [JobKind] {
        OICP_CPO_JOBS
    }

    async fn push_evse_statuses(&self, partial: bool) -> Result<SyncJobResult, RoamingError> {
        self.link.job()?.push_evse_statuses(partial).await
    }
}

#[derive(Clone, Copy)]
enum RoleKind {
    OcpiEmsp,
    OcpiCpo,
    OicpCpo,
}

fn role_kind(endpoint: &RoamingEndpoint) -> Option<RoleKind> {
    match (endpoint.protocol, endpoint.role, endpoint.version.as_str()) {
        (RoamingProtocol::Ocpi, RoamingRole::Emsp, OCPI_VERSION) => Some(RoleKind::OcpiEmsp),
        (RoamingProtocol::Ocpi, RoamingRole::Cpo, OCPI_VERSION) => Some(RoleKind::OcpiCpo),
        (RoamingProtocol::Oicp, RoamingRole::Cpo, OICP_VERSION) => Some(RoleKind::OicpCpo),
        _ => None,
    }
}

pub fn role_client(
    ctx: &RoamingContext,
    tenant_id: &str,
    endpoint: &RoamingEndpoint,
) -> Result<Box<dyn RoamingRoleClient>, RoamingError> {
    let Some(kind) = role_kind(endpoint) else {
        return Err(RoamingError::UnsupportedVersion {
            role: format!("{}-{}", endpoint.protocol.as_str(), endpoint.role.as_str()),
            version: endpoint.version.clone(),
        });
    };

    let link = PartnerLink {
        ctx: ctx.clone(),
        tenant_id: tenant_id.to_string(),
        endpoint: endpoint.clone(),
        client: ctx.clients.client_for(tenant_id, endpoint)?,
    };
    let client: Box<dyn RoamingRoleClient> = match kind {
        RoleKind::OcpiEmsp => Box::new(EmspRoleClient { link }),
        RoleKind::OcpiCpo => Box::new(CpoRoleClient { link }),
        RoleKind::OicpCpo => Box::new(OicpCpoRoleClient { link }),
    };
    Ok(client)
}
