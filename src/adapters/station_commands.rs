use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[async_trait]
pub trait ChargingStationCommands: Send + Sync + 'static {
    async fn remote_start(
        &self,
        tenant_id: &str,
        station_id: &str,
        connector_id: u32,
        tag_id: &str,
    ) -> Result<StationCommandStatus, StationCommandError>;

    async fn remote_stop(
        &self,
        tenant_id: &str,
        station_id: &str,
        transaction_id: &str,
    ) -> Result<StationCommandStatus, StationCommandError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationCommandStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Error)]
pub enum StationCommandError {
    #[error("station gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("station gateway answered {0}")]
    Status(u16),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteStartRequest<'a> {
    connector_id: u32,
    id_tag: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteStopRequest<'a> {
    transaction_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct GatewayReply {
    status: StationCommandStatus,
}

#[derive(Debug, Clone)]
pub struct HttpStationCommandClient {
    http: Client,
    base_url: String,
}

impl HttpStationCommandClient {
    pub fn new(base_url: &str) -> Result<Self, StationCommandError> {
        Ok(Self {
            http: Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn command_url(&self, tenant_id: &str, station_id: &str, command: &str) -> String {
        format!(
            "{}/tenants/{tenant_id}/charging-stations/{station_id}/{command}",
            self.base_url
        )
    }

    async fn dispatch<B: Serialize + Sync>(
        &self,
        url: String,
        body: &B,
    ) -> Result<StationCommandStatus, StationCommandError> {
        let response = self.http.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(StationCommandError::Status(response.status().as_u16()));
        }
        let reply: GatewayReply = response.json().await?;
        Ok(reply.status)
    }
}

#[async_trait]
impl ChargingStationCommands for HttpStationCommandClient {
    async fn remote_start(
        &self,
        tenant_id: &str,
        station_id: &str,
        connector_id: u32,
        tag_id: &str,
    ) -> Result<StationCommandStatus, StationCommandError> {
        let url = self.command_url(tenant_id, station_id, "remote-start");
        self.dispatch(
            url,
            &RemoteStartRequest {
                connector_id,
                id_tag: tag_id,
            },
        )
        .await
    }

    async fn remote_stop(
        &self,
        tenant_id: &str,
        station_id: &str,
        transaction_id: &str,
    ) -> Result<StationCommandStatus, StationCommandError> {
        let url = self.command_url(tenant_id, station_id, "remote-stop");
        self.dispatch(url, &RemoteStopRequest { transaction_id })
            .await
    }
}
