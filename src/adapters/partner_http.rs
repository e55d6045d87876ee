use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, LINK};
use reqwest::{Client, RequestBuilder, Url};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::models::RoamingEndpoint;
use crate::domain::ocpi::{
    Cdr, CommandResponse, OcpiResponse, Token, VersionDetails, VersionEntry,
};
use crate::domain::oicp::{Acknowledgement, PushEvseStatusRequest};

#[derive(Debug, Error)]
pub enum PartnerError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("partner answered {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("partner returned OCPI status {status_code} for {url}: {message}")]
    Ocpi {
        url: String,
        status_code: u32,
        message: String,
    },
    #[error("partner refused the push to {url} with code {code}: {description}")]
    Refused {
        url: String,
        code: String,
        description: String,
    },
    #[error("partner payload for {url} is not usable: {reason}")]
    UnexpectedPayload { url: String, reason: String },
    #[error("service {0} is not published by the partner")]
    UnknownService(String),
    #[error("invalid partner url: {0}")]
    InvalidUrl(String),
    #[error("partner does not offer version {0}")]
    MissingVersion(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemotePage {
    pub items: Vec<Value>,
    pub next: Option<String>,
    pub total_count: Option<u64>,
}

#[async_trait]
pub trait PartnerApi: Send + Sync {
    fn endpoint_url(&self, service: &str) -> Result<String, PartnerError>;
    async fn get_page(&self, url: &str) -> Result<RemotePage, PartnerError>;
    async fn put_token(&self, token: &Token) -> Result<(), PartnerError>;
    async fn post_cdr(&self, cdr: &Cdr) -> Result<(), PartnerError>;
    async fn push_evse_statuses(&self, request: &PushEvseStatusRequest) -> Result<(), PartnerError>;
    async fn post_command_result(
        &self,
        response_url: &str,
        response: &CommandResponse,
    ) -> Result<(), PartnerError>;
}

#[derive(Debug, Clone)]
pub struct PartnerClient {
    http: Client,
    endpoints: BTreeMap<String, String>,
    partner_token: String,
    country_code: String,
    party_id: String,
}

impl PartnerClient {
    pub fn new(endpoint: &RoamingEndpoint) -> Result<Self, PartnerError> {
        Ok(Self {
            http: Client::builder().build()?,
            endpoints: endpoint.endpoints.clone(),
            partner_token: endpoint.partner_token.clone(),
            country_code: endpoint.country_code.clone(),
            party_id: endpoint.party_id.clone(),
        })
    }

    pub async fn discover_endpoints(
        &self,
        versions_url: &str,
        version: &str,
    ) -> Result<BTreeMap<String, String>, PartnerError> {
        let (versions, _) = self
            .send::<Vec<VersionEntry>>(self.http.get(versions_url), versions_url)
            .await?;
        let details_url = versions
            .into_iter()
            .find(|entry| entry.version == version)
            .map(|entry| entry.url)
            .ok_or_else(|| PartnerError::MissingVersion(version.to_string()))?;

        let (details, _) = self
            .send::<VersionDetails>(self.http.get(&details_url), &details_url)
            .await?;

        Ok(details
            .endpoints
            .into_iter()
            .map(|entry| (entry.identifier, entry.url))
            .collect())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(AUTHORIZATION, format!("Token {}", self.partner_token))
    }

    async fn send<T>(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<(T, HeaderMap), PartnerError>
    where
        T: serde::de::DeserializeOwned,
    {
        let (envelope, headers) = self.send_envelope(request, url).await?;
        let data = envelope.data.ok_or_else(|| PartnerError::UnexpectedPayload {
            url: url.to_string(),
            reason: "response has no data".to_string(),
        })?;
        let data = serde_json::from_value(data).map_err(|error| PartnerError::UnexpectedPayload {
            url: url.to_string(),
            reason: error.to_string(),
        })?;
        Ok((data, headers))
    }

    async fn send_envelope(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<(OcpiResponse<Value>, HeaderMap), PartnerError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PartnerError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let headers = response.headers().clone();
        let envelope: OcpiResponse<Value> = response.json().await?;
        if !envelope.is_success() {
            return Err(PartnerError::Ocpi {
                url: url.to_string(),
                status_code: envelope.status_code,
                message: envelope.status_message.unwrap_or_default(),
            });
        }

        Ok((envelope, headers))
    }

    async fn send_json<B: Serialize + Sync>(
        &self,
        request: RequestBuilder,
        url: &str,
        body: &B,
    ) -> Result<(), PartnerError> {
        self.send_envelope(request.json(body), url).await?;
        Ok(())
    }
}

#[async_trait]
impl PartnerApi for PartnerClient {
    fn endpoint_url(&self, service: &str) -> Result<String, PartnerError> {
        self.endpoints
            .get(service)
            .cloned()
            .ok_or_else(|| PartnerError::UnknownService(service.to_string()))
    }

    async fn get_page(&self, url: &str) -> Result<RemotePage, PartnerError> {
        let (envelope, headers) = self.send_envelope(self.http.get(url), url).await?;

        let items = match envelope.data {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(PartnerError::UnexpectedPayload {
                    url: url.to_string(),
                    reason: "data is not a list".to_string(),
                });
            }
        };

        let next = headers
            .get_all(LINK)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(parse_next_link);
        let total_count = headers
            .get("X-Total-Count")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok());

        Ok(RemotePage {
            items,
            next,
            total_count,
        })
    }

    async fn put_token(&self, token: &Token) -> Result<(), PartnerError> {
        let url = token_url(
            &self.endpoint_url("tokens")?,
            &self.country_code,
            &self.party_id,
            &token.uid,
        )?;
        self.send_json(self.http.put(&url), &url, token).await
    }

    async fn post_cdr(&self, cdr: &Cdr) -> Result<(), PartnerError> {
        let url = self.endpoint_url("cdrs")?;
        self.send_json(self.http.post(&url), &url, cdr).await
    }

    async fn push_evse_statuses(&self, request: &PushEvseStatusRequest) -> Result<(), PartnerError> {
        let url = self.endpoint_url("evse_status")?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.partner_token)
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PartnerError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let ack: Acknowledgement = response.json().await?;
        if !ack.result {
            return Err(PartnerError::Refused {
                url,
                code: ack.status_code.code,
                description: ack.status_code.description.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn post_command_result(
        &self,
        response_url: &str,
        response: &CommandResponse,
    ) -> Result<(), PartnerError> {
        let url = Url::parse(response_url)
            .map_err(|error| PartnerError::InvalidUrl(format!("{response_url}: {error}")))?;
        let reply = self
            .authorized(self.http.post(url).json(response))
            .send()
            .await?;
        if !reply.status().is_success() {
            return Err(PartnerError::Status {
                url: response_url.to_string(),
                status: reply.status().as_u16(),
            });
        }
        Ok(())
    }
}

// {base}/{country_code}/{party_id}/{uid}, each segment percent-encoded
pub fn token_url(
    base: &str,
    country_code: &str,
    party_id: &str,
    uid: &str,
) -> Result<String, PartnerError> {
    let mut url =
        Url::parse(base).map_err(|error| PartnerError::InvalidUrl(format!("{base}: {error}")))?;
    url.path_segments_mut()
        .map_err(|_| PartnerError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend([country_code, party_id, uid]);
    Ok(url.to_string())
}

pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param.eq_ignore_ascii_case("rel=\"next\"") || param.eq_ignore_ascii_case("rel=next")
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .map(ToString::to_string)
            .filter(|url| !url.is_empty())
    })
}

pub fn with_date_from(url: &str, since: chrono::DateTime<chrono::Utc>) -> Result<String, PartnerError> {
    let mut parsed =
        Url::parse(url).map_err(|error| PartnerError::InvalidUrl(format!("{url}: {error}")))?;
    parsed.query_pairs_mut().append_pair(
        "date_from",
        &since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    Ok(parsed.to_string())
}
