use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::adapters::partner_http::{PartnerApi, PartnerClient, PartnerError};
use crate::domain::models::RoamingEndpoint;

pub type ClientFactory =
    Arc<dyn Fn(&RoamingEndpoint) -> Result<Arc<dyn PartnerApi>, PartnerError> + Send + Sync>;

struct CachedClient {
    fingerprint: String,
    client: Arc<dyn PartnerApi>,
}

#[derive(Clone)]
pub struct ClientRegistry {
    factory: ClientFactory,
    clients: Arc<RwLock<HashMap<(String, String), CachedClient>>>,
}

impl ClientRegistry {
    pub fn http() -> Self {
        Self::with_factory(Arc::new(
            |endpoint: &RoamingEndpoint| -> Result<Arc<dyn PartnerApi>, PartnerError> {
                let client = PartnerClient::new(endpoint)?;
                Ok(Arc::new(client))
            },
        ))
    }

    pub fn with_factory(factory: ClientFactory) -> Self {
        Self {
            factory,
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn client_for(
        &self,
        tenant_id: &str,
        endpoint: &RoamingEndpoint,
    ) -> Result<Arc<dyn PartnerApi>, PartnerError> {
        let key = (tenant_id.to_string(), endpoint.id.clone());
        let fingerprint = fingerprint(endpoint);

        if let Some(cached) = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .filter(|cached| cached.fingerprint == fingerprint)
        {
            return Ok(Arc::clone(&cached.client));
        }

        let client = (self.factory)(endpoint)?;
        tracing::debug!(tenant = %tenant_id, endpoint = %endpoint.id, "partner client built");
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                CachedClient {
                    fingerprint,
                    client: Arc::clone(&client),
                },
            );

        Ok(client)
    }

    pub fn evict(&self, tenant_id: &str, endpoint_id: &str) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(tenant_id.to_string(), endpoint_id.to_string()));
    }
}

fn fingerprint(endpoint: &RoamingEndpoint) -> String {
    let modules: Vec<String> = endpoint
        .endpoints
        .iter()
        .map(|(service, url)| format!("{service}={url}"))
        .collect();
    format!(
        "{}|{}|{}",
        endpoint.base_url,
        endpoint.partner_token,
        modules.join(",")
    )
}
