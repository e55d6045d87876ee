use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse policy file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate policy entry for {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TariffPolicy {
    pub tariff_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PolicyEntry {
    tenant_id: String,
    #[serde(default)]
    site_area_id: Option<String>,
    #[serde(default)]
    station_id: Option<String>,
    tariff_id: String,
}

type PolicyKey = (String, Option<String>, Option<String>);

#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    entries: HashMap<PolicyKey, TariffPolicy>,
}

impl PolicyTable {
    pub fn from_file(path: &str) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, PolicyError> {
        let raw: Vec<PolicyEntry> = serde_json::from_str(content)?;
        let mut entries = HashMap::with_capacity(raw.len());

        for entry in raw {
            let key = (
                entry.tenant_id.clone(),
                entry.site_area_id.clone(),
                entry.station_id.clone(),
            );
            if entries.contains_key(&key) {
                return Err(PolicyError::Duplicate(format!(
                    "tenant={} site_area={:?} station={:?}",
                    entry.tenant_id, entry.site_area_id, entry.station_id
                )));
            }
            entries.insert(
                key,
                TariffPolicy {
                    tariff_id: entry.tariff_id,
                },
            );
        }

        Ok(Self { entries })
    }

    pub fn tariff_for(
        &self,
        tenant_id: &str,
        site_area_id: Option<&str>,
        station_id: &str,
    ) -> Option<&TariffPolicy> {
        let tenant = tenant_id.to_string();
        let site_area = site_area_id.map(ToString::to_string);

        self.entries
            .get(&(tenant.clone(), site_area.clone(), Some(station_id.to_string())))
            .or_else(|| self.entries.get(&(tenant.clone(), None, Some(station_id.to_string()))))
            .or_else(|| {
                site_area
                    .clone()
                    .and_then(|area| self.entries.get(&(tenant.clone(), Some(area), None)))
            })
            .or_else(|| self.entries.get(&(tenant, None, None)))
    }
}
