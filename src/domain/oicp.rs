use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    FullLoad,
    Update,
    Insert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OicpEvseStatus {
    Available,
    Reserved,
    Occupied,
    OutOfService,
    EvseNotFound,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvseStatusRecord {
    #[serde(rename = "EvseID")]
    pub evse_id: String,
    #[serde(rename = "EvseStatus")]
    pub evse_status: OicpEvseStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperatorEvseStatus {
    #[serde(rename = "OperatorID")]
    pub operator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_name: Option<String>,
    pub evse_status_record: Vec<EvseStatusRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushEvseStatusRequest {
    pub action_type: ActionType,
    pub operator_evse_status: OperatorEvseStatus,
}

impl PushEvseStatusRequest {
    pub fn evse_ids(&self) -> Vec<String> {
        self.operator_evse_status
            .evse_status_record
            .iter()
            .map(|record| record.evse_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusCode {
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Acknowledgement {
    pub result: bool,
    pub status_code: StatusCode,
}
