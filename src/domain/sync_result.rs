use serde::{Deserialize, Serialize};

const MAX_LOG_LINES: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncJobResult {
    pub success: u32,
    pub failure: u32,
    pub total: u32,
    pub logs: Vec<String>,
    pub object_ids_in_failure: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncJobSummary {
    pub success: u32,
    pub failure: u32,
    pub total: u32,
    #[serde(default)]
    pub object_ids_in_failure: Vec<String>,
}

impl SyncJobResult {
    pub fn record_success(&mut self) {
        self.success += 1;
        self.total += 1;
    }

    pub fn record_failure(&mut self, object_id: &str, message: impl Into<String>) {
        self.failure += 1;
        self.total += 1;
        if !self.object_ids_in_failure.iter().any(|id| id == object_id) {
            self.object_ids_in_failure.push(object_id.to_string());
        }
        self.log(format!("{object_id}: {}", message.into()));
    }

    pub fn log(&mut self, line: impl Into<String>) {
        if self.logs.len() < MAX_LOG_LINES {
            self.logs.push(line.into());
        }
    }

    pub fn merge(&mut self, other: SyncJobResult) {
        self.success += other.success;
        self.failure += other.failure;
        self.total += other.total;
        for id in other.object_ids_in_failure {
            if !self.object_ids_in_failure.contains(&id) {
                self.object_ids_in_failure.push(id);
            }
        }
        for line in other.logs {
            self.log(line);
        }
    }

    pub fn summary(&self) -> SyncJobSummary {
        SyncJobSummary {
            success: self.success,
            failure: self.failure,
            total: self.total,
            object_ids_in_failure: self.object_ids_in_failure.clone(),
        }
    }
}
