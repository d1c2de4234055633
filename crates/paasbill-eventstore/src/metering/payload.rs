//! Typed views over stored raw event payloads

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

/// Platform app usage event
#[derive(Debug, Clone, Deserialize)]
pub struct AppUsagePayload {
    pub state: String,
    #[serde(default, deserialize_with = "optional_guid")]
    pub app_guid: Option<Uuid>,
    #[serde(default)]
    pub app_name: String,
    pub org_guid: Uuid,
    pub space_guid: Uuid,
    #[serde(default)]
    pub space_name: String,
    #[serde(default)]
    pub instance_count: i64,
    #[serde(default)]
    pub memory_in_mb_per_instance: i64,
    #[serde(default, deserialize_with = "optional_guid")]
    pub task_guid: Option<Uuid>,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default, deserialize_with = "optional_guid")]
    pub parent_app_guid: Option<Uuid>,
    #[serde(default)]
    pub parent_app_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Started,
    Stopped,
    TaskStarted,
    TaskStopped,
    StagingStarted,
    StagingStopped,
    /// Buildpack changes and other states that do not affect billing
    Other,
}

impl AppUsagePayload {
    pub fn app_state(&self) -> AppState {
        match self.state.as_str() {
            "STARTED" => AppState::Started,
            "STOPPED" => AppState::Stopped,
            "TASK_STARTED" => AppState::TaskStarted,
            "TASK_STOPPED" => AppState::TaskStopped,
            "STAGING_STARTED" => AppState::StagingStarted,
            "STAGING_STOPPED" => AppState::StagingStopped,
            _ => AppState::Other,
        }
    }
}

/// Platform service usage event
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceUsagePayload {
    pub state: String,
    pub org_guid: Uuid,
    pub space_guid: Uuid,
    #[serde(default)]
    pub space_name: String,
    pub service_instance_guid: Uuid,
    #[serde(default)]
    pub service_instance_name: String,
    #[serde(default)]
    pub service_instance_type: String,
    pub service_plan_guid: Uuid,
    #[serde(default)]
    pub service_plan_name: String,
    #[serde(default, deserialize_with = "optional_guid")]
    pub service_guid: Option<Uuid>,
    #[serde(default)]
    pub service_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Updated,
    Deleted,
    Other,
}

pub const MANAGED_SERVICE_INSTANCE: &str = "managed_service_instance";

impl ServiceUsagePayload {
    pub fn service_state(&self) -> ServiceState {
        match self.state.as_str() {
            "CREATED" => ServiceState::Created,
            "UPDATED" => ServiceState::Updated,
            "DELETED" => ServiceState::Deleted,
            _ => ServiceState::Other,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.service_instance_type == MANAGED_SERVICE_INSTANCE
    }
}

pub const SCALE_MEMBERS_EVENT: &str = "deployment.scale.members";

/// Hosted database audit event
#[derive(Debug, Clone, Deserialize)]
pub struct ComposeAuditPayload {
    pub id: String,
    pub event: String,
    #[serde(default)]
    pub data: ComposeAuditData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeAuditData {
    #[serde(default)]
    pub deployment: String,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
}

impl ComposeAuditPayload {
    pub fn is_scale(&self) -> bool {
        self.event == SCALE_MEMBERS_EVENT
    }

    /// Deployments are named `<prefix>-<service instance guid>`
    pub fn service_instance_guid(&self) -> Option<Uuid> {
        let name = self.data.deployment.as_str();
        let start = name.len().checked_sub(36)?;
        name.get(start..).and_then(|tail| Uuid::parse_str(tail).ok())
    }

    pub fn memory_in_mb(&self) -> Option<i64> {
        self.data.memory.as_deref().and_then(parse_size_mb)
    }

    pub fn storage_in_mb(&self) -> Option<i64> {
        self.data.storage.as_deref().and_then(parse_size_mb)
    }
}

/// Parses sizes such as `2 GB`, `512 MB` or `1.5GB` into megabytes
pub fn parse_size_mb(value: &str) -> Option<i64> {
    let value = value.trim();
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number = Decimal::from_str(number.trim()).ok()?;
    let factor = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "MB" | "M" => Decimal::ONE,
        "GB" | "G" => Decimal::from(1024),
        "TB" | "T" => Decimal::from(1024 * 1024),
        _ => return None,
    };
    let mb = (number * factor).round().to_i64()?;
    (mb >= 0).then_some(mb)
}

fn optional_guid<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => Uuid::parse_str(text)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid guid '{text}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size_mb("2 GB"), Some(2048));
        assert_eq!(parse_size_mb("512 MB"), Some(512));
        assert_eq!(parse_size_mb("1.5GB"), Some(1536));
        assert_eq!(parse_size_mb("lots"), None);
        assert_eq!(parse_size_mb("3 PB"), None);
    }

    #[test]
    fn test_app_payload_with_empty_guids() {
        let payload: AppUsagePayload = serde_json::from_value(json!({
            "state": "STARTED",
            "app_guid": "c85e98f0-6d1b-4f45-9368-ea58263165a0",
            "app_name": "web",
            "org_guid": "51ba75ef-edc0-47ad-a633-a8f6e8770944",
            "space_guid": "276f4886-ac40-492d-a8cd-b2646637ba76",
            "space_name": "sandbox",
            "instance_count": 2,
            "memory_in_mb_per_instance": 512,
            "task_guid": "",
            "parent_app_guid": null
        }))
        .unwrap();
        assert_eq!(payload.app_state(), AppState::Started);
        assert!(payload.task_guid.is_none());
        assert!(payload.parent_app_guid.is_none());
    }

    #[test]
    fn test_compose_deployment_guid() {
        let payload: ComposeAuditPayload = serde_json::from_value(json!({
            "id": "audit-id-000000000003",
            "event": "deployment.scale.members",
            "data": {
                "memory": "2 GB",
                "storage": "4 GB",
                "deployment": "prod-aaaaaaaa-0000-0000-0000-000000000001"
            }
        }))
        .unwrap();
        assert!(payload.is_scale());
        assert_eq!(
            payload.service_instance_guid().unwrap().to_string(),
            "aaaaaaaa-0000-0000-0000-000000000001"
        );
        assert_eq!(payload.memory_in_mb(), Some(2048));
        assert_eq!(payload.storage_in_mb(), Some(4096));
    }

    #[test]
    fn test_compose_short_deployment_name() {
        let payload: ComposeAuditPayload = serde_json::from_value(json!({
            "id": "x",
            "event": "deployment.scale.members",
            "data": {"deployment": "prod"}
        }))
        .unwrap();
        assert!(payload.service_instance_guid().is_none());
    }
}
