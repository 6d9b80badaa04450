//! Gateways: TLS-terminating endpoints that expose `service` runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendType;

/// ACME certificate issuance settings for a gateway.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AcmeSettings {
    pub enabled: bool,
    pub email: Option<String>,
    pub directory_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfiguration {
    pub acme: AcmeSettings,
}

/// A gateway row. The core only reads these to drive service registration;
/// provisioning the gateway VM itself is the dataplane's business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub id: Uuid,
    pub project: String,
    pub name: String,
    pub backend: BackendType,
    pub region: String,
    pub wildcard_domain: Option<String>,
    pub configuration: GatewayConfiguration,
    pub created_at: DateTime<Utc>,
}
