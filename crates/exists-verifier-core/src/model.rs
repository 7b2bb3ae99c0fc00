use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::verify::{DeleteFacts, LaunchFacts};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExistsStatus {
    Pending,
    Verifying,
    Verified,
    Failed,
}

impl ExistsStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "verifying" => Some(Self::Verifying),
            "verified" => Some(Self::Verified),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Independently reported launch fact for an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub id: i64,
    pub instance: String,
    pub launched_at: Decimal,
    pub instance_type_id: String,
    pub tenant: String,
    pub rax_options: String,
    pub os_distro: String,
    pub os_architecture: String,
    pub os_version: String,
}

/// Independently reported deletion fact for an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRecord {
    pub id: i64,
    pub instance: String,
    pub launched_at: Decimal,
    pub deleted_at: Decimal,
}

/// Operator-supplied correction consulted when primary verification fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileRecord {
    pub id: i64,
    pub instance: String,
    pub launched_at: Decimal,
    pub deleted_at: Option<Decimal>,
    pub instance_type_id: String,
    pub tenant: String,
    pub rax_options: String,
    pub os_distro: String,
    pub os_architecture: String,
    pub os_version: String,
}

/// Periodic audit snapshot claiming an instance existed during a period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExistsRecord {
    pub id: i64,
    pub instance: String,
    pub tenant: String,
    pub launched_at: Option<Decimal>,
    pub deleted_at: Option<Decimal>,
    pub instance_type_id: String,
    pub rax_options: String,
    pub os_distro: String,
    pub os_architecture: String,
    pub os_version: String,
    pub audit_period_beginning: Option<Decimal>,
    pub audit_period_ending: Decimal,
    pub status: ExistsStatus,
    pub fail_reason: Option<String>,
    pub usage: Option<UsageRecord>,
    pub delete: Option<DeleteRecord>,
    /// Serialized `[routing_key, body]` pair of the originating notification.
    pub raw_json: String,
}

impl ExistsRecord {
    /// Decode the originating notification stored alongside this record.
    ///
    /// # Errors
    /// Returns an error when `raw_json` is not a `[routing_key, body]` JSON pair.
    pub fn raw_message(&self) -> Result<RawMessage, serde_json::Error> {
        RawMessage::parse(&self.raw_json)
    }
}

/// A stored raw notification: the routing key it arrived on plus its body.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub routing_key: String,
    pub body: Value,
}

impl RawMessage {
    /// Parse the `[routing_key, body]` wire shape.
    ///
    /// # Errors
    /// Returns an error when the input is not a two-element JSON array with a
    /// string routing key.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let (routing_key, body): (String, Value) = serde_json::from_str(raw)?;
        Ok(Self { routing_key, body })
    }

    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.body.get("message_id").and_then(Value::as_str)
    }
}

impl LaunchFacts for UsageRecord {
    fn launched_at(&self) -> Decimal {
        self.launched_at
    }
    fn instance_type_id(&self) -> &str {
        &self.instance_type_id
    }
    fn tenant(&self) -> &str {
        &self.tenant
    }
    fn rax_options(&self) -> &str {
        &self.rax_options
    }
    fn os_distro(&self) -> &str {
        &self.os_distro
    }
    fn os_architecture(&self) -> &str {
        &self.os_architecture
    }
    fn os_version(&self) -> &str {
        &self.os_version
    }
}

impl LaunchFacts for ReconcileRecord {
    fn launched_at(&self) -> Decimal {
        self.launched_at
    }
    fn instance_type_id(&self) -> &str {
        &self.instance_type_id
    }
    fn tenant(&self) -> &str {
        &self.tenant
    }
    fn rax_options(&self) -> &str {
        &self.rax_options
    }
    fn os_distro(&self) -> &str {
        &self.os_distro
    }
    fn os_architecture(&self) -> &str {
        &self.os_architecture
    }
    fn os_version(&self) -> &str {
        &self.os_version
    }
}

impl DeleteFacts for DeleteRecord {
    fn launched_at(&self) -> Decimal {
        self.launched_at
    }
    fn deleted_at(&self) -> Option<Decimal> {
        Some(self.deleted_at)
    }
}

impl DeleteFacts for ReconcileRecord {
    fn launched_at(&self) -> Decimal {
        self.launched_at
    }
    fn deleted_at(&self) -> Option<Decimal> {
        self.deleted_at
    }
}
