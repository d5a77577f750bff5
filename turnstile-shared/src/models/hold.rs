use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldStatus {
    Held,
    Claimed,
    Finalized,
    Released,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Held => "held",
            HoldStatus::Claimed => "claimed",
            HoldStatus::Finalized => "finalized",
            HoldStatus::Released => "released",
        }
    }

    /// Held and claimed holds keep their quantities in `pending`.
    pub fn reserves_inventory(&self) -> bool {
        matches!(self, HoldStatus::Held | HoldStatus::Claimed)
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HoldStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(HoldStatus::Held),
            "claimed" => Ok(HoldStatus::Claimed),
            "finalized" => Ok(HoldStatus::Finalized),
            "released" => Ok(HoldStatus::Released),
            other => Err(format!("unknown hold status: {}", other)),
        }
    }
}

/// One line of a hold. Serialized with the same field names the store scripts read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldEntry {
    pub event_id: String,
    pub category_id: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldRecord {
    pub token: String,
    pub status: HoldStatus,
    pub entries: Vec<HoldEntry>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_at_epoch: i64,
    pub trace_id: Option<String>,
    pub metadata: HoldMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [HoldStatus::Held, HoldStatus::Claimed, HoldStatus::Finalized, HoldStatus::Released] {
            assert_eq!(status.as_str().parse::<HoldStatus>().unwrap(), status);
        }
        assert!("pending".parse::<HoldStatus>().is_err());
    }

    #[test]
    fn test_entry_uses_script_field_names() {
        let entry = HoldEntry {
            event_id: "evt-001".into(),
            category_id: "cat-001-1".into(),
            quantity: 2,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["eventId"], "evt-001");
        assert_eq!(json["categoryId"], "cat-001-1");
        assert_eq!(json["quantity"], 2);
    }
}
