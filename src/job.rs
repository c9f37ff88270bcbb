use crate::errors::{QueueError, Result};
use serde::{Deserialize, Serialize};

/// One kiln firing request, as stored in the permanent `kiln_requests` table.
///
/// The queue never interprets most of these fields; they are carried so the
/// ticket can be rendered from the queue entry alone. Columns this struct does
/// not know about are kept in `extra` so a snapshot never loses data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KilnRequest {
    pub id: String,
    pub account_id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub opt_in: Option<bool>,
    pub length: f64,
    pub width: f64,
    pub height: f64,
    pub quantity: u32,
    pub cost: serde_json::Value,
    pub firing_type: String,
    #[serde(default)]
    pub non_member: Option<bool>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub printed: bool,
    #[serde(default)]
    pub exported: bool,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl KilnRequest {
    /// Canonical byte form used as the queue snapshot.
    ///
    /// Field order is fixed by the struct and `extra` keys are sorted, so two
    /// equal records always produce identical bytes.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parse a record from an arbitrary JSON value, e.g. a database trigger payload.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| QueueError::InvalidRecord(e.to_string()))
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    /// Cost as printed on the ticket. The store sends it either as a number or
    /// as a preformatted string.
    pub fn cost_display(&self) -> String {
        match &self.cost {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(v) => format!("{:.2}", v),
                None => n.to_string(),
            },
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub fn dimensions_display(&self) -> String {
        format!(
            "{} x {} x {}",
            format_measure(self.length),
            format_measure(self.width),
            format_measure(self.height)
        )
    }
}

fn format_measure(value: f64) -> String {
    // Integer form only where i64 holds the value exactly
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// A record sitting in a tenant queue, tagged with the entry id assigned at enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub entry_id: Option<String>,
    pub record: KilnRequest,
}

impl QueuedJob {
    /// Wrap a bare record. Removal of such a job can only match by content.
    pub fn from_record(record: KilnRequest) -> Self {
        Self {
            entry_id: None,
            record,
        }
    }

    pub fn record_id(&self) -> &str {
        &self.record.id
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::kiln_request;
    use super::*;

    #[test]
    fn test_snapshot_is_deterministic() {
        let a = kiln_request("r1", "t1", "Ann");
        let b = a.clone();
        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }

    #[test]
    fn test_unknown_columns_survive_snapshot() {
        let value = serde_json::json!({
            "id": "r9",
            "account_id": "t1",
            "first_name": "Bo",
            "last_name": "Lee",
            "length": 3,
            "width": 3,
            "height": 3,
            "quantity": 1,
            "cost": "9.00",
            "firing_type": "Glaze",
            "created_at": "2024-10-03T17:45:12+00:00",
            "rounded_length": 4,
            "pricing_category": "member"
        });

        let record = KilnRequest::from_value(value).unwrap();
        assert_eq!(record.extra.get("rounded_length"), Some(&serde_json::json!(4)));

        let restored = KilnRequest::from_snapshot(&record.snapshot().unwrap()).unwrap();
        assert_eq!(restored, record);
        assert_eq!(restored.extra.get("pricing_category"), Some(&serde_json::json!("member")));
    }

    #[test]
    fn test_missing_required_field_is_invalid_record() {
        let err = KilnRequest::from_value(serde_json::json!({ "id": "r1" })).unwrap_err();
        assert!(matches!(err, QueueError::InvalidRecord(_)));
    }

    #[test]
    fn test_display_helpers() {
        let mut record = kiln_request("r1", "t1", "Ann");
        assert_eq!(record.full_name(), "Ann Potter");
        assert_eq!(record.dimensions_display(), "4 x 5 x 6.5");
        assert_eq!(record.cost_display(), "12.50");

        record.cost = serde_json::json!("$7.25");
        assert_eq!(record.cost_display(), "$7.25");
    }

    #[test]
    fn test_huge_measure_is_not_clamped() {
        let mut record = kiln_request("r1", "t1", "Ann");
        record.length = 1e20;
        assert_eq!(record.dimensions_display(), "100000000000000000000 x 5 x 6.5");
    }
}
