use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Custom form submission: one optional tag.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LeadRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// OptinMonster webhook body.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OptinMonsterRequest {
    #[serde(default)]
    pub lead: OptinMonsterLead,
    #[serde(default)]
    pub lead_options: OptinMonsterOptions,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OptinMonsterLead {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OptinMonsterOptions {
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Order webhook; the shop sends the full order, only the id matters.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OrderEvent {
    #[serde(default, alias = "order_id")]
    pub id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutEvent {
    pub order_id: u64,
    #[serde(default)]
    pub newsletter_signup: Value,
}

/// Envelope the storefront script reads: `{ success, data }`.
#[derive(Debug, Serialize)]
pub struct WpJson<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> WpJson<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }

    pub fn error(data: T) -> Self {
        Self {
            success: false,
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Form-style booleans: `true`, `1`, `"1"`, `"on"`, `"yes"`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "on" | "yes"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn optinmonster_payload_tolerates_missing_parts() {
        let req: OptinMonsterRequest =
            serde_json::from_value(json!({"lead": {"email": "a@b.com"}})).unwrap();
        assert_eq!(req.lead.email.as_deref(), Some("a@b.com"));
        assert!(req.lead_options.tags.is_empty());
    }

    #[test]
    fn order_event_accepts_either_id_field() {
        let a: OrderEvent = serde_json::from_value(json!({"id": 4, "status": "completed"})).unwrap();
        let b: OrderEvent = serde_json::from_value(json!({"order_id": 5})).unwrap();
        assert_eq!((a.id, b.id), (Some(4), Some(5)));
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy(&json!("on")));
        assert!(is_truthy(&json!(1)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
    }
}
