//! Free-only shaping of model listings.
//!
//! A model counts as free when every price field it carries is zero
//! (`"0"`, `"0.0"` or a numeric 0). Absent fields cost nothing.

use bytes::Bytes;
use serde_json::Value;

pub const PRICE_FIELDS: [&str; 6] = [
    "prompt",
    "completion",
    "request",
    "image",
    "web_search",
    "internal_reasoning",
];

fn price_is_zero(price: &Value) -> bool {
    match price {
        Value::String(s) => s.trim().parse::<f64>().map(|p| p == 0.0).unwrap_or(false),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Null => true,
        _ => false,
    }
}

/// Whether `model` has a pricing object with only zero prices.
pub fn is_free(model: &Value) -> bool {
    let Some(pricing) = model.get("pricing").and_then(Value::as_object) else {
        return false;
    };
    PRICE_FIELDS
        .iter()
        .all(|field| pricing.get(*field).map_or(true, price_is_zero))
}

/// Filter a `{"data": [...]}` model listing down to free entries.
///
/// Returns `None` when the body is not a listing or nothing in it is free;
/// the caller then relays the original body untouched.
pub fn filter_free_models(body: &[u8]) -> Option<Bytes> {
    let mut doc: Value = serde_json::from_slice(body).ok()?;
    let models = doc.get("data")?.as_array()?;

    let free: Vec<Value> = models.iter().filter(|m| is_free(m)).cloned().collect();
    if free.is_empty() {
        tracing::debug!("No free models in listing, leaving body untouched");
        return None;
    }

    tracing::debug!("Filtered model listing to {} of {} entries", free.len(), models.len());
    doc["data"] = Value::Array(free);
    serde_json::to_vec(&doc).ok().map(Bytes::from)
}
