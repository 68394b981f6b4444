use crate::core::models::meta::MetaBundle;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Key under which clients without the budget metadata endpoint keep their bundles.
pub const META_BY_BUDGET: &str = "metaByBudget";

/// Free-form per-user preferences, replaced as a whole on every write.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub user_id: i64,
    pub data: Value,
    pub updated_at: i64,
}

/// Anything other than a JSON object is stored as an empty object.
pub fn normalize(data: Value) -> Value {
    match data {
        Value::Object(_) => data,
        _ => Value::Object(Map::new()),
    }
}

/// The bundle kept for `budget_id` inside a settings object; lists that are missing or not
/// string arrays come back empty.
pub fn budget_meta(settings: &Value, budget_id: i64) -> MetaBundle {
    let entry = settings
        .get(META_BY_BUDGET)
        .and_then(|by_budget| by_budget.get(budget_id.to_string()));
    let list = |key: &str| -> Vec<String> {
        entry
            .and_then(|bundle| bundle.get(key))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    };
    MetaBundle {
        categories: list("categories"),
        members: list("members"),
        sources: list("sources"),
        updated_at: 0,
    }
}

/// Returns `settings` with the bundle for `budget_id` replaced and every other key kept.
pub fn with_budget_meta(settings: Value, budget_id: i64, bundle: &MetaBundle) -> Value {
    let mut root = match settings {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let mut by_budget = match root.remove(META_BY_BUDGET) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    by_budget.insert(
        budget_id.to_string(),
        json!({
            "categories": bundle.categories,
            "members": bundle.members,
            "sources": bundle.sources,
        }),
    );
    root.insert(META_BY_BUDGET.to_string(), Value::Object(by_budget));
    Value::Object(root)
}
