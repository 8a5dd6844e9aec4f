//! Route matching: which enabled routes subscribe to a fired event, and
//! which of those actually apply once `trigger_conditions` is checked
//! against the event's payload.
//!
//! Condition evaluation is pure and pool-free, mirroring
//! [`fleet_core::router::evaluate`]'s split between the evaluator and its
//! pool-backed loader.

use fleet_core::TriggerEvent;
use fleet_db::db::Db;
use fleet_db::models::Route;
use fleet_db::queries::routes;

/// Enabled routes subscribed to `event`'s trigger and project (or global),
/// further narrowed to those whose `trigger_conditions` accept `payload`.
pub async fn gather_routes(
    db: &Db,
    project_id: uuid::Uuid,
    event: TriggerEvent,
    payload: &serde_json::Value,
) -> anyhow::Result<Vec<Route>> {
    let candidates = routes::list_routes_for_event(db, project_id, event.as_str()).await?;
    Ok(candidates
        .into_iter()
        .filter(|route| conditions_match(route.trigger_conditions.as_ref(), payload))
        .collect())
}

/// Evaluate a route's `trigger_conditions` clause against an event payload.
/// Absent conditions (`None`, or an empty object) match everything.
pub fn conditions_match(conditions: Option<&serde_json::Value>, payload: &serde_json::Value) -> bool {
    let Some(conditions) = conditions.and_then(|v| v.as_object()) else {
        return true;
    };

    if let Some(tags_clause) = conditions.get("tags").and_then(|v| v.as_object()) {
        let tags: Vec<&str> = payload
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|t| t.as_str()).collect())
            .unwrap_or_default();
        if !tags_clause_matches(tags_clause, &tags) {
            return false;
        }
    }

    if let Some(metadata_clause) = conditions.get("metadata").and_then(|v| v.as_object()) {
        let metadata = payload.get("metadata").cloned().unwrap_or(serde_json::json!({}));
        if !metadata_clause_matches(metadata_clause, &metadata) {
            return false;
        }
    }

    true
}

fn tags_clause_matches(clause: &serde_json::Map<String, serde_json::Value>, tags: &[&str]) -> bool {
    if let Some(includes_any) = clause.get("includes_any").and_then(|v| v.as_array()) {
        let wants: Vec<&str> = includes_any.iter().filter_map(|v| v.as_str()).collect();
        if !wants.iter().any(|w| tags.contains(w)) {
            return false;
        }
    }
    if let Some(includes_all) = clause.get("includes_all").and_then(|v| v.as_array()) {
        let wants: Vec<&str> = includes_all.iter().filter_map(|v| v.as_str()).collect();
        if !wants.iter().all(|w| tags.contains(w)) {
            return false;
        }
    }
    true
}

fn metadata_clause_matches(clause: &serde_json::Map<String, serde_json::Value>, metadata: &serde_json::Value) -> bool {
    let Some(metadata) = metadata.as_object() else {
        return clause.is_empty();
    };
    clause.iter().all(|(k, v)| metadata.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_conditions_match_everything() {
        assert!(conditions_match(None, &serde_json::json!({})));
    }

    #[test]
    fn tags_includes_any_rejects_non_matching_payload() {
        let conditions = serde_json::json!({"tags": {"includes_any": ["urgent"]}});
        let payload = serde_json::json!({"tags": ["routine"]});
        assert!(!conditions_match(Some(&conditions), &payload));
    }

    #[test]
    fn tags_includes_any_accepts_matching_payload() {
        let conditions = serde_json::json!({"tags": {"includes_any": ["urgent"]}});
        let payload = serde_json::json!({"tags": ["urgent", "other"]});
        assert!(conditions_match(Some(&conditions), &payload));
    }

    #[test]
    fn metadata_clause_requires_exact_value_match() {
        let conditions = serde_json::json!({"metadata": {"env": "prod"}});
        assert!(conditions_match(
            Some(&conditions),
            &serde_json::json!({"metadata": {"env": "prod", "extra": 1}})
        ));
        assert!(!conditions_match(
            Some(&conditions),
            &serde_json::json!({"metadata": {"env": "staging"}})
        ));
    }
}
