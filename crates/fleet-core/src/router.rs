//! Task router: matches a task descriptor against a project's rule list and
//! selects an eligible agent.
//!
//! Rule evaluation is deliberately split into a pure, pool-free half (this
//! module's [`evaluate`]) and a thin pool-backed wrapper ([`decide`]) that
//! loads the rows and calls it. `evaluate` takes a snapshot of the rules,
//! agents, and round-robin cursors as plain data, so the dry-run endpoint
//! (`POST /projects/:id/routing-rules/test`) can call it against a simulated
//! task without ever opening a database connection.
//!
//! Evaluation is read-only: it never reserves capacity. The actual
//! compare-and-increment happens later, inside the same transaction as the
//! task row write, via [`fleet_db::queries::agents::reserve_capacity`]. A
//! candidate this module selects can still lose the reservation race to a
//! concurrent request; when that happens the caller records the failure
//! reason and leaves the task unassigned rather than trying another rule --
//! matching the "reassign fallback preserves counts" scenario, where the
//! snapshot and the real count can disagree by the time the transaction
//! opens.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use uuid::Uuid;

use fleet_db::db::{Db, DbTx};
use fleet_db::models::{Agent, AgentStatus, AssignStrategy, RoutingRule};
use fleet_db::queries::{agents, projects, routing_cursors, routing_rules};

use crate::error::CoreError;

/// The task attributes a rule's `conditions` clause is evaluated against.
/// Built from a real `Task` row for live routing, or supplied directly by
/// the dry-run endpoint.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub priority: i32,
    pub tags: Vec<String>,
    pub context: serde_json::Value,
}

/// The outcome of evaluating a project's rule list against a task.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RoutingDecision {
    /// The rule that produced the decision, if any rule matched.
    pub rule_id: Option<Uuid>,
    /// The agent selected, if eligibility resolved to a concrete candidate.
    pub agent_id: Option<Uuid>,
    /// Human-readable reason, persisted verbatim into `tasks.routing_decision`.
    pub reason: String,
}

impl RoutingDecision {
    fn unmatched(reason: impl Into<String>) -> Self {
        Self {
            rule_id: None,
            agent_id: None,
            reason: reason.into(),
        }
    }
}

/// Round-robin cursor state, keyed by capability tag (a single project's
/// worth -- the project id is implicit in the caller's scope).
pub type CursorMap = HashMap<String, Uuid>;

/// Evaluate `task` against `rules` in priority order and return the first
/// match's resolved candidate, falling back to `default_agent_id` if no
/// rule matches, and to an explicit "no eligible agent" reason if nothing
/// resolves at all.
///
/// `rules` must already be in evaluation order (lowest `rule_priority`
/// first, ties broken by creation order) -- the order
/// [`fleet_db::queries::routing_rules::list_enabled_rules_for_project`]
/// returns.
pub fn evaluate(
    rules: &[RoutingRule],
    agents: &HashMap<Uuid, Agent>,
    cursors: &CursorMap,
    default_agent_id: Option<Uuid>,
    task: &TaskDescriptor,
) -> RoutingDecision {
    for rule in rules {
        if !conditions_match(rule.conditions.as_object(), task) {
            continue;
        }

        if let Some(candidate) = resolve_candidate(rule, agents, cursors) {
            return RoutingDecision {
                rule_id: Some(rule.id),
                agent_id: Some(candidate),
                reason: format!("matched rule {:?}", rule.name),
            };
        }

        if let Some(fallback_id) = rule.fallback_to {
            if agents.get(&fallback_id).is_some_and(is_eligible) {
                return RoutingDecision {
                    rule_id: Some(rule.id),
                    agent_id: Some(fallback_id),
                    reason: format!("matched rule {:?}, used fallback_to", rule.name),
                };
            }
        }
        // Neither the rule's primary target nor its fallback is eligible;
        // continue to the next rule.
    }

    if let Some(default_id) = default_agent_id {
        if agents.get(&default_id).is_some_and(is_eligible) {
            return RoutingDecision {
                rule_id: None,
                agent_id: Some(default_id),
                reason: "no rule matched, used project default agent".to_string(),
            };
        }
        return RoutingDecision::unmatched(
            "no rule matched and the project default agent is not eligible",
        );
    }

    RoutingDecision::unmatched("no rule matched and no project default agent is configured")
}

fn is_eligible(agent: &Agent) -> bool {
    if !matches!(agent.status(), Ok(AgentStatus::Active)) {
        return false;
    }
    match agent.capacity_max {
        None => true,
        Some(max) => agent.capacity_in_use < max,
    }
}

fn resolve_candidate(
    rule: &RoutingRule,
    agents: &HashMap<Uuid, Agent>,
    cursors: &CursorMap,
) -> Option<Uuid> {
    if let Some(assign_to) = rule.assign_to {
        return agents.get(&assign_to).filter(|a| is_eligible(a)).map(|a| a.id);
    }

    let capability = rule.assign_to_capability.as_deref()?;
    let strategy = rule.assign_strategy().ok()?;

    let mut candidates: Vec<&Agent> = agents
        .values()
        .filter(|a| is_eligible(a) && a.capability_list().iter().any(|c| c == capability))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|a| a.id);

    match strategy {
        AssignStrategy::LeastBusy => candidates
            .into_iter()
            .min_by_key(|a| (a.capacity_in_use, a.id))
            .map(|a| a.id),
        AssignStrategy::FirstAvailable => candidates.first().map(|a| a.id),
        AssignStrategy::Random => candidates.choose(&mut rand::rng()).map(|a| a.id),
        AssignStrategy::RoundRobin => {
            let cursor = cursors.get(capability);
            let next = match cursor {
                None => candidates.first(),
                Some(last) => {
                    let pos = candidates.iter().position(|a| &a.id == last);
                    match pos {
                        Some(i) => candidates.get((i + 1) % candidates.len()),
                        None => candidates.first(),
                    }
                }
            };
            next.map(|a| a.id)
        }
    }
}

fn conditions_match(conditions: Option<&serde_json::Map<String, serde_json::Value>>, task: &TaskDescriptor) -> bool {
    let Some(conditions) = conditions else {
        return true; // absent conditions object = catch-all
    };

    if let Some(tags_clause) = conditions.get("tags").and_then(|v| v.as_object()) {
        if !tags_clause_matches(tags_clause, &task.tags) {
            return false;
        }
    }

    if let Some(priority_clause) = conditions.get("priority").and_then(|v| v.as_object()) {
        if !priority_clause_matches(priority_clause, task.priority) {
            return false;
        }
    }

    if let Some(metadata_clause) = conditions.get("metadata").and_then(|v| v.as_object()) {
        if !metadata_clause_matches(metadata_clause, &task.context) {
            return false;
        }
    }

    true
}

fn tags_clause_matches(clause: &serde_json::Map<String, serde_json::Value>, tags: &[String]) -> bool {
    if let Some(includes_any) = clause.get("includes_any").and_then(|v| v.as_array()) {
        let wants: Vec<&str> = includes_any.iter().filter_map(|v| v.as_str()).collect();
        if !wants.iter().any(|w| tags.iter().any(|t| t == w)) {
            return false;
        }
    }
    if let Some(includes_all) = clause.get("includes_all").and_then(|v| v.as_array()) {
        let wants: Vec<&str> = includes_all.iter().filter_map(|v| v.as_str()).collect();
        if !wants.iter().all(|w| tags.iter().any(|t| t == w)) {
            return false;
        }
    }
    true
}

fn priority_clause_matches(clause: &serde_json::Map<String, serde_json::Value>, priority: i32) -> bool {
    if let Some(eq) = clause.get("eq").and_then(|v| v.as_i64()) {
        if priority as i64 != eq {
            return false;
        }
    }
    if let Some(gte) = clause.get("gte").and_then(|v| v.as_i64()) {
        if (priority as i64) < gte {
            return false;
        }
    }
    if let Some(lte) = clause.get("lte").and_then(|v| v.as_i64()) {
        if (priority as i64) > lte {
            return false;
        }
    }
    true
}

fn metadata_clause_matches(clause: &serde_json::Map<String, serde_json::Value>, context: &serde_json::Value) -> bool {
    let Some(context) = context.as_object() else {
        return clause.is_empty();
    };
    clause.iter().all(|(k, v)| context.get(k) == Some(v))
}

/// Load a project's rules, the agents they could possibly resolve to, and
/// the round-robin cursors those rules consult, then run [`evaluate`]
/// against `task`. Read-only: callers needing an actual assignment must
/// still reserve capacity under a transaction via [`reserve_decision`].
pub async fn decide(db: &Db, project_id: Uuid, task: &TaskDescriptor) -> Result<RoutingDecision, CoreError> {
    let rules = routing_rules::list_enabled_rules_for_project(db, project_id).await?;
    let project = projects::get_project(db, project_id)
        .await?
        .ok_or(CoreError::ProjectNotFound(project_id))?;

    let mut candidate_agents: HashMap<Uuid, Agent> = HashMap::new();
    for rule in &rules {
        if let Some(id) = rule.assign_to {
            if let Some(a) = agents::get_agent(db, id).await? {
                candidate_agents.insert(a.id, a);
            }
        } else if let Some(capability) = rule.assign_to_capability.as_deref() {
            for a in agents::list_agents_with_capability(db, capability).await? {
                candidate_agents.insert(a.id, a);
            }
        }
        if let Some(fallback_id) = rule.fallback_to {
            if let Some(a) = agents::get_agent(db, fallback_id).await? {
                candidate_agents.insert(a.id, a);
            }
        }
    }
    if let Some(default_id) = project.default_agent_id {
        if let Some(a) = agents::get_agent(db, default_id).await? {
            candidate_agents.insert(a.id, a);
        }
    }

    let capabilities: HashSet<&str> = rules
        .iter()
        .filter_map(|r| r.assign_to_capability.as_deref())
        .collect();
    let mut cursors = CursorMap::new();
    for capability in capabilities {
        if let Some(cursor) = routing_cursors::get_cursor(db, project_id, capability).await? {
            cursors.insert(capability.to_string(), cursor.last_agent_id);
        }
    }

    Ok(evaluate(
        &rules,
        &candidate_agents,
        &cursors,
        project.default_agent_id,
        task,
    ))
}

/// The result of attempting to make a [`RoutingDecision`] durable: either
/// the chosen agent's capacity was reserved, or it was not and the task
/// should be persisted unassigned with `reason` recorded as its
/// `routing_decision`.
pub enum Reservation {
    Assigned { agent_id: Uuid, rule_id: Option<Uuid>, reason: String },
    Unassigned { reason: String },
}

/// Attempt to make a [`RoutingDecision`] durable inside an open transaction.
/// If the decision named no candidate at all, this is a no-op that returns
/// `Unassigned` immediately. Otherwise it calls
/// [`agents::reserve_capacity`]; a race lost between [`decide`]'s read and
/// this reservation surfaces as `Unassigned` with the failure reason
/// appended, not as an error -- losing the race is an expected outcome, not
/// a defect.
pub async fn reserve_decision(tx: &mut DbTx<'_>, decision: &RoutingDecision) -> Result<Reservation, CoreError> {
    let Some(agent_id) = decision.agent_id else {
        return Ok(Reservation::Unassigned {
            reason: decision.reason.clone(),
        });
    };

    match agents::reserve_capacity(tx, agent_id).await? {
        Ok(()) => Ok(Reservation::Assigned {
            agent_id,
            rule_id: decision.rule_id,
            reason: decision.reason.clone(),
        }),
        Err(failure) => Ok(Reservation::Unassigned {
            reason: format!("{}, but reservation failed: {}", decision.reason, failure.reason()),
        }),
    }
}

/// A rule as submitted to the replace-the-list endpoint, before it has an
/// id or a `created_at`. Evaluation order is the order of this slice:
/// `rule_priority` is assigned positionally: the replace-the-list endpoint
/// treats array order as priority order, so a reorder is just a re-PUT).
#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub conditions: serde_json::Value,
    pub assign_to: Option<Uuid>,
    pub assign_to_capability: Option<String>,
    pub assign_strategy: String,
    pub fallback_to: Option<Uuid>,
}

/// Replace a project's entire rule list inside one transaction: delete every
/// existing rule, then insert `rules` in order with a positional
/// `rule_priority`. Either the whole list lands or none of it does --
/// there is no partial-replace state a concurrent `decide` can observe.
pub async fn replace_rules(db: &Db, project_id: Uuid, rules: Vec<NewRule>) -> Result<Vec<RoutingRule>, CoreError> {
    db.tx(|tx| async move {
        routing_rules::delete_rules_for_project_in_tx(tx, project_id).await?;

        let mut inserted = Vec::with_capacity(rules.len());
        for (i, rule) in rules.into_iter().enumerate() {
            let row = routing_rules::insert_routing_rule_in_tx(
                tx,
                project_id,
                &rule.name,
                i as i32,
                rule.conditions,
                rule.assign_to,
                rule.assign_to_capability.as_deref(),
                &rule.assign_strategy,
                rule.fallback_to,
            )
            .await?;
            inserted.push(row);
        }
        Ok(inserted)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::models::Agent;
    use uuid::Uuid;

    fn agent(status: &str, capacity_max: Option<i32>, capacity_in_use: i32, capabilities: &[&str]) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "a".into(),
            status: status.into(),
            capabilities: serde_json::json!(capabilities),
            capacity_max,
            capacity_in_use,
            execution_mode: "auto".into(),
            owner_user_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn rule(conditions: serde_json::Value, assign_to: Option<Uuid>, capability: Option<&str>, strategy: &str, priority: i32) -> RoutingRule {
        RoutingRule {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "r".into(),
            enabled: true,
            rule_priority: priority,
            conditions,
            assign_to,
            assign_to_capability: capability.map(str::to_owned),
            assign_strategy: strategy.to_string(),
            fallback_to: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn catch_all_rule_with_fixed_assignee_matches() {
        let a = agent("active", Some(2), 0, &[]);
        let r = rule(serde_json::json!({}), Some(a.id), None, "least_busy", 1);
        let agents = HashMap::from([(a.id, a.clone())]);
        let decision = evaluate(&[r], &agents, &CursorMap::new(), None, &TaskDescriptor {
            priority: 2,
            tags: vec![],
            context: serde_json::json!({}),
        });
        assert_eq!(decision.agent_id, Some(a.id));
    }

    #[test]
    fn tags_includes_any_filters_out_non_matching_task() {
        let a = agent("active", None, 0, &[]);
        let r = rule(
            serde_json::json!({"tags": {"includes_any": ["urgent"]}}),
            Some(a.id),
            None,
            "least_busy",
            1,
        );
        let agents = HashMap::from([(a.id, a.clone())]);
        let decision = evaluate(&[r], &agents, &CursorMap::new(), None, &TaskDescriptor {
            priority: 2,
            tags: vec!["routine".into()],
            context: serde_json::json!({}),
        });
        assert_eq!(decision.agent_id, None);
        assert_eq!(decision.rule_id, None);
    }

    #[test]
    fn least_busy_picks_lowest_capacity_in_use() {
        let busy = agent("active", Some(5), 3, &["code"]);
        let idle = agent("active", Some(5), 1, &["code"]);
        let r = rule(serde_json::json!({}), None, Some("code"), "least_busy", 1);
        let agents = HashMap::from([(busy.id, busy.clone()), (idle.id, idle.clone())]);
        let decision = evaluate(&[r], &agents, &CursorMap::new(), None, &TaskDescriptor {
            priority: 2,
            tags: vec![],
            context: serde_json::json!({}),
        });
        assert_eq!(decision.agent_id, Some(idle.id));
    }

    #[test]
    fn at_capacity_candidate_is_ineligible_and_falls_through_to_default() {
        let full = agent("active", Some(1), 1, &[]);
        let default = agent("active", Some(5), 0, &[]);
        let r = rule(serde_json::json!({}), Some(full.id), None, "least_busy", 1);
        let agents = HashMap::from([(full.id, full.clone()), (default.id, default.clone())]);
        let decision = evaluate(&[r], &agents, &CursorMap::new(), Some(default.id), &TaskDescriptor {
            priority: 2,
            tags: vec![],
            context: serde_json::json!({}),
        });
        assert_eq!(decision.agent_id, Some(default.id));
        assert_eq!(decision.rule_id, None);
    }

    #[test]
    fn no_candidate_and_no_default_returns_unmatched_reason() {
        let decision = evaluate(&[], &HashMap::new(), &CursorMap::new(), None, &TaskDescriptor {
            priority: 2,
            tags: vec![],
            context: serde_json::json!({}),
        });
        assert_eq!(decision.agent_id, None);
        assert!(decision.reason.contains("no project default agent"));
    }

    #[test]
    fn round_robin_advances_past_the_cursor() {
        let a1 = agent("active", None, 0, &["x"]);
        let a2 = agent("active", None, 0, &["x"]);
        let mut ids = [a1.id, a2.id];
        ids.sort();
        let cursors = CursorMap::from([("x".to_string(), ids[0])]);
        let r = rule(serde_json::json!({}), None, Some("x"), "round_robin", 1);
        let agents = HashMap::from([(a1.id, a1), (a2.id, a2)]);
        let decision = evaluate(&[r], &agents, &cursors, None, &TaskDescriptor {
            priority: 2,
            tags: vec![],
            context: serde_json::json!({}),
        });
        assert_eq!(decision.agent_id, Some(ids[1]));
    }
}
