//! Database query functions for the `routing_rules` table.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::{Db, DbError, DbTx};
use crate::models::RoutingRule;
use crate::params;

#[allow(clippy::too_many_arguments)]
pub async fn insert_routing_rule(
    db: &Db,
    project_id: Uuid,
    name: &str,
    rule_priority: i32,
    conditions: serde_json::Value,
    assign_to: Option<Uuid>,
    assign_to_capability: Option<&str>,
    assign_strategy: &str,
    fallback_to: Option<Uuid>,
) -> Result<RoutingRule> {
    db.one(
        "INSERT INTO routing_rules \
            (id, project_id, name, enabled, rule_priority, conditions, \
             assign_to, assign_to_capability, assign_strategy, fallback_to, created_at) \
         VALUES (?, ?, ?, TRUE, ?, ?, ?, ?, ?, ?, datetime('now')) \
         RETURNING *",
        &params!(
            Uuid::new_v4(),
            project_id,
            name,
            rule_priority,
            conditions,
            assign_to,
            assign_to_capability,
            assign_strategy,
            fallback_to
        ),
    )
    .await
    .context("failed to insert routing rule")
}

/// List a project's enabled rules in evaluation order: lower
/// `rule_priority` runs earlier, ties broken by creation order.
pub async fn list_enabled_rules_for_project(db: &Db, project_id: Uuid) -> Result<Vec<RoutingRule>> {
    db.many(
        "SELECT * FROM routing_rules \
         WHERE project_id = ? AND enabled = TRUE \
         ORDER BY rule_priority ASC, created_at ASC",
        &params!(project_id),
    )
    .await
    .context("failed to list routing rules")
}

pub async fn set_rule_enabled(db: &Db, id: Uuid, enabled: bool) -> Result<u64> {
    db.exec(
        "UPDATE routing_rules SET enabled = ? WHERE id = ?",
        &params!(enabled, id),
    )
    .await
    .context("failed to update routing rule")
}

/// A project's full rule list, enabled or not, in evaluation order. The
/// `GET` side of the routing-rules surface; [`list_enabled_rules_for_project`]
/// is what the router itself consults.
pub async fn list_rules_for_project(db: &Db, project_id: Uuid) -> Result<Vec<RoutingRule>> {
    db.many(
        "SELECT * FROM routing_rules \
         WHERE project_id = ? \
         ORDER BY rule_priority ASC, created_at ASC",
        &params!(project_id),
    )
    .await
    .context("failed to list routing rules")
}

/// Delete every rule belonging to `project_id`, inside an already-open
/// transaction. The `PUT` replace-the-list endpoint wraps this plus a
/// fresh round of [`insert_routing_rule_in_tx`] calls in one transaction.
pub async fn delete_rules_for_project_in_tx(tx: &mut DbTx<'_>, project_id: Uuid) -> Result<u64, DbError> {
    tx.exec("DELETE FROM routing_rules WHERE project_id = ?", &params!(project_id)).await
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_routing_rule_in_tx(
    tx: &mut DbTx<'_>,
    project_id: Uuid,
    name: &str,
    rule_priority: i32,
    conditions: serde_json::Value,
    assign_to: Option<Uuid>,
    assign_to_capability: Option<&str>,
    assign_strategy: &str,
    fallback_to: Option<Uuid>,
) -> Result<RoutingRule, DbError> {
    tx.one(
        "INSERT INTO routing_rules \
            (id, project_id, name, enabled, rule_priority, conditions, \
             assign_to, assign_to_capability, assign_strategy, fallback_to, created_at) \
         VALUES (?, ?, ?, TRUE, ?, ?, ?, ?, ?, ?, datetime('now')) \
         RETURNING *",
        &params!(
            Uuid::new_v4(),
            project_id,
            name,
            rule_priority,
            conditions,
            assign_to,
            assign_to_capability,
            assign_strategy,
            fallback_to
        ),
    )
    .await
}
