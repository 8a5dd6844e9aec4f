//! The task lifecycle state machine: create, claim,
//! status-change, edit, delete, and the count-maintenance rules that every
//! transition touching `assigned_agent_id` must respect.
//!
//! Every public function here opens at most one transaction, then, once it
//! has committed, appends an `activity_log` row and returns the events the
//! caller should hand to the dispatcher. Activity-log writes happen after
//! commit because [`fleet_db::queries::activity_log::insert_activity_entry`]
//! is a pool-level call and would trip the transaction guard if made from
//! inside one.

use uuid::Uuid;

use fleet_db::db::Db;
use fleet_db::models::{Task, TaskStatus};
use fleet_db::queries::{activity_log, agents, progress, projects, tasks};

use crate::error::CoreError;
use crate::events::{Event, TriggerEvent};
use crate::router::{self, Reservation, TaskDescriptor};

/// How a newly created task should be assigned.
#[derive(Debug, Clone)]
pub enum Assignment {
    /// Leave the task unassigned (`pending`).
    None,
    /// Run the router against the project's rule list.
    Auto,
    /// Assign directly to a specific agent, still subject to a capacity
    /// reservation.
    Agent(Uuid),
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub capacity_cost: i32,
    pub priority: i32,
    pub tags: Vec<String>,
    pub context: serde_json::Value,
    pub assignment: Assignment,
}

fn descriptor_for(task: &Task) -> TaskDescriptor {
    TaskDescriptor {
        priority: task.priority,
        tags: task.tag_list(),
        context: task.context.clone(),
    }
}

async fn decide_assignment(
    db: &Db,
    project_id: Uuid,
    assignment: &Assignment,
    descriptor: &TaskDescriptor,
) -> Result<Option<router::RoutingDecision>, CoreError> {
    match assignment {
        Assignment::None => Ok(None),
        Assignment::Auto => Ok(Some(router::decide(db, project_id, descriptor).await?)),
        Assignment::Agent(agent_id) => {
            agents::get_agent(db, *agent_id)
                .await?
                .ok_or(CoreError::AgentNotFound(*agent_id))?;
            Ok(Some(router::RoutingDecision {
                rule_id: None,
                agent_id: Some(*agent_id),
                reason: "explicit assignment at creation".to_string(),
            }))
        }
    }
}

/// Create a task, resolving its initial assignment per `input.assignment`.
/// The router (if used) evaluates before the transaction opens; the actual
/// reservation happens inside it, alongside the task INSERT, so a
/// concurrent reservation against the same agent can never slip between
/// the decision and the write.
pub async fn create_task(db: &Db, project_id: Uuid, input: NewTask) -> Result<(Task, Vec<Event>), CoreError> {
    projects::get_project(db, project_id)
        .await?
        .ok_or(CoreError::ProjectNotFound(project_id))?;

    let probe = TaskDescriptor {
        priority: input.priority,
        tags: input.tags.clone(),
        context: input.context.clone(),
    };
    let decision = decide_assignment(db, project_id, &input.assignment, &probe).await?;

    let task_id = db
        .tx(|tx| {
            let input = input.clone();
            let decision = decision.clone();
            async move {
                let task = tasks::insert_task_in_tx(
                    tx,
                    project_id,
                    &input.title,
                    &input.description,
                    input.capacity_cost,
                    input.priority,
                    &input.tags,
                    input.context,
                )
                .await?;

                if let Some(decision) = decision {
                    match router::reserve_decision(tx, &decision).await? {
                        Reservation::Assigned { agent_id, rule_id, reason } => {
                            tasks::assign_task(tx, task.id, agent_id, rule_id, &reason, task.version).await?;
                        }
                        Reservation::Unassigned { reason } => {
                            tasks::record_routing_decision(tx, task.id, &reason, task.version).await?;
                        }
                    }
                }

                Ok::<_, CoreError>(task.id)
            }
        })
        .await?;

    let task = tasks::get_task(db, task_id)
        .await?
        .ok_or(CoreError::TaskNotFound(task_id))?;

    activity_log::insert_activity_entry(
        db,
        "task",
        task.id,
        "created",
        "system",
        serde_json::json!({"status": task.status}),
    )
    .await?;

    let mut events = vec![];
    if task.assigned_agent_id.is_some() {
        events.push(
            Event::new(
                TriggerEvent::TaskAssigned,
                Some(project_id),
                serde_json::json!({"task_id": task.id, "agent_id": task.assigned_agent_id}),
            ),
        );
    }

    Ok((task, events))
}

/// Create up to 50 tasks as a single atomic batch.
/// Each task may carry an explicit `Assignment::Agent`, but `Assignment::Auto`
/// is rejected -- running the router per item inside one shared transaction
/// would let an earlier item's reservation change what a later item's
/// snapshot-based decision saw, defeating the point of evaluating outside
/// the transaction. Bulk creation is for backlog import, where explicit or
/// no assignment is the common case.
pub async fn create_tasks_bulk(db: &Db, project_id: Uuid, inputs: Vec<NewTask>) -> Result<Vec<Task>, CoreError> {
    if inputs.is_empty() || inputs.len() > 50 {
        return Err(CoreError::Validation(format!(
            "bulk task creation accepts 1..=50 tasks, got {}",
            inputs.len()
        )));
    }
    if inputs.iter().any(|t| matches!(t.assignment, Assignment::Auto)) {
        return Err(CoreError::Validation(
            "automatic routing is not supported on the bulk creation path".to_string(),
        ));
    }

    projects::get_project(db, project_id)
        .await?
        .ok_or(CoreError::ProjectNotFound(project_id))?;

    for input in &inputs {
        if let Assignment::Agent(agent_id) = input.assignment {
            agents::get_agent(db, agent_id)
                .await?
                .ok_or(CoreError::AgentNotFound(agent_id))?;
        }
    }

    let task_ids = db
        .tx(|tx| {
            let inputs = inputs.clone();
            async move {
                let mut ids = Vec::with_capacity(inputs.len());
                for input in inputs {
                    let task = tasks::insert_task_in_tx(
                        tx,
                        project_id,
                        &input.title,
                        &input.description,
                        input.capacity_cost,
                        input.priority,
                        &input.tags,
                        input.context,
                    )
                    .await?;

                    if let Assignment::Agent(agent_id) = input.assignment {
                        let decision = router::RoutingDecision {
                            rule_id: None,
                            agent_id: Some(agent_id),
                            reason: "explicit assignment at creation".to_string(),
                        };
                        match router::reserve_decision(tx, &decision).await? {
                            Reservation::Assigned { agent_id, rule_id, reason } => {
                                tasks::assign_task(tx, task.id, agent_id, rule_id, &reason, task.version).await?;
                            }
                            Reservation::Unassigned { reason } => {
                                tasks::record_routing_decision(tx, task.id, &reason, task.version).await?;
                            }
                        }
                    }
                    ids.push(task.id);
                }
                Ok::<_, CoreError>(ids)
            }
        })
        .await?;

    let mut created = Vec::with_capacity(task_ids.len());
    for id in task_ids {
        let task = tasks::get_task(db, id).await?.ok_or(CoreError::TaskNotFound(id))?;
        activity_log::insert_activity_entry(db, "task", task.id, "created", "system", serde_json::json!({}))
            .await?;
        created.push(task);
    }
    Ok(created)
}

/// Atomic self-assignment. Reserves capacity only when the task
/// was previously unassigned; reclaiming a task already assigned to the
/// same agent is a capacity no-op.
pub async fn claim_task(db: &Db, task_id: Uuid, agent_id: Uuid) -> Result<(Task, Vec<Event>), CoreError> {
    db.tx(|tx| async move {
        let before = tasks::get_task_in_tx(tx, task_id)
            .await?
            .ok_or(CoreError::TaskNotFound(task_id))?;

        let was_unassigned = before.assigned_agent_id.is_none();

        let rows = tasks::claim_task(tx, task_id, agent_id).await?;
        if rows == 0 {
            return Err(CoreError::ClaimConflict(task_id));
        }

        if was_unassigned {
            match agents::reserve_capacity(tx, agent_id).await? {
                Ok(()) => {}
                Err(failure) => {
                    return Err(CoreError::Reservation {
                        agent_id,
                        source: failure.into(),
                    });
                }
            }
        }

        Ok::<_, CoreError>(())
    })
    .await?;

    let task = tasks::get_task(db, task_id)
        .await?
        .ok_or(CoreError::TaskNotFound(task_id))?;

    activity_log::insert_activity_entry(
        db,
        "task",
        task_id,
        "claimed",
        &format!("agent:{agent_id}"),
        serde_json::json!({}),
    )
    .await?;

    let events = vec![Event::new(
        TriggerEvent::TaskAssigned,
        Some(task.project_id),
        serde_json::json!({"task_id": task.id, "agent_id": agent_id}),
    )];
    Ok((task, events))
}

fn valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Assigned)
            | (Pending, Cancelled)
            | (Assigned, InProgress)
            | (Assigned, Cancelled)
            | (InProgress, Review)
            | (InProgress, Cancelled)
            | (Review, Completed)
            | (Review, Assigned)
            | (Review, Cancelled)
    )
}

/// Drive a task through one edge of the state machine, maintaining the
/// assigned agent's capacity counter: releasing on entry into a terminal
/// status, nothing to adjust on `review -> assigned` since both states
/// count toward capacity.
pub async fn transition_status(db: &Db, task_id: Uuid, to: TaskStatus, actor: &str) -> Result<(Task, Vec<Event>), CoreError> {
    db.tx(|tx| async move {
        let before = tasks::get_task_in_tx(tx, task_id)
            .await?
            .ok_or(CoreError::TaskNotFound(task_id))?;
        let from = before.status().map_err(|e| CoreError::Validation(e.to_string()))?;

        if !valid_transition(from, to) {
            return Err(CoreError::InvalidTransition {
                task_id,
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let rows = tasks::transition_task_status_in_tx(tx, task_id, &to.to_string(), before.version).await?;
        if rows == 0 {
            return Err(CoreError::VersionConflict(task_id));
        }

        let entering_terminal = matches!(to, TaskStatus::Completed | TaskStatus::Cancelled);
        let leaving_terminal = matches!(from, TaskStatus::Completed | TaskStatus::Cancelled);
        if let Some(agent_id) = before.assigned_agent_id {
            if entering_terminal && !leaving_terminal {
                agents::release_capacity(tx, agent_id).await?;
            } else if leaving_terminal && !entering_terminal {
                agents::force_increment_capacity(tx, agent_id).await?;
            }
        }

        Ok::<_, CoreError>(())
    })
    .await?;

    let task = tasks::get_task(db, task_id)
        .await?
        .ok_or(CoreError::TaskNotFound(task_id))?;

    activity_log::insert_activity_entry(
        db,
        "task",
        task_id,
        &format!("status_changed:{}", task.status),
        actor,
        serde_json::json!({"to": task.status}),
    )
    .await?;

    let mut events = vec![Event::new(
        TriggerEvent::TaskStatusChanged,
        Some(task.project_id),
        serde_json::json!({"task_id": task.id, "status": task.status}),
    )];
    if to == TaskStatus::Completed {
        events.push(Event::new(
            TriggerEvent::TaskCompleted,
            Some(task.project_id),
            serde_json::json!({"task_id": task.id}),
        ));
    }
    Ok((task, events))
}

/// Re-run the router against an already-created task, replacing its
/// assignment. Restricted to `pending`/`assigned` tasks -- reassigning
/// in-flight work (`in_progress`/`review`) would require deciding what
/// happens to the old agent's partial progress, which is out of scope here.
pub async fn reassign_auto(db: &Db, task_id: Uuid) -> Result<(Task, Vec<Event>), CoreError> {
    let before = tasks::get_task(db, task_id)
        .await?
        .ok_or(CoreError::TaskNotFound(task_id))?;
    let from = before.status().map_err(|e| CoreError::Validation(e.to_string()))?;
    if !matches!(from, TaskStatus::Pending | TaskStatus::Assigned) {
        return Err(CoreError::InvalidTransition {
            task_id,
            from: from.to_string(),
            to: "reassigned".to_string(),
        });
    }

    let descriptor = descriptor_for(&before);
    let decision = router::decide(db, before.project_id, &descriptor).await?;

    db.tx(|tx| async move {
        if let Some(old_agent_id) = before.assigned_agent_id {
            agents::release_capacity(tx, old_agent_id).await?;
        }

        match router::reserve_decision(tx, &decision).await? {
            Reservation::Assigned { agent_id, rule_id, reason } => {
                tasks::assign_task(tx, task_id, agent_id, rule_id, &reason, before.version).await?;
            }
            Reservation::Unassigned { reason } => {
                tasks::unassign_to_pending(tx, task_id, &reason, before.version).await?;
            }
        }
        Ok::<_, CoreError>(())
    })
    .await?;

    let task = tasks::get_task(db, task_id)
        .await?
        .ok_or(CoreError::TaskNotFound(task_id))?;

    activity_log::insert_activity_entry(
        db,
        "task",
        task_id,
        "reassigned",
        "system",
        serde_json::json!({"agent_id": task.assigned_agent_id}),
    )
    .await?;

    let mut events = vec![];
    if task.assigned_agent_id.is_some() {
        events.push(Event::new(
            TriggerEvent::TaskAssigned,
            Some(task.project_id),
            serde_json::json!({"task_id": task.id, "agent_id": task.assigned_agent_id}),
        ));
    }
    Ok((task, events))
}

/// Edit mutable fields. Rejected on terminal tasks.
pub async fn edit_task(
    db: &Db,
    task_id: Uuid,
    title: Option<&str>,
    description: Option<&str>,
    priority: Option<i32>,
    tags: Option<&[String]>,
) -> Result<Task, CoreError> {
    let before = tasks::get_task(db, task_id)
        .await?
        .ok_or(CoreError::TaskNotFound(task_id))?;
    let status = before.status().map_err(|e| CoreError::Validation(e.to_string()))?;
    if matches!(status, TaskStatus::Completed | TaskStatus::Cancelled) {
        return Err(CoreError::InvalidTransition {
            task_id,
            from: status.to_string(),
            to: "edited".to_string(),
        });
    }

    let rows = tasks::update_task_fields(db, task_id, title, description, priority, tags, before.version).await?;
    if rows == 0 {
        return Err(CoreError::VersionConflict(task_id));
    }

    tasks::get_task(db, task_id).await?.ok_or(CoreError::TaskNotFound(task_id))
}

/// Delete a task, releasing any capacity it still held. Deliverables and
/// progress entries cascade via the foreign key.
pub async fn delete_task(db: &Db, task_id: Uuid) -> Result<(), CoreError> {
    let task = tasks::get_task(db, task_id)
        .await?
        .ok_or(CoreError::TaskNotFound(task_id))?;

    db.tx(|tx| async move {
        if task.counts_toward_capacity() {
            if let Some(agent_id) = task.assigned_agent_id {
                agents::release_capacity(tx, agent_id).await?;
            }
        }
        Ok::<_, CoreError>(())
    })
    .await?;

    tasks::delete_task(db, task_id).await?;
    activity_log::insert_activity_entry(db, "task", task_id, "deleted", "system", serde_json::json!({})).await?;
    Ok(())
}

/// Append a progress note. Does not affect `status`.
pub async fn add_progress(db: &Db, task_id: Uuid, note: &str) -> Result<fleet_db::models::ProgressEntry, CoreError> {
    tasks::get_task(db, task_id)
        .await?
        .ok_or(CoreError::TaskNotFound(task_id))?;
    Ok(progress::insert_progress_entry(db, task_id, note).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::queries::{agents, projects};

    fn new_task() -> NewTask {
        NewTask {
            title: "t".into(),
            description: "d".into(),
            capacity_cost: 1,
            priority: 2,
            tags: vec![],
            context: serde_json::json!({}),
            assignment: Assignment::None,
        }
    }

    /// Scenario: agent at max=2/count=1, two concurrent reservations.
    /// Exactly one succeeds; the other is left unassigned with the
    /// capacity failure recorded; the agent's final count is 2, never 3.
    #[tokio::test]
    async fn concurrent_creation_against_a_near_full_agent_never_oversubscribes() {
        let (db, _tmp) = fleet_test_utils::sqlite_test_db().await;
        let agent = agents::insert_agent(&db, "a", &[], Some(2)).await.unwrap();
        let project = projects::insert_project(&db, "p", None).await.unwrap();
        // pre-load one slot so the agent starts at 1/2, matching the scenario.
        db.tx(|tx| {
            let agent_id = agent.id;
            async move { agents::reserve_capacity(tx, agent_id).await }
        })
        .await
        .unwrap()
        .unwrap();

        let mut t1 = new_task();
        t1.assignment = Assignment::Agent(agent.id);
        let mut t2 = new_task();
        t2.assignment = Assignment::Agent(agent.id);

        let (r1, r2) = tokio::join!(
            create_task(&db, project.id, t1),
            create_task(&db, project.id, t2),
        );
        let (task1, _) = r1.unwrap();
        let (task2, _) = r2.unwrap();

        let assigned_count = [&task1, &task2].iter().filter(|t| t.assigned_agent_id == Some(agent.id)).count();
        assert_eq!(assigned_count, 1, "exactly one of the two tasks should have won the remaining slot");

        let unassigned = if task1.assigned_agent_id.is_some() { &task2 } else { &task1 };
        assert!(unassigned.routing_decision.as_deref().unwrap_or_default().contains("at capacity"));

        let reloaded = agents::get_agent(&db, agent.id).await.unwrap().unwrap();
        assert_eq!(reloaded.capacity_in_use, 2);
    }

    /// Scenario: task pending and unassigned, two agents race `claim`.
    /// Exactly one gets the assignment; the other sees a conflict; the
    /// combined active-task-count increase across both agents is exactly 1.
    #[tokio::test]
    async fn concurrent_claims_on_the_same_task_have_exactly_one_winner() {
        let (db, _tmp) = fleet_test_utils::sqlite_test_db().await;
        let agent_a = agents::insert_agent(&db, "a", &[], None).await.unwrap();
        let agent_b = agents::insert_agent(&db, "b", &[], None).await.unwrap();
        let project = projects::insert_project(&db, "p", None).await.unwrap();
        let (task, _) = create_task(&db, project.id, new_task()).await.unwrap();

        let (ra, rb) = tokio::join!(
            claim_task(&db, task.id, agent_a.id),
            claim_task(&db, task.id, agent_b.id),
        );

        let outcomes = [ra.is_ok(), rb.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "exactly one claim should win");

        let a_reloaded = agents::get_agent(&db, agent_a.id).await.unwrap().unwrap();
        let b_reloaded = agents::get_agent(&db, agent_b.id).await.unwrap().unwrap();
        assert_eq!(a_reloaded.capacity_in_use + b_reloaded.capacity_in_use, 1);

        let task_reloaded = tasks::get_task(&db, task.id).await.unwrap().unwrap();
        assert_eq!(task_reloaded.status, "assigned");
    }

    /// Scenario: task assigned to A (1/5 in use). Auto-reassign picks B,
    /// who is already at capacity (1/1). The reservation on B fails, so the
    /// task ends up unassigned; A's slot is released regardless, and B's
    /// count is untouched -- no leaked or double-counted capacity.
    #[tokio::test]
    async fn reassign_fallback_releases_old_agent_even_when_new_reservation_fails() {
        let (db, _tmp) = fleet_test_utils::sqlite_test_db().await;
        let agent_a = agents::insert_agent(&db, "a", &[], Some(5)).await.unwrap();
        let agent_b = agents::insert_agent(&db, "b", &[], Some(1)).await.unwrap();
        let project = projects::insert_project(&db, "p", None).await.unwrap();

        // fill B to capacity before the rule ever points at it.
        db.tx(|tx| {
            let agent_id = agent_b.id;
            async move { agents::reserve_capacity(tx, agent_id).await }
        })
        .await
        .unwrap()
        .unwrap();

        router::replace_rules(
            &db,
            project.id,
            vec![router::NewRule {
                name: "to-b".into(),
                conditions: serde_json::json!({}),
                assign_to: Some(agent_b.id),
                assign_to_capability: None,
                assign_strategy: "first_available".into(),
                fallback_to: None,
            }],
        )
        .await
        .unwrap();

        let mut input = new_task();
        input.assignment = Assignment::Agent(agent_a.id);
        let (task, _) = create_task(&db, project.id, input).await.unwrap();
        assert_eq!(task.assigned_agent_id, Some(agent_a.id));

        let (reassigned, _) = reassign_auto(&db, task.id).await.unwrap();
        assert_eq!(reassigned.assigned_agent_id, None, "B is full, so the task should fall back to unassigned");
        assert_eq!(reassigned.status, "pending");

        let a_reloaded = agents::get_agent(&db, agent_a.id).await.unwrap().unwrap();
        let b_reloaded = agents::get_agent(&db, agent_b.id).await.unwrap().unwrap();
        assert_eq!(a_reloaded.capacity_in_use, 0, "A's slot must be released even though B's reservation failed");
        assert_eq!(b_reloaded.capacity_in_use, 1, "B's count must not change on a failed reservation attempt");
    }

    #[tokio::test]
    async fn transitioning_into_a_terminal_status_releases_capacity() {
        let (db, _tmp) = fleet_test_utils::sqlite_test_db().await;
        let agent = agents::insert_agent(&db, "a", &[], Some(1)).await.unwrap();
        let project = projects::insert_project(&db, "p", None).await.unwrap();
        let mut input = new_task();
        input.assignment = Assignment::Agent(agent.id);
        let (task, _) = create_task(&db, project.id, input).await.unwrap();
        assert_eq!(task.assigned_agent_id, Some(agent.id));

        transition_status(&db, task.id, TaskStatus::InProgress, "agent").await.unwrap();
        transition_status(&db, task.id, TaskStatus::Review, "agent").await.unwrap();
        let (completed, events) = transition_status(&db, task.id, TaskStatus::Completed, "reviewer").await.unwrap();
        assert_eq!(completed.status, "completed");
        assert!(events.iter().any(|e| e.kind == TriggerEvent::TaskCompleted));

        let reloaded_agent = agents::get_agent(&db, agent.id).await.unwrap().unwrap();
        assert_eq!(reloaded_agent.capacity_in_use, 0, "completing the task should release its slot");
    }
}
