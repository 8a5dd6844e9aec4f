//! The authorization predicate, factored as a pure function over a closed
//! `Identity` and a closed `Entity` rather than a polymorphic "request"
//! object threaded through ad-hoc checks. Pool-free and fully testable in
//! isolation; callers resolve the `Entity` from already-loaded rows.

use uuid::Uuid;

use crate::identity::{Identity, Role};

/// The operation an identity is attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    CreateTask,
    EditTask,
    ClaimTask,
    SubmitDeliverable,
    ReviewDeliverable,
    ManageRouting,
    ManageProjects,
}

/// The thing being acted on, reduced to the facts authorization needs:
/// which agent (if any) owns it, and that agent's `owner_user_id` (so a
/// sibling agent under the same owning user can be recognized without a
/// second lookup). Project-scoped entities (routing rules, routes, project
/// records) carry no owning agent at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Task {
        owner_agent_id: Option<Uuid>,
        owner_agent_owner_user_id: Option<Uuid>,
    },
    Deliverable {
        owner_agent_id: Option<Uuid>,
        owner_agent_owner_user_id: Option<Uuid>,
    },
    ProjectScoped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Actions a role may take irrespective of entity ownership, per the
/// static role->scope mapping.
fn role_permits(role: Role, action: Action) -> bool {
    match role {
        Role::Admin => true,
        Role::Reviewer => !matches!(action, Action::ManageRouting | Action::ManageProjects),
        Role::Viewer => matches!(action, Action::Read),
    }
}

fn owner_agent_id(entity: Entity) -> Option<Uuid> {
    match entity {
        Entity::Task { owner_agent_id, .. } | Entity::Deliverable { owner_agent_id, .. } => owner_agent_id,
        Entity::ProjectScoped => None,
    }
}

fn owner_agent_owner_user_id(entity: Entity) -> Option<Uuid> {
    match entity {
        Entity::Task {
            owner_agent_owner_user_id, ..
        }
        | Entity::Deliverable {
            owner_agent_owner_user_id, ..
        } => owner_agent_owner_user_id,
        Entity::ProjectScoped => None,
    }
}

/// The authorization predicate. Pure and total: every `(identity, action,
/// entity)` triple maps to exactly one [`Decision`].
pub fn authorize(identity: &Identity, action: Action, entity: Entity) -> Decision {
    match identity {
        // Session admins pass everything; other session roles fall through
        // to the same role matrix a user key would get, since a session
        // user owns no agents directly.
        Identity::User { role: Role::Admin, .. } => Decision::Allow,
        Identity::User { role, .. } => {
            if role_permits(*role, action) {
                Decision::Allow
            } else {
                Decision::Deny
            }
        }

        Identity::UserKey {
            role,
            owned_agent_ids,
            ..
        } => {
            if role_permits(*role, action) {
                return Decision::Allow;
            }
            match owner_agent_id(entity) {
                Some(agent_id) if owned_agent_ids.contains(&agent_id) => Decision::Allow,
                _ => Decision::Deny,
            }
        }

        Identity::AgentKey {
            agent_id,
            owner_user_id,
        } => match owner_agent_id(entity) {
            Some(owner) if owner == *agent_id => Decision::Allow,
            Some(_owner) if owner_user_id.is_some() && owner_user_id == &owner_agent_owner_user_id(entity) => {
                // A sibling agent under the same owning user.
                Decision::Allow
            }
            _ => Decision::Deny,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Identity {
        Identity::User {
            id: Uuid::new_v4(),
            role: Role::Admin,
        }
    }

    #[test]
    fn session_admin_allowed_everywhere() {
        assert_eq!(
            authorize(&admin(), Action::ManageRouting, Entity::ProjectScoped),
            Decision::Allow
        );
    }

    #[test]
    fn session_viewer_denied_write_actions() {
        let viewer = Identity::User {
            id: Uuid::new_v4(),
            role: Role::Viewer,
        };
        assert_eq!(
            authorize(&viewer, Action::CreateTask, Entity::ProjectScoped),
            Decision::Deny
        );
        assert_eq!(
            authorize(&viewer, Action::Read, Entity::ProjectScoped),
            Decision::Allow
        );
    }

    #[test]
    fn reviewer_denied_routing_management() {
        let reviewer = Identity::User {
            id: Uuid::new_v4(),
            role: Role::Reviewer,
        };
        assert_eq!(
            authorize(&reviewer, Action::ManageRouting, Entity::ProjectScoped),
            Decision::Deny
        );
        assert_eq!(
            authorize(&reviewer, Action::ReviewDeliverable, Entity::ProjectScoped),
            Decision::Allow
        );
    }

    #[test]
    fn user_key_falls_back_to_owned_agent() {
        let agent_id = Uuid::new_v4();
        let identity = Identity::UserKey {
            user_id: Uuid::new_v4(),
            role: Role::Viewer,
            owned_agent_ids: vec![agent_id],
        };
        let owned_task = Entity::Task {
            owner_agent_id: Some(agent_id),
            owner_agent_owner_user_id: None,
        };
        let other_task = Entity::Task {
            owner_agent_id: Some(Uuid::new_v4()),
            owner_agent_owner_user_id: None,
        };
        assert_eq!(authorize(&identity, Action::EditTask, owned_task), Decision::Allow);
        assert_eq!(authorize(&identity, Action::EditTask, other_task), Decision::Deny);
    }

    #[test]
    fn agent_key_only_reaches_its_own_entities() {
        let agent_id = Uuid::new_v4();
        let identity = Identity::AgentKey {
            agent_id,
            owner_user_id: Some(Uuid::new_v4()),
        };
        let own_task = Entity::Task {
            owner_agent_id: Some(agent_id),
            owner_agent_owner_user_id: None,
        };
        let other_task = Entity::Task {
            owner_agent_id: Some(Uuid::new_v4()),
            owner_agent_owner_user_id: Some(Uuid::new_v4()),
        };
        assert_eq!(authorize(&identity, Action::ClaimTask, own_task), Decision::Allow);
        assert_eq!(authorize(&identity, Action::ClaimTask, other_task), Decision::Deny);
    }

    #[test]
    fn agent_key_reaches_sibling_agents_entities_under_the_same_owner() {
        let owner_user_id = Uuid::new_v4();
        let identity = Identity::AgentKey {
            agent_id: Uuid::new_v4(),
            owner_user_id: Some(owner_user_id),
        };
        let sibling_task = Entity::Task {
            owner_agent_id: Some(Uuid::new_v4()),
            owner_agent_owner_user_id: Some(owner_user_id),
        };
        let unrelated_task = Entity::Task {
            owner_agent_id: Some(Uuid::new_v4()),
            owner_agent_owner_user_id: Some(Uuid::new_v4()),
        };
        assert_eq!(authorize(&identity, Action::ClaimTask, sibling_task), Decision::Allow);
        assert_eq!(authorize(&identity, Action::ClaimTask, unrelated_task), Decision::Deny);
    }

    #[test]
    fn agent_key_denied_on_project_scoped_entities() {
        let identity = Identity::AgentKey {
            agent_id: Uuid::new_v4(),
            owner_user_id: None,
        };
        assert_eq!(
            authorize(&identity, Action::Read, Entity::ProjectScoped),
            Decision::Deny
        );
    }

    #[test]
    fn unassigned_entity_denied_to_scoped_identities() {
        let identity = Identity::AgentKey {
            agent_id: Uuid::new_v4(),
            owner_user_id: None,
        };
        let unassigned = Entity::Task {
            owner_agent_id: None,
            owner_agent_owner_user_id: None,
        };
        assert_eq!(authorize(&identity, Action::ClaimTask, unassigned), Decision::Deny);
    }
}
