pub mod activity_log;
pub mod agents;
pub mod auth;
pub mod delivery_logs;
pub mod deliverables;
pub mod progress;
pub mod projects;
pub mod routes;
pub mod routing_cursors;
pub mod routing_rules;
pub mod tasks;
