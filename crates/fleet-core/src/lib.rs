//! Core coordination logic: the task router, the task lifecycle state
//! machine, and deliverable versioning. Builds on [`fleet_db`] for
//! persistence and leaves HTTP framing, auth, and dispatch to their own
//! crates.

pub mod deliverables;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod router;

pub use error::{CoreError, ReservationError};
pub use events::{Event, TriggerEvent};
