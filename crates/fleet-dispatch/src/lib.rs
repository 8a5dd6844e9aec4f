//! The event dispatch and retry engine: matches fired
//! lifecycle events against configured routes, projects their payload
//! through each route's field mapping, attempts delivery to one of four
//! destination kinds, and durably logs every attempt so the [`sweeper`]
//! can recover from a crash mid-retry without an in-memory timer.

pub mod adapters;
pub mod dispatcher;
pub mod matching;
pub mod retry;
pub mod sweeper;
pub mod templates;

pub use dispatcher::emit;
pub use sweeper::{run_sweeper, sweep_once, SweeperConfig};
