//! Schedule registry.
//!
//! Schedules are named recurring pipelines stored in the `[[schedules]]`
//! array of the project file. A schedule's name is the id its run state is
//! stored under.

mod service;

pub use service::*;
