//! Ports: the seams to the outside world.
//!
//! The relational store is the source of truth for pending work; everything
//! the engine keeps in memory can be rebuilt from it after a restart.

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{EligibleQuery, TaskStore};
