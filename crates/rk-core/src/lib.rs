//! rk-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other rk-* crates,
//! providing type-safe identifiers, a unified error type with the failure
//! taxonomy used by the retry policy, library-domain enums, application
//! configuration, a clock abstraction, and a broadcast event bus.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod media;

// Re-export the most commonly used items at the crate root.
pub use clock::{Clock, Deadline, ManualClock, SystemClock};
pub use error::{Error, FailureKind, Result};
pub use ids::*;
pub use media::*;
