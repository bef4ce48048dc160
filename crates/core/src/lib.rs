//! `platform-core` — shared building blocks for the platform crates.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, their parse error and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, add_std, sub_std};
pub use error::DomainError;
pub use id::{ExecutionId, TenantId};
