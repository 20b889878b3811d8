//! Lifecycle policies: retry/cooldown, seeding and gap healing.
//!
//! The decision functions are pure; the `Seeder` and `GapHealer` apply them
//! to a stage's status table.

pub mod gaps;
pub mod retry;
pub mod seeding;

pub use gaps::{missing_ids, GapHealer};
pub use retry::{FailureOutcome, RetryPolicy};
pub use seeding::{plan_seed, SeedConfig, SeedPlan, Seeder};
