//! Domain model (IDs, tasks, outcomes, retry decisions, dispositions).

pub mod decision;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider, RetryBackoff};
pub use ids::{EntryId, TaskId};
pub use outcome::Outcome;
pub use state::{SkipReason, TaskDisposition};
pub use task::{HandlerName, Task, TaskOptions};
