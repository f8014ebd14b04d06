//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - May fail and be retried according to the retry policy
//! - Can send heartbeats to keep their lease alive
//! - Support cancellation via tokens

mod context;
mod definition;
mod executor;

pub use context::{ActivityContext, HeartbeatError, HeartbeatPayload};
pub use definition::{Activity, ActivityError};
pub use executor::{
    ActivityExecutor, ActivityOutcome, INVALID_INPUT, PANICKED, UNKNOWN_ACTIVITY_TYPE,
};
