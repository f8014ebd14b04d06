// HTTP API routes
//
// Each submodule handles one resource type with its own AppState. Both are
// mounted under /api/v1/workflows.

pub mod common;
pub mod schedules;
pub mod workflows;

// Re-export common types
pub use common::{ApiError, ApiResponse, ApiResult};
