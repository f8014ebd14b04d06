// Schedule HTTP routes
//
// Paths are relative to /api/v1/workflows.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use keel_durable::schedule::{Schedule, ScheduleError, ScheduleRequest, Trigger};
use keel_durable::{ControlApi, ControlError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::{epoch_seconds, ApiError, ApiResponse, ApiResult};

const INVALID_ACTION: &str = "Invalid action. Supported: CANCEL, PAUSE, UNPAUSE";

/// Request to create a schedule. Exactly one of `intervalMs` and `cron` is required.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleRequest {
    /// Identifier of the schedule. Generated when absent.
    #[serde(default)]
    #[schema(example = "nightly-report")]
    pub schedule_id: Option<String>,
    /// Registered workflow type started on every firing.
    #[schema(example = "sequence")]
    pub workflow_type: String,
    /// Input of every started run.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub input: serde_json::Value,
    /// Fire every this many milliseconds.
    #[serde(default)]
    #[schema(example = 60000)]
    pub interval_ms: Option<u64>,
    /// Fire at every match of a cron expression (5 or 6 fields, UTC).
    #[serde(default)]
    #[schema(example = "0 2 * * *")]
    pub cron: Option<String>,
    /// Deadline of every started run, in milliseconds.
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
}

impl CreateScheduleRequest {
    fn into_request(self) -> Result<ScheduleRequest, ApiError> {
        let trigger = match (self.interval_ms, self.cron) {
            (Some(ms), None) => Trigger::interval(Duration::from_millis(ms)),
            (None, Some(expression)) => Trigger::cron(expression),
            _ => {
                return Err(ApiError::bad_request(
                    "Failed to create schedule: exactly one of intervalMs and cron is required",
                ))
            }
        };

        let mut request = ScheduleRequest::new(trigger, self.workflow_type, self.input);
        request.schedule_id = self.schedule_id;
        request.run_timeout = self.run_timeout_ms.map(Duration::from_millis);
        Ok(request)
    }
}

/// Operator action on a schedule
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleActionRequest {
    /// CANCEL, PAUSE or UNPAUSE (any case).
    #[schema(example = "PAUSE")]
    pub action: String,
    /// Why the action was taken.
    #[serde(default)]
    pub reason: Option<String>,
}

/// A run started by a schedule
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRun {
    pub workflow_id: String,
    pub run_id: Uuid,
}

/// A schedule
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub schedule_id: String,
    pub workflow_type: String,
    #[schema(value_type = Object)]
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
    /// ACTIVE or PAUSED.
    #[schema(example = "ACTIVE")]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    /// Next firing in epoch seconds. Absent while paused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fire_time: Option<i64>,
    pub fire_count: u64,
    /// Most recent runs first.
    pub recent_runs: Vec<ScheduledRun>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&Schedule> for ScheduleResponse {
    fn from(schedule: &Schedule) -> Self {
        let (interval_ms, cron) = match &schedule.trigger {
            Trigger::Interval { every } => (Some(every.as_millis() as u64), None),
            Trigger::Cron { expression } => (None, Some(expression.clone())),
        };
        Self {
            schedule_id: schedule.schedule_id.clone(),
            workflow_type: schedule.workflow_type.clone(),
            input: schedule.input.clone(),
            interval_ms,
            cron,
            run_timeout_ms: schedule.run_timeout.map(|t| t.as_millis() as u64),
            status: schedule.status.to_string(),
            pause_reason: schedule.pause_reason.clone(),
            next_fire_time: schedule.next_fire_at.map(epoch_seconds),
            last_fire_time: schedule.last_fired_at.map(epoch_seconds),
            fire_count: schedule.fire_count,
            recent_runs: schedule
                .recent_runs
                .iter()
                .map(|run| ScheduledRun {
                    workflow_id: run.workflow_id.clone(),
                    run_id: run.run_id,
                })
                .collect(),
            created_at: epoch_seconds(schedule.created_at),
            updated_at: epoch_seconds(schedule.updated_at),
        }
    }
}

/// App state for schedule routes
#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlApi>,
}

impl AppState {
    pub fn new(control: Arc<ControlApi>) -> Self {
        Self { control }
    }
}

/// Create schedule routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/schedules", post(create_schedule).get(list_schedules))
        .route("/schedules/:schedule_id", get(get_schedule))
        .route("/schedules/:schedule_id/action", post(schedule_action))
        .with_state(state)
}

/// POST /schedules/{schedule_id}/action - Cancel, pause or unpause a schedule
#[utoipa::path(
    post,
    path = "/api/v1/workflows/schedules/{schedule_id}/action",
    params(("schedule_id" = String, Path, description = "Schedule ID")),
    request_body = ScheduleActionRequest,
    responses(
        (status = 200, description = "Action applied", body = ApiResponse<String>),
        (status = 400, description = "Invalid action"),
        (status = 500, description = "Unknown schedule or internal error")
    ),
    tag = "schedules"
)]
pub async fn schedule_action(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
    Json(req): Json<ScheduleActionRequest>,
) -> ApiResult<String> {
    let message = match req.action.trim().to_ascii_uppercase().as_str() {
        "CANCEL" => "Schedule cancelled successfully",
        "PAUSE" => "Schedule paused successfully",
        "UNPAUSE" => "Schedule unpaused successfully",
        _ => "",
    };

    let schedule_id = state
        .control
        .schedule_action(&schedule_id, &req.action, req.reason)
        .await
        .map_err(|e| match e {
            ControlError::Schedule(ScheduleError::InvalidAction(_)) => {
                ApiError::bad_request(INVALID_ACTION)
            }
            e => ApiError::from_control("Failed to perform action", e),
        })?;

    Ok(Json(ApiResponse::success(message, schedule_id)))
}

/// POST /schedules - Create a schedule
#[utoipa::path(
    post,
    path = "/api/v1/workflows/schedules",
    request_body = CreateScheduleRequest,
    responses(
        (status = 201, description = "Schedule created", body = ApiResponse<ScheduleResponse>),
        (status = 400, description = "Invalid trigger or unknown workflow type"),
        (status = 500, description = "Duplicate schedule ID or internal error")
    ),
    tag = "schedules"
)]
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ScheduleResponse>>), ApiError> {
    let schedule = state
        .control
        .create_schedule(req.into_request()?)
        .await
        .map_err(|e| ApiError::from_control("Failed to create schedule", e))?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(
            "Schedule created successfully",
            ScheduleResponse::from(&schedule),
        )),
    ))
}

/// GET /schedules - List schedules
#[utoipa::path(
    get,
    path = "/api/v1/workflows/schedules",
    responses(
        (status = 200, description = "Schedules", body = ApiResponse<Vec<ScheduleResponse>>),
        (status = 500, description = "Internal server error")
    ),
    tag = "schedules"
)]
pub async fn list_schedules(State(state): State<AppState>) -> ApiResult<Vec<ScheduleResponse>> {
    let schedules = state
        .control
        .list_schedules()
        .await
        .map_err(|e| ApiError::from_control("Failed to retrieve schedules", e))?;

    Ok(Json(ApiResponse::success(
        "Retrieved schedules",
        schedules.iter().map(Into::into).collect(),
    )))
}

/// GET /schedules/{schedule_id} - Describe a schedule
#[utoipa::path(
    get,
    path = "/api/v1/workflows/schedules/{schedule_id}",
    params(("schedule_id" = String, Path, description = "Schedule ID")),
    responses(
        (status = 200, description = "Schedule", body = ApiResponse<ScheduleResponse>),
        (status = 500, description = "Unknown schedule or internal error")
    ),
    tag = "schedules"
)]
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<ScheduleResponse> {
    let schedule = state
        .control
        .describe_schedule(&schedule_id)
        .await
        .map_err(|e| ApiError::from_control("Failed to retrieve schedule", e))?;

    Ok(Json(ApiResponse::success(
        "Retrieved schedule",
        ScheduleResponse::from(&schedule),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create(body: serde_json::Value) -> CreateScheduleRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_create_request_needs_one_trigger() {
        let interval = create(json!({ "workflowType": "sequence", "intervalMs": 1000 }))
            .into_request()
            .unwrap();
        assert_eq!(interval.trigger, Trigger::interval(Duration::from_secs(1)));

        let cron = create(json!({ "workflowType": "sequence", "cron": "*/5 * * * *" }))
            .into_request()
            .unwrap();
        assert_eq!(cron.trigger, Trigger::cron("*/5 * * * *"));

        for body in [
            json!({ "workflowType": "sequence" }),
            json!({ "workflowType": "sequence", "intervalMs": 1000, "cron": "* * * * *" }),
        ] {
            let err = create(body).into_request().unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
        }
    }
}
