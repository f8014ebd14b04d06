// Workflow run HTTP routes
//
// Start, cancel, query and list runs. Paths are relative to
// /api/v1/workflows.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use keel_durable::control::{ActivityProgress, RunDetails, RunSummary};
use keel_durable::engine::StartRunRequest;
use keel_durable::ControlApi;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::common::{epoch_seconds, ApiError, ApiResponse, ApiResult};

/// Request to start a workflow run
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    /// Registered workflow type.
    #[schema(example = "sequence")]
    pub workflow_type: String,
    /// Business identifier of the run. Generated when absent.
    #[serde(default)]
    #[schema(example = "order-42")]
    pub workflow_id: Option<String>,
    /// Input passed to the workflow.
    #[serde(default)]
    #[schema(value_type = Object, example = json!({ "steps": ["fetch", "store"] }))]
    pub input: serde_json::Value,
    /// Deadline of the whole run, in milliseconds.
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
}

/// Identity of a started run
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStarted {
    pub workflow_id: String,
    pub run_id: Uuid,
}

/// Optional body of a cancellation
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkflowCancellationRequest {
    /// Run to cancel. The open run of the workflow when absent.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    /// Recorded on the run. Defaults to "Cancelled via API".
    #[serde(default)]
    pub reason: Option<String>,
}

/// Query parameters for listing running workflows
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct RunningQuery {
    /// Maximum number of runs returned (default 100)
    pub max_results: Option<usize>,
}

/// Query parameters for describing a workflow run
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct RunQuery {
    /// Specific run. The open run, or else the latest one, when absent.
    pub run_id: Option<Uuid>,
}

/// An in-flight activity
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInfo {
    pub activity_id: String,
    pub activity_type: String,
    /// SCHEDULED, STARTED, COMPLETED, FAILED, TIMED_OUT or CANCELLED.
    pub status: String,
    pub attempt: u32,
    /// Start of the current attempt, in epoch seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_time: Option<i64>,
}

impl From<&ActivityProgress> for ActivityInfo {
    fn from(activity: &ActivityProgress) -> Self {
        Self {
            activity_id: activity.activity_id.clone(),
            activity_type: activity.activity_type.clone(),
            status: activity_status(activity),
            attempt: activity.attempt,
            started_time: activity.started_time.map(epoch_seconds),
        }
    }
}

fn activity_status(activity: &ActivityProgress) -> String {
    serde_json::to_value(activity.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// One running workflow
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDetailsResponse {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    /// Start time in epoch seconds.
    pub start_time: i64,
    #[schema(example = "RUNNING")]
    pub status: String,
    /// Number of in-flight activities.
    pub activity_count: usize,
    pub activities_in_progress: Vec<ActivityInfo>,
}

impl From<&RunSummary> for WorkflowDetailsResponse {
    fn from(run: &RunSummary) -> Self {
        Self {
            workflow_id: run.workflow_id.clone(),
            run_id: run.run_id,
            workflow_type: run.workflow_type.clone(),
            start_time: epoch_seconds(run.start_time),
            status: run.status.to_string(),
            activity_count: run.activity_count,
            activities_in_progress: run.activities_in_progress.iter().map(Into::into).collect(),
        }
    }
}

/// Error a run failed with
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Full state of one run
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunResponse {
    #[serde(flatten)]
    pub details: WorkflowDetailsResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[schema(value_type = Object)]
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Every activity of the run.
    pub activities: Vec<ActivityInfo>,
    pub event_count: u64,
}

impl From<&RunDetails> for WorkflowRunResponse {
    fn from(run: &RunDetails) -> Self {
        Self {
            details: WorkflowDetailsResponse::from(&run.summary),
            close_time: run.close_time.map(epoch_seconds),
            deadline: run.deadline.map(epoch_seconds),
            schedule_id: run.schedule_id.clone(),
            input: run.input.clone(),
            result: run.result.clone(),
            error: run.error.as_ref().map(|e| RunErrorInfo {
                message: e.message.clone(),
                code: e.code.clone(),
            }),
            cancel_reason: run.cancel_reason.clone(),
            activities: run.activities.iter().map(Into::into).collect(),
            event_count: run.event_count,
        }
    }
}

/// App state for workflow routes
#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlApi>,
}

impl AppState {
    pub fn new(control: Arc<ControlApi>) -> Self {
        Self { control }
    }
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows", post(start_workflow))
        .route("/workflows/running", get(list_running_workflows))
        .route(
            "/workflows/:workflow_id",
            get(get_workflow).delete(cancel_workflow),
        )
        .with_state(state)
}

/// POST /workflows - Start a workflow run
#[utoipa::path(
    post,
    path = "/api/v1/workflows/workflows",
    request_body = StartWorkflowRequest,
    responses(
        (status = 201, description = "Run started", body = ApiResponse<WorkflowStarted>),
        (status = 400, description = "Invalid request or unknown workflow type"),
        (status = 500, description = "Duplicate open run or internal error")
    ),
    tag = "workflows"
)]
pub async fn start_workflow(
    State(state): State<AppState>,
    Json(req): Json<StartWorkflowRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowStarted>>), ApiError> {
    let mut request = StartRunRequest::new(req.workflow_type, req.input);
    request.workflow_id = req.workflow_id;
    request.run_timeout = req.run_timeout_ms.map(Duration::from_millis);

    let run = state
        .control
        .start_run(request)
        .await
        .map_err(|e| ApiError::from_control("Failed to start workflow", e))?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(
            "Workflow started successfully",
            WorkflowStarted {
                workflow_id: run.workflow_id,
                run_id: run.run_id,
            },
        )),
    ))
}

/// DELETE /workflows/{workflow_id} - Request cancellation of a run
#[utoipa::path(
    delete,
    path = "/api/v1/workflows/workflows/{workflow_id}",
    params(("workflow_id" = String, Path, description = "Workflow ID")),
    request_body(content = WorkflowCancellationRequest, description = "Optional run and reason"),
    responses(
        (status = 200, description = "Cancellation requested", body = ApiResponse<String>),
        (status = 400, description = "Malformed request body"),
        (status = 500, description = "No matching run, run already closed, or internal error")
    ),
    tag = "workflows"
)]
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    body: Bytes,
) -> ApiResult<String> {
    let req = parse_cancellation(&body)?;
    let workflow_id = state
        .control
        .cancel_run(&workflow_id, req.run_id, req.reason)
        .await
        .map_err(|e| ApiError::from_control("Failed to cancel workflow", e))?;

    Ok(Json(ApiResponse::success(
        "Workflow cancelled successfully",
        workflow_id,
    )))
}

/// An empty body means defaults; a present body must be valid
fn parse_cancellation(body: &[u8]) -> Result<WorkflowCancellationRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(WorkflowCancellationRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        ApiError::bad_request(format!(
            "Failed to cancel workflow: invalid request body: {}",
            e
        ))
    })
}

/// GET /workflows/running - List open runs
#[utoipa::path(
    get,
    path = "/api/v1/workflows/workflows/running",
    params(RunningQuery),
    responses(
        (status = 200, description = "Running workflows", body = ApiResponse<Vec<WorkflowDetailsResponse>>),
        (status = 400, description = "Invalid maxResults"),
        (status = 500, description = "Store unavailable")
    ),
    tag = "workflows"
)]
pub async fn list_running_workflows(
    State(state): State<AppState>,
    Query(query): Query<RunningQuery>,
) -> ApiResult<Vec<WorkflowDetailsResponse>> {
    let runs = state
        .control
        .list_running_runs(query.max_results)
        .await
        .map_err(|e| ApiError::from_control("Failed to retrieve workflows", e))?;

    Ok(Json(ApiResponse::success(
        "Retrieved running workflows",
        runs.iter().map(Into::into).collect(),
    )))
}

/// GET /workflows/{workflow_id} - Describe a run
#[utoipa::path(
    get,
    path = "/api/v1/workflows/workflows/{workflow_id}",
    params(("workflow_id" = String, Path, description = "Workflow ID"), RunQuery),
    responses(
        (status = 200, description = "Run state", body = ApiResponse<WorkflowRunResponse>),
        (status = 500, description = "No matching run or internal error")
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<RunQuery>,
) -> ApiResult<WorkflowRunResponse> {
    let run = state
        .control
        .query_run(&workflow_id, query.run_id)
        .await
        .map_err(|e| ApiError::from_control("Failed to retrieve workflow", e))?;

    Ok(Json(ApiResponse::success(
        "Retrieved workflow",
        WorkflowRunResponse::from(&run),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_request_defaults() {
        let req: StartWorkflowRequest =
            serde_json::from_value(json!({ "workflowType": "sequence" })).unwrap();
        assert_eq!(req.workflow_type, "sequence");
        assert!(req.workflow_id.is_none());
        assert!(req.input.is_null());
        assert!(req.run_timeout_ms.is_none());
    }

    #[test]
    fn test_cancellation_body_is_optional_but_checked() {
        let empty = parse_cancellation(b"").unwrap();
        assert!(empty.run_id.is_none() && empty.reason.is_none());
        assert!(parse_cancellation(b"  \n").unwrap().run_id.is_none());

        let req = parse_cancellation(br#"{"reason":"cleanup"}"#).unwrap();
        assert_eq!(req.reason.as_deref(), Some("cleanup"));

        for body in [
            &br#"{"runId":"not-a-uuid"}"#[..],
            &br#"{"runID":"0190f5a4-0000-7000-8000-000000000000"}"#[..],
            &b"{"[..],
        ] {
            let err = parse_cancellation(body).unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn test_details_use_camel_case() {
        let details = WorkflowDetailsResponse {
            workflow_id: "order-1".to_string(),
            run_id: Uuid::nil(),
            workflow_type: "sequence".to_string(),
            start_time: 1_700_000_000,
            status: "RUNNING".to_string(),
            activity_count: 1,
            activities_in_progress: vec![ActivityInfo {
                activity_id: "a".to_string(),
                activity_type: "echo".to_string(),
                status: "SCHEDULED".to_string(),
                attempt: 1,
                started_time: None,
            }],
        };

        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["workflowId"], "order-1");
        assert_eq!(value["activityCount"], 1);
        assert_eq!(value["activitiesInProgress"][0]["activityType"], "echo");
        assert!(value["activitiesInProgress"][0].get("startedTime").is_none());
    }
}
