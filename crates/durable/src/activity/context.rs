//! Activity execution context

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::workflow::RunKey;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Nobody is listening anymore (attempt finished or timed out)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// Cancellation is advisory: the token is tripped when the run is
/// cancelled or the workflow abandons the activity, and a well-behaved body
/// stops early. Bodies that ignore it simply run to completion and their
/// result is discarded.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for chunk in input.chunks {
///         tokio::select! {
///             _ = ctx.cancelled() => return Err(ActivityError::non_retryable("cancelled")),
///             r = upload(chunk) => r?,
///         }
///         ctx.heartbeat(None).await.ok();
///     }
///     Ok(Output::default())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Unique id of this execution (differs across redeliveries)
    pub execution_id: Uuid,

    /// Run that owns the activity
    pub run: RunKey,

    /// Activity ID within the run
    pub activity_id: String,

    /// Engine attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the retry policy
    pub max_attempts: u32,

    /// Queue delivery number of this attempt (1 unless redelivered)
    pub delivery: u32,

    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,

    cancellation: CancellationToken,
}

impl ActivityContext {
    pub fn new(run: RunKey, activity_id: impl Into<String>, attempt: u32, max_attempts: u32) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            run,
            activity_id: activity_id.into(),
            attempt,
            max_attempts,
            delivery: 1,
            heartbeat_tx: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_delivery(mut self, delivery: u32) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Use an externally owned token (the worker keeps one per in-flight activity)
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that cancels this execution when tripped
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Record a heartbeat
    ///
    /// The worker extends the queue lease on each heartbeat, so long
    /// activities should beat more often than the lease duration.
    ///
    /// # Errors
    ///
    /// Fails if the activity has been cancelled or nobody listens anymore.
    pub async fn heartbeat(&self, details: Option<serde_json::Value>) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
