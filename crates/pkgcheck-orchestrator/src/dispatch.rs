use std::time::Duration;

use pkgcheck_core::{CheckError, EvaluationId, QueueChannel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE: &str = "package-validation";
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_millis(5000);

/// Everything a validation worker needs to start collecting metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRequest<'r> {
    pub cid: EvaluationId,
    pub package_name: Option<&'r str>,
    pub package_json: Option<&'r str>,
    pub package_lock: Option<&'r str>,
    pub yarn_lock: Option<&'r str>,
    pub is_production: Option<bool>,
}

/// Queue payload. Unset optional fields are omitted, never `null`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationJob {
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yarn_lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production: Option<bool>,
}

impl From<&DispatchRequest<'_>> for ValidationJob {
    fn from(request: &DispatchRequest<'_>) -> Self {
        Self {
            cid: request.cid.to_string(),
            pkg: request
                .package_json
                .or(request.package_name)
                .map(str::to_string),
            package_lock: request.package_lock.map(str::to_string),
            yarn_lock: request.yarn_lock.map(str::to_string),
            production: request.is_production,
        }
    }
}

pub trait JobDispatch {
    /// Publishes a validation job and returns once the broker durably
    /// accepted it.
    #[allow(clippy::missing_errors_doc)]
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<(), CheckError>;
}

/// Publishes jobs on a [`QueueChannel`] with publisher confirms.
pub struct QueueDispatcher<'a> {
    channel: &'a dyn QueueChannel,
    queue: String,
    confirm_timeout: Duration,
}

impl<'a> QueueDispatcher<'a> {
    #[must_use]
    pub fn new(channel: &'a dyn QueueChannel, queue: impl Into<String>) -> Self {
        Self {
            channel,
            queue: queue.into(),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_confirm_timeout(mut self, confirm_timeout: Duration) -> Self {
        self.confirm_timeout = confirm_timeout;
        self
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl JobDispatch for QueueDispatcher<'_> {
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<(), CheckError> {
        let job = ValidationJob::from(request);
        let payload = serde_json::to_vec(&job)
            .map_err(|err| CheckError::Dispatch(format!("failed to encode job: {err}")))?;

        self.channel.assert_queue(&self.queue).map_err(as_dispatch)?;
        self.channel
            .send_to_queue(&self.queue, &payload)
            .map_err(as_dispatch)?;
        debug!(queue = %self.queue, cid = %job.cid, "job published, waiting for confirm");

        if let Err(err) = self.channel.wait_for_confirms(self.confirm_timeout) {
            warn!(queue = %self.queue, cid = %job.cid, error = %err, "job not confirmed");
            return Err(as_dispatch(err));
        }
        info!(queue = %self.queue, cid = %job.cid, "job confirmed");
        Ok(())
    }
}

fn as_dispatch(err: CheckError) -> CheckError {
    match err {
        CheckError::Dispatch(_) => err,
        other => CheckError::Dispatch(other.to_string()),
    }
}
