use super::{AssistantSpec, CompletionService, DispatchError, RunStatus};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns the process-wide analysis assistant. Built once at startup and
/// shared with the dispatcher; the remote resource is created on first use
/// and concurrent first users all wait for the same creation.
pub struct AssistantProvisioner {
    spec: AssistantSpec,
    id: OnceCell<String>,
}

impl AssistantProvisioner {
    pub fn new(spec: AssistantSpec) -> Self {
        Self {
            spec,
            id: OnceCell::new(),
        }
    }

    /// Returns the assistant id, creating the assistant if this is the first
    /// call. A failed creation leaves the cell empty so the next caller tries
    /// again.
    pub async fn get_or_create(
        &self,
        service: &dyn CompletionService,
    ) -> Result<&str, DispatchError> {
        let id = self
            .id
            .get_or_try_init(|| async {
                let id = service.create_assistant(&self.spec).await?;
                info!(assistant_id = %id, name = %self.spec.name, "created analysis assistant");
                Ok::<_, DispatchError>(id)
            })
            .await?;
        Ok(id.as_str())
    }
}

/// Bounds for waiting on an analysis run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 120,
            max_wait: Duration::from_secs(120),
        }
    }
}

/// Polls a run until it completes. Fails on any other terminal status, when
/// either bound of `policy` is exceeded, or when `cancel` fires.
pub async fn await_run(
    service: &dyn CompletionService,
    thread_id: &str,
    run_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<(), DispatchError> {
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut last = RunStatus::Queued;
    let mut polls = 0;

    for attempt in 1..=max_attempts {
        last = service.run_status(thread_id, run_id).await?;
        polls = attempt;
        debug!(run_id, attempt, status = last.as_str(), "polled run");

        if last == RunStatus::Completed {
            return Ok(());
        }
        if last.is_terminal() {
            return Err(DispatchError::RunFailed(last.as_str().to_string()));
        }
        if attempt == max_attempts || started.elapsed() + policy.interval > policy.max_wait {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = service.cancel_run(thread_id, run_id).await {
                    warn!(run_id, "failed to cancel remote run: {}", e);
                }
                return Err(DispatchError::Cancelled);
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }

    if let Err(e) = service.cancel_run(thread_id, run_id).await {
        warn!(run_id, "failed to cancel timed out run: {}", e);
    }

    Err(DispatchError::Timeout {
        attempts: polls,
        waited: started.elapsed(),
        last_status: last.as_str().to_string(),
    })
}
