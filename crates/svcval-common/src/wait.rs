//! Bounded waits for cluster attributes
//!
//! Pods, endpoints, cluster IPs, node ports and load balancer addresses are
//! all assigned asynchronously by the cluster. Every wait in svcval goes
//! through [`wait_for_attribute`], an explicit state machine:
//!
//! ```text
//! Pending --check ready--> Ready
//!    |  \--check failed--> Failed
//!    |--pending past stall threshold--> Stalled
//!    \--elapsed past timeout--> Failed
//! ```
//!
//! A stalled resource is reported to the caller instead of failing outright:
//! pods that stay `Pending` (e.g. no schedulable node because of taints) are
//! dropped from the topology rather than failing the whole run.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, trace};

use crate::Error;

/// Default interval between readiness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default upper bound for a single readiness wait
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Pending observations tolerated before a pod is considered stalled
pub const DEFAULT_STALL_THRESHOLD: u32 = 30;

/// State of a bounded wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitState {
    /// Attribute not assigned yet, keep polling
    Pending,
    /// Attribute assigned
    Ready,
    /// Still pending after the stall threshold
    Stalled,
    /// Terminal failure or timeout
    Failed,
}

/// What a single readiness check observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation<T> {
    /// The attribute is assigned
    Ready(T),
    /// Not assigned yet
    Pending,
    /// The resource reached a state it can never recover from
    Failed(String),
}

/// Terminal, non-error result of a bounded wait
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The attribute was assigned
    Ready(T),
    /// The resource stayed pending past the stall threshold
    Stalled {
        /// Number of pending observations when the wait gave up
        attempts: u32,
    },
}

impl<T> WaitOutcome<T> {
    /// State this outcome corresponds to
    pub fn state(&self) -> WaitState {
        match self {
            WaitOutcome::Ready(_) => WaitState::Ready,
            WaitOutcome::Stalled { .. } => WaitState::Stalled,
        }
    }

    /// The assigned value, if ready
    pub fn ready(self) -> Option<T> {
        match self {
            WaitOutcome::Ready(v) => Some(v),
            WaitOutcome::Stalled { .. } => None,
        }
    }
}

/// Bounds for a readiness wait
#[derive(Clone, Debug)]
pub struct WaitConfig {
    /// Time between checks
    pub poll_interval: Duration,
    /// Upper bound for the whole wait
    pub timeout: Duration,
    /// Pending observations tolerated before reporting `Stalled`
    /// (`None` = only the timeout applies)
    pub stall_threshold: Option<u32>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
            stall_threshold: None,
        }
    }
}

impl WaitConfig {
    /// Config that reports `Stalled` after `threshold` pending observations
    pub fn with_stall_threshold(threshold: u32) -> Self {
        Self {
            stall_threshold: Some(threshold),
            ..Default::default()
        }
    }

    /// Override the overall timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Wait until `check` observes the attribute as ready.
///
/// Check errors are treated as transient (the API server may be briefly
/// unavailable) and keep the wait in `Pending` without counting toward the
/// stall threshold. `Observation::Failed` and the timeout are terminal and
/// returned as [`Error::Readiness`].
///
/// # Arguments
/// * `resource` - Resource being waited on, used in logs and errors
/// * `attribute` - Attribute being waited for (e.g., "clusterIP")
/// * `config` - Poll interval, timeout and stall threshold
/// * `check` - Async readiness check
pub async fn wait_for_attribute<F, Fut, T>(
    resource: &str,
    attribute: &str,
    config: &WaitConfig,
    mut check: F,
) -> Result<WaitOutcome<T>, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Observation<T>, Error>>,
{
    let start = tokio::time::Instant::now();
    let mut pending_attempts = 0u32;
    let mut state = WaitState::Pending;

    while state == WaitState::Pending {
        match check().await {
            Ok(Observation::Ready(value)) => {
                debug!(resource, attribute, elapsed = ?start.elapsed(), "Attribute ready");
                return Ok(WaitOutcome::Ready(value));
            }
            Ok(Observation::Pending) => {
                pending_attempts += 1;
                trace!(resource, attribute, pending_attempts, "Attribute pending");
                if let Some(threshold) = config.stall_threshold {
                    if pending_attempts > threshold {
                        state = WaitState::Stalled;
                        continue;
                    }
                }
            }
            Ok(Observation::Failed(message)) => {
                return Err(Error::readiness(resource, attribute, message));
            }
            Err(e) => {
                trace!(resource, attribute, error = %e, "Readiness check failed (retrying)");
            }
        }

        if start.elapsed() >= config.timeout {
            state = WaitState::Failed;
            continue;
        }
        tokio::time::sleep(config.poll_interval).await;
    }

    match state {
        WaitState::Stalled => {
            debug!(resource, attribute, pending_attempts, "Resource stalled in pending");
            Ok(WaitOutcome::Stalled {
                attempts: pending_attempts,
            })
        }
        _ => Err(Error::readiness(
            resource,
            attribute,
            format!("not assigned within {:?}", config.timeout),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> WaitConfig {
        WaitConfig::default()
            .poll_interval(Duration::from_millis(10))
            .timeout(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_a_few_pending_checks() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let outcome = wait_for_attribute("service/ns/a", "clusterIP", &fast(), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Ok(Observation::Pending)
                } else {
                    Ok(Observation::Ready("10.96.0.12".to_string()))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.state(), WaitState::Ready);
        assert_eq!(outcome.ready().as_deref(), Some("10.96.0.12"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_once_threshold_is_exceeded() {
        let config = WaitConfig::with_stall_threshold(2).poll_interval(Duration::from_millis(10));
        let outcome: WaitOutcome<()> =
            wait_for_attribute("pod/ns/pod-9", "phase", &config, || async {
                Ok(Observation::Pending)
            })
            .await
            .unwrap();

        assert_eq!(outcome, WaitOutcome::Stalled { attempts: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_is_a_readiness_error() {
        let result: Result<WaitOutcome<()>, _> =
            wait_for_attribute("pod/ns/pod-1", "phase", &fast(), || async {
                Ok(Observation::Failed("pod ran to completion".to_string()))
            })
            .await;

        match result {
            Err(Error::Readiness { attribute, message, .. }) => {
                assert_eq!(attribute, "phase");
                assert!(message.contains("completion"));
            }
            other => panic!("expected readiness error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_stall_threshold() {
        let result: Result<WaitOutcome<()>, _> =
            wait_for_attribute("service/ns/lb", "externalIP", &fast(), || async {
                Ok(Observation::Pending)
            })
            .await;

        assert!(matches!(result, Err(Error::Readiness { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_do_not_count_toward_stall() {
        let config = WaitConfig::with_stall_threshold(1)
            .poll_interval(Duration::from_millis(10))
            .timeout(Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let outcome = wait_for_attribute("pod/ns/pod-2", "phase", &config, || {
            let c = c.clone();
            async move {
                match c.fetch_add(1, Ordering::SeqCst) {
                    0..=4 => Err(Error::internal("apiserver unavailable")),
                    _ => Ok(Observation::Ready(())),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.state(), WaitState::Ready);
    }
}
