use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::{Error, Result};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// How often and for how long to poll a long-running remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

/// One observation of a remote task.
#[derive(Debug)]
pub enum Progress<T> {
    Done(T),
    Pending,
    Failed(String),
}

/// Call `check` until it reports `Done` or `Failed`, sleeping `interval`
/// between calls. Gives up with `ProvisioningTimeout` once `timeout` has
/// elapsed; `check` always runs at least once.
pub async fn wait_for<T, F, Fut>(policy: &PollPolicy, what: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T>>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;

    loop {
        match check().await? {
            Progress::Done(value) => return Ok(value),
            Progress::Failed(reason) => return Err(Error::ProvisioningFailed(reason)),
            Progress::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::ProvisioningTimeout {
                what: what.to_string(),
                waited_secs: (now - started).as_secs(),
            });
        }
        tracing::debug!(what, "still waiting");
        tokio::time::sleep(policy.interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(5), Duration::from_millis(40))
    }

    #[tokio::test]
    async fn test_returns_once_done() {
        let calls = AtomicU32::new(0);
        let value = wait_for(&quick(), "task", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(Progress::Pending)
            } else {
                Ok(Progress::Done(42))
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_carries_backend_text() {
        let err = wait_for::<(), _, _>(&quick(), "task", || async {
            Ok(Progress::Failed("datastore full".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ProvisioningFailed(ref m) if m == "datastore full"));
    }

    #[tokio::test]
    async fn test_deadline_yields_timeout() {
        let err = wait_for::<(), _, _>(&quick(), "clone web01", || async { Ok(Progress::Pending) })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ProvisioningTimeout { ref what, .. } if what == "clone web01"));
    }
}
