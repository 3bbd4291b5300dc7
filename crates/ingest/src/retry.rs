use std::future::Future;
use std::time::Duration;
use anyhow::Result;
use log::warn;
use tokio::time::sleep;

use crate::config::RetrySettings;

/// Bounded retry with a fixed backoff schedule, shared by every external call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    schedule: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        let mut schedule: Vec<Duration> = settings
            .backoff_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect();
        if schedule.is_empty() {
            schedule.push(Duration::from_secs(5));
        }
        Self {
            max_attempts: settings.max_attempts.max(1),
            schedule,
        }
    }

    /// Single attempt, no delays
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            schedule: vec![Duration::ZERO],
        }
    }

    /// Same attempt count, zero delays
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            schedule: vec![Duration::ZERO],
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn delay_before_retry(&self, retry: usize) -> Duration {
        // retry is 1-based; the last schedule entry repeats
        let idx = retry.saturating_sub(1).min(self.schedule.len() - 1);
        self.schedule[idx]
    }

    /// Run `operation` until it succeeds or the attempts are exhausted.
    /// The closure receives the zero-based attempt number.
    pub async fn run<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0usize;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err.context(format!("{} failed after {} attempt(s)", what, attempt)));
                    }
                    let delay = self.delay_before_retry(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {:#}; retrying in {:?}",
                        what, attempt, self.max_attempts, err, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_schedule_last_entry_repeats() {
        let policy = RetryPolicy::new(&RetrySettings {
            max_attempts: 5,
            backoff_secs: vec![1, 4],
        });
        assert_eq!(policy.delay_before_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before_retry(2), Duration::from_secs(4));
        assert_eq!(policy.delay_before_retry(7), Duration::from_secs(4));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::new(&RetrySettings {
            max_attempts: 0,
            backoff_secs: vec![],
        });
        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = RetryPolicy::immediate(3)
            .run("flaky call", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        anyhow::bail!("transient");
                    }
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let err = RetryPolicy::immediate(2)
            .run("broken call", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("permanent")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let msg = format!("{:#}", err);
        assert!(msg.contains("broken call failed after 2 attempt(s)"));
        assert!(msg.contains("permanent"));
    }
}
