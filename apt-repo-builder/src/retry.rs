// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Retrying remote operations. */

use {
    crate::error::RemoteError,
    log::warn,
    std::{future::Future, time::Duration},
    tokio_retry::{
        strategy::{jitter, ExponentialBackoff},
        RetryIf,
    },
    tokio_util::sync::CancellationToken,
};

/// Exponential backoff with jitter for transient remote failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub max_retries: usize,
    /// Delay before the first retry. Doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without waiting.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delays between attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // The strategy yields 2^n; scaling by half the base gives base * 2^(n-1).
        let factor = (self.base_delay.as_millis() as u64) / 2;

        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }

    /// Run `action`, retrying transient failures.
    ///
    /// Retries stop once `cancel` is triggered.
    pub async fn run<T, A, F>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        action: A,
    ) -> Result<T, RemoteError>
    where
        A: FnMut() -> F,
        F: Future<Output = Result<T, RemoteError>>,
    {
        RetryIf::spawn(self.delays(), action, |e: &RemoteError| {
            if e.is_transient() && !cancel.is_cancelled() {
                warn!("{} failed, retrying: {}", what, e);
                true
            } else {
                false
            }
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::error::RemoteErrorKind,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn delays_grow_and_are_capped() {
        let policy = RetryPolicy::default();
        let delays = policy.delays().collect::<Vec<_>>();

        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let cancel = CancellationToken::new();

        let result = RetryPolicy::immediate(3)
            .run("test", &cancel, || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::network("reset"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let cancel = CancellationToken::new();

        let result: Result<(), _> = RetryPolicy::immediate(3)
            .run("test", &cancel, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::new(RemoteErrorKind::Unauthorized, "no"))
            })
            .await;

        assert_eq!(result.unwrap_err().kind, RemoteErrorKind::Unauthorized);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_exhausted() {
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let cancel = CancellationToken::new();

        let result: Result<(), _> = RetryPolicy::immediate(2)
            .run("test", &cancel, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::network("down"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
