//! Backoff and retry helpers for operations against flaky collaborators,
//! primarily the key-value store behind the ring.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

use std::future::Future;
use std::time::Duration;

use observability_deps::tracing::warn;
use rand::prelude::*;

/// Exponential backoff with jitter.
///
/// Each call to [`Backoff::next`] returns a duration sampled uniformly from
/// `[init_backoff, current * base]`, capped at `max_backoff`, so concurrent
/// retriers against the same contended resource spread out instead of
/// thundering in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,

    /// Optional limit on the *cumulative* time slept across all rounds.
    /// Once exceeded, [`Backoff::next`] returns `None` and the retry loops
    /// surface the last error.
    pub deadline: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 3.0,
            deadline: None,
        }
    }
}

/// Error returned by the retry loops when the configured deadline was
/// exceeded.
#[derive(Debug, thiserror::Error)]
#[error("retry exceeded deadline ({deadline:?}): {source}")]
pub struct DeadlineExceeded<E> {
    /// The configured deadline.
    pub deadline: Duration,

    /// The error observed on the last attempt.
    #[source]
    pub source: E,
}

/// [`Backoff`] can be created from a [`BackoffConfig`].
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    total_slept: f64,
    deadline: Option<f64>,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .field("total_slept", &self.total_slept)
            .field("deadline", &self.deadline)
            .field("rng", &self.rng.as_ref().map(|_| "<rng>"))
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`, used for testing with
    /// a deterministic generator.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            total_slept: 0.0,
            deadline: config.deadline.map(|d| d.as_secs_f64()),
            rng,
        }
    }

    /// Returns the next backoff duration to wait for, or `None` if the
    /// cumulative deadline has been reached.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Duration> {
        if let Some(deadline) = self.deadline {
            if self.total_slept >= deadline {
                return None;
            }
        }

        let range = self.init_backoff..(self.next_backoff_secs * self.base);
        let rand_backoff = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        self.total_slept += next_backoff;
        self.next_backoff_secs = next_backoff;
        Some(Duration::from_secs_f64(next_backoff))
    }

    /// Perform an async operation that retries with this backoff until it
    /// succeeds or the deadline (if any) is exceeded.
    pub async fn retry_all_errors<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> Result<B, DeadlineExceeded<E>>
    where
        F: (FnMut() -> F1) + Send,
        F1: Future<Output = Result<B, E>> + Send,
        E: std::error::Error + Send,
    {
        loop {
            match do_stuff().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let backoff = match self.next() {
                        Some(backoff) => backoff,
                        None => {
                            return Err(DeadlineExceeded {
                                deadline: Duration::from_secs_f64(
                                    self.deadline.expect("deadline set if next() is exhausted"),
                                ),
                                source: e,
                            });
                        }
                    };
                    warn!(
                        error=%e,
                        task_name,
                        backoff_secs = backoff.as_secs_f64(),
                        "request encountered non-fatal error - backing off",
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_growth() {
        let init_backoff_secs = 1.0;
        let max_backoff_secs = 500.0;
        let base = 3.0;

        let config = BackoffConfig {
            init_backoff: Duration::from_secs_f64(init_backoff_secs),
            max_backoff: Duration::from_secs_f64(max_backoff_secs),
            base,
            deadline: None,
        };

        // A mock rng always returning zero picks the lower bound of the
        // sample range, i.e. the configured initial backoff.
        let rng = Box::new(StepRng::new(0, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for _ in 0..20 {
            assert_eq!(
                backoff.next().unwrap().as_secs_f64(),
                init_backoff_secs,
                "lower bound of the jitter range is the initial backoff"
            );
        }

        // A mock rng always returning the maximum picks the upper bound of
        // the range, growing by `base` each round until the cap.
        let rng = Box::new(StepRng::new(u64::MAX, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        let mut value = init_backoff_secs;
        for _ in 0..20 {
            value = (value * base).min(max_backoff_secs);
            let got = backoff.next().unwrap().as_secs_f64();
            assert!(
                (got - value).abs() < value * 1e-6,
                "expected ~{value}, got {got}"
            );
        }
    }

    #[test]
    fn test_deadline_exhaustion() {
        let config = BackoffConfig {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            base: 2.0,
            deadline: Some(Duration::from_secs(3)),
        };
        let mut backoff = Backoff::new(&config);

        // 1s rounds against a 3s deadline: a handful of rounds, then None.
        let mut rounds = 0;
        while backoff.next().is_some() {
            rounds += 1;
            assert!(rounds < 10, "deadline never reached");
        }
        assert!(rounds >= 3);
    }

    #[tokio::test]
    async fn test_retry_all_errors() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 1.1,
            deadline: None,
        };

        let attempts = AtomicUsize::new(0);
        let got = Backoff::new(&config)
            .retry_all_errors("test", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(got, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_deadline_surfaces_last_error() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            base: 1.0,
            deadline: Some(Duration::from_millis(2)),
        };

        let err = Backoff::new(&config)
            .retry_all_errors::<_, _, (), _>("test", || async {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "bananas"))
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("bananas"));
    }
}
