//! Error accounting and retry with exponential backoff.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorContext, ErrorKind, RouterError, Severity};
use crate::metrics::MetricsSink;

/// Backoff and budget for [`ErrorHandler::execute_with_retry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub retryable_kinds: HashSet<ErrorKind>,
    /// Wall-clock budget across all attempts and backoff sleeps.
    #[serde(with = "opt_millis")]
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            retryable_kinds: [ErrorKind::Network, ErrorKind::Timeout, ErrorKind::Connection]
                .into_iter()
                .collect(),
            deadline: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `min(base_delay * multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_secs_f64() * 1000.0 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64() * 1000.0;

        if !millis.is_finite() || millis >= cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(millis.max(0.0) / 1000.0)
        }
    }

    /// An error is retried only when its kind is listed and its origin did
    /// not mark it permanent.
    pub fn should_retry(&self, error: &RouterError) -> bool {
        error.retryable && self.retryable_kinds.contains(&error.kind)
    }

    fn remaining(&self, started: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_sub(started.elapsed()))
    }
}

/// Occurrences of one error kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindStats {
    pub count: u64,
    pub last_seen: SystemTime,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    pub total: u64,
    pub by_kind: HashMap<ErrorKind, KindStats>,
}

pub type CriticalHook = Arc<dyn Fn(&RouterError) + Send + Sync>;

/// Central sink for failures: counts them per kind, logs them at a level
/// derived from severity, and drives retries.
pub struct ErrorHandler {
    by_kind: DashMap<ErrorKind, KindStats>,
    total: AtomicU64,
    critical_hook: Option<CriticalHook>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self {
            by_kind: DashMap::new(),
            total: AtomicU64::new(0),
            critical_hook: None,
            metrics: None,
        }
    }

    /// Invoked for every `Critical` error. The hook only observes; the
    /// process is never terminated on its behalf.
    pub fn with_critical_hook(mut self, hook: CriticalHook) -> Self {
        self.critical_hook = Some(hook);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Record, log and return a failure in its typed form.
    pub fn handle_error(&self, error: impl Into<RouterError>, context: &ErrorContext) -> RouterError {
        let error = error.into().with_context(context);
        let now = SystemTime::now();

        self.total.fetch_add(1, Ordering::Relaxed);
        self.by_kind
            .entry(error.kind)
            .and_modify(|stats| {
                stats.count += 1;
                stats.last_seen = now;
            })
            .or_insert(KindStats {
                count: 1,
                last_seen: now,
            });

        if let Some(metrics) = &self.metrics {
            metrics.increment_counter("relay_errors_total", &[("kind", error.kind.as_str())], 1);
        }

        let session_id = error.context.session_id.as_deref().unwrap_or("-");
        let component = error.context.component.as_deref().unwrap_or("-");
        let operation = error.context.operation.as_deref().unwrap_or("-");
        match error.severity {
            Severity::Critical | Severity::High => error!(
                kind = %error.kind,
                severity = ?error.severity,
                session_id,
                component,
                operation,
                retryable = error.retryable,
                "{}",
                error.message
            ),
            Severity::Medium => warn!(
                kind = %error.kind,
                session_id,
                component,
                operation,
                retryable = error.retryable,
                "{}",
                error.message
            ),
            Severity::Low => info!(
                kind = %error.kind,
                session_id,
                component,
                operation,
                "{}",
                error.message
            ),
        }

        if error.severity == Severity::Critical {
            match &self.critical_hook {
                Some(hook) => hook(&error),
                None => error!(kind = %error.kind, "🚨 Critical error reported: {}", error.message),
            }
        }

        error
    }

    /// Run `operation`, retrying transient failures with exponential backoff.
    ///
    /// Non-retryable failures and the failure that exhausts the budget are
    /// passed through [`handle_error`](Self::handle_error) and returned. The
    /// policy deadline bounds every attempt and no backoff sleep may cross it.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        mut operation: F,
        context: &ErrorContext,
        policy: &RetryPolicy,
    ) -> Result<T, RouterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RouterError>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let outcome = match policy.remaining(started) {
                Some(remaining) => match tokio::time::timeout(remaining, operation()).await {
                    Ok(result) => result.map_err(Into::into),
                    Err(elapsed) => Err(RouterError::timeout(format!(
                        "retry deadline of {}ms exceeded",
                        policy.deadline.unwrap_or_default().as_millis()
                    ))
                    .with_retryable(false)
                    .with_cause(elapsed)),
                },
                None => operation().await.map_err(Into::into),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !policy.should_retry(&err) || attempt >= policy.max_retries {
                return Err(self.handle_error(err, context));
            }

            let delay = policy.delay_for_attempt(attempt);
            if let Some(deadline) = policy.deadline {
                if started.elapsed() + delay >= deadline {
                    warn!(
                        attempts = attempt + 1,
                        "Retry budget would cross the {}ms deadline, giving up",
                        deadline.as_millis()
                    );
                    return Err(self.handle_error(err, context));
                }
            }

            warn!(
                kind = %err.kind,
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient failure: {}",
                err.message
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub fn get_stats(&self) -> ErrorStats {
        ErrorStats {
            total: self.total.load(Ordering::Relaxed),
            by_kind: self
                .by_kind
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
        }
    }

    pub fn reset_stats(&self) {
        self.by_kind.clear();
        self.total.store(0, Ordering::Relaxed);
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn quick_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_runs_once() {
        let handler = ErrorHandler::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), RouterError> = handler
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(RouterError::validation("bad input")) }
                },
                &ErrorContext::new(),
                &quick_policy(3),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind, ErrorKind::Validation);
        assert_eq!(handler.get_stats().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_exhausts_budget_and_returns_last_error() {
        let handler = ErrorHandler::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), RouterError> = handler
            .execute_with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err::<(), _>(RouterError::network(format!("attempt {n}"))) }
                },
                &ErrorContext::new().component("test"),
                &quick_policy(2),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert_eq!(err.message, "attempt 3");
        assert_eq!(err.context.component.as_deref(), Some("test"));

        let stats = handler.get_stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_kind[&ErrorKind::Network].count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let handler = ErrorHandler::new();
        let calls = AtomicU32::new(0);

        let value = handler
            .execute_with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(RouterError::timeout("slow"))
                        } else {
                            Ok(42)
                        }
                    }
                },
                &ErrorContext::new(),
                &quick_policy(3),
            )
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.get_stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries_early() {
        let handler = ErrorHandler::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(1000),
            deadline: Some(Duration::from_millis(2500)),
            ..RetryPolicy::default()
        };

        let result: Result<(), RouterError> = handler
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(RouterError::connection("refused")) }
                },
                &ErrorContext::new(),
                &policy,
            )
            .await;

        // t=0 fails, sleep 1s, t=1s fails, next sleep of 2s would cross 2.5s
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.unwrap_err().kind, ErrorKind::Connection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_a_hanging_attempt() {
        let handler = ErrorHandler::new();
        let policy = RetryPolicy {
            deadline: Some(Duration::from_millis(500)),
            ..RetryPolicy::default()
        };

        let result: Result<(), RouterError> = handler
            .execute_with_retry(
                || async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<(), RouterError>(())
                },
                &ErrorContext::new(),
                &policy,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_origin_can_mark_transient_kind_permanent() {
        let handler = ErrorHandler::new();
        let calls = AtomicU32::new(0);

        let _ = handler
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(RouterError::connection("peer closed").with_retryable(false))
                    }
                },
                &ErrorContext::new(),
                &quick_policy(3),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_critical_hook_and_reset() {
        let seen = Arc::new(AtomicU32::new(0));
        let hook_seen = seen.clone();
        let handler = ErrorHandler::new().with_critical_hook(Arc::new(move |_err| {
            hook_seen.fetch_add(1, Ordering::SeqCst);
        }));

        handler.handle_error(
            RouterError::resource("fd exhaustion").with_severity(Severity::Critical),
            &ErrorContext::new(),
        );
        handler.handle_error(RouterError::validation("bad"), &ErrorContext::new());

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(handler.get_stats().total, 2);

        handler.reset_stats();
        let stats = handler.get_stats();
        assert_eq!(stats.total, 0);
        assert!(stats.by_kind.is_empty());
    }

    #[test]
    fn test_policy_deserializes_millis() {
        let policy: RetryPolicy = serde_json::from_value(serde_json::json!({
            "max_retries": 5,
            "base_delay": 250,
            "deadline": null,
            "retryable_kinds": ["Timeout"]
        }))
        .unwrap();

        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
        assert_eq!(policy.deadline, None);
        assert!(policy.retryable_kinds.contains(&ErrorKind::Timeout));
        assert!(!policy.retryable_kinds.contains(&ErrorKind::Network));
    }
}
