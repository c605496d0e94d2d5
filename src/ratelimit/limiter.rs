//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::counter::{CounterStore, RateWindow};
use super::descriptor::{LimitKey, RequestContext};
use super::policy::{LimitEvent, PolicyConfig};
use super::response::{RateLimitHeaders, RateLimitRejection};
use crate::clock::{add_duration, millis_until, Clock, SystemClock};
use crate::error::{within, Result, TurnstileError};

/// Default upper bound for one counter store call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// Limit metadata shared by both decision outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Policy that made the decision
    pub policy: Arc<str>,
    /// Configured limit
    pub limit: u64,
    /// Window length
    pub window: Duration,
    /// When the window (or lockout) ends
    pub reset_at: DateTime<Utc>,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request.
    Allow {
        info: RateLimitInfo,
        remaining: u64,
        /// The window this request was counted in; `None` when the limiter
        /// failed open and nothing was counted.
        ticket: Option<RateWindow>,
    },
    /// Short-circuit with a 429.
    Deny {
        info: RateLimitInfo,
        retry_after_secs: u64,
        /// This request is the one that crossed the limit
        exceeded_now: bool,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// Limit metadata.
    pub fn info(&self) -> &RateLimitInfo {
        match self {
            Decision::Allow { info, .. } | Decision::Deny { info, .. } => info,
        }
    }

    /// Requests left in the window.
    pub fn remaining(&self) -> u64 {
        match self {
            Decision::Allow { remaining, .. } => *remaining,
            Decision::Deny { .. } => 0,
        }
    }

    /// Seconds to wait, for denied requests.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Decision::Allow { .. } => None,
            Decision::Deny {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
        }
    }

    /// Response headers for this decision.
    pub fn headers(&self) -> RateLimitHeaders {
        let info = self.info();
        RateLimitHeaders {
            limit: info.limit,
            remaining: self.remaining(),
            reset_at: info.reset_at,
            retry_after: self.retry_after(),
        }
    }

    /// Rejection details, for denied requests.
    pub fn rejection(&self) -> Option<RateLimitRejection> {
        let retry_after = self.retry_after()?;
        let info = self.info();
        Some(RateLimitRejection {
            retry_after,
            limit: info.limit,
            window_ms: info.window.as_millis() as u64,
            remaining: 0,
        })
    }

    /// Turn a denial into [`TurnstileError::LimitExceeded`].
    pub fn into_result(self) -> Result<Decision> {
        match self.rejection() {
            Some(rejection) => Err(TurnstileError::LimitExceeded(rejection)),
            None => Ok(self),
        }
    }
}

/// Where an identity stands in its window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    /// No live window
    Fresh,
    /// Counting requests below the limit
    Counting { count: u64, reset_at: DateTime<Utc> },
    /// Over the limit until `reset_at`
    Blocked { count: u64, reset_at: DateTime<Utc> },
}

/// Fixed-window rate limiter enforcing one policy over a counter store.
///
/// Cheap to clone; clones share the policy and the store.
#[derive(Clone)]
pub struct RateLimiter {
    policy: Arc<PolicyConfig>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("store", &self.store)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter for `policy` over `store`.
    pub fn new(policy: PolicyConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            policy: Arc::new(policy),
            store,
            clock: Arc::new(SystemClock::new()),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Use `clock` for retry-after arithmetic.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound every store call by `timeout`.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// The enforced policy.
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Count a request and decide whether it may proceed.
    ///
    /// Never fails: a store fault is logged and the request is allowed.
    pub async fn check(&self, ctx: &RequestContext) -> Decision {
        let key = self.policy.key_for(ctx);
        self.check_key(&key).await
    }

    /// Like [`RateLimiter::check`] for an already derived identity.
    pub async fn check_identity(&self, identity: &str) -> Decision {
        let key = self.policy.key_for_identity(identity);
        self.check_key(&key).await
    }

    async fn check_key(&self, key: &LimitKey) -> Decision {
        let store_key = key.to_string_key();
        let policy = &self.policy;

        trace!(policy = %policy.name(), key = %store_key, "Checking rate limit");

        let window = match within(
            self.operation_timeout,
            self.store.increment(&store_key, policy.window()),
        )
        .await
        {
            Ok(window) => window,
            Err(e) => {
                warn!(
                    policy = %policy.name(),
                    key = %store_key,
                    error = %e,
                    "Counter store unavailable, failing open"
                );
                return self.fail_open();
            }
        };

        let limit = policy.max_requests();
        let now = self.clock.now();

        if window.count <= limit {
            return Decision::Allow {
                info: self.info(window.reset_at),
                remaining: limit - window.count,
                ticket: Some(window),
            };
        }

        let exceeded_now = window.count == limit + 1;
        let mut reset_at = window.reset_at;

        if exceeded_now {
            if !policy.block().is_zero() {
                reset_at = add_duration(now, policy.block());
            }

            warn!(
                policy = %policy.name(),
                key = %store_key,
                count = window.count,
                limit = limit,
                blocked_until = %reset_at,
                "Rate limit exceeded"
            );
            policy.notify_limit_reached(&LimitEvent {
                policy: policy.name().to_string(),
                key: store_key.clone(),
                count: window.count,
                limit,
                blocked_until: reset_at,
            });

            if !policy.block().is_zero() {
                if let Err(e) = within(
                    self.operation_timeout,
                    self.store.block(&store_key, policy.block()),
                )
                .await
                {
                    warn!(
                        policy = %policy.name(),
                        key = %store_key,
                        error = %e,
                        "Failed to apply lockout, falling back to window reset"
                    );
                    reset_at = window.reset_at;
                }
            }
        } else {
            debug!(
                policy = %policy.name(),
                key = %store_key,
                count = window.count,
                "Request denied while over limit"
            );
        }

        Decision::Deny {
            info: self.info(reset_at),
            retry_after_secs: retry_after_secs(now, reset_at),
            exceeded_now,
        }
    }

    fn info(&self, reset_at: DateTime<Utc>) -> RateLimitInfo {
        RateLimitInfo {
            policy: self.policy.shared_name(),
            limit: self.policy.max_requests(),
            window: self.policy.window(),
            reset_at,
        }
    }

    fn fail_open(&self) -> Decision {
        let reset_at = add_duration(self.clock.now(), self.policy.window());
        Decision::Allow {
            info: self.info(reset_at),
            remaining: self.policy.max_requests(),
            ticket: None,
        }
    }

    /// Report the final status of a request checked by this limiter.
    ///
    /// When the policy skips this kind of outcome, the speculative increment
    /// is taken back from the window the decision was counted in. Reports for
    /// denied or failed-open decisions, for another policy, or for a window
    /// that has already rolled over are ignored. Returns whether a decrement
    /// happened.
    pub async fn report(&self, decision: &Decision, status: u16) -> bool {
        if !self.policy.counts_conditionally() || !self.policy.skips_status(status) {
            return false;
        }

        let Decision::Allow {
            info,
            ticket: Some(ticket),
            ..
        } = decision
        else {
            return false;
        };

        if info.policy.as_ref() != self.policy.name() {
            debug!(
                policy = %self.policy.name(),
                reported_policy = %info.policy,
                "Ignoring report for a decision of another policy"
            );
            return false;
        }

        if ticket.is_expired(self.clock.now()) {
            debug!(
                policy = %self.policy.name(),
                key = %ticket.key,
                "Ignoring report for a window that already rolled over"
            );
            return false;
        }

        match within(self.operation_timeout, self.store.decrement(ticket)).await {
            Ok(applied) => {
                trace!(key = %ticket.key, status = status, applied = applied, "Outcome reported");
                applied
            }
            Err(e) => {
                warn!(
                    policy = %self.policy.name(),
                    key = %ticket.key,
                    error = %e,
                    "Failed to take back skipped request"
                );
                false
            }
        }
    }

    /// Read the live window for a request's identity without counting.
    pub async fn peek(&self, ctx: &RequestContext) -> Result<Option<RateWindow>> {
        let key = self.policy.key_for(ctx).to_string_key();
        within(self.operation_timeout, self.store.get(&key)).await
    }

    /// Where a request's identity stands.
    pub async fn state(&self, ctx: &RequestContext) -> Result<KeyState> {
        let state = match self.peek(ctx).await? {
            None => KeyState::Fresh,
            Some(window) if window.count > self.policy.max_requests() => KeyState::Blocked {
                count: window.count,
                reset_at: window.reset_at,
            },
            Some(window) => KeyState::Counting {
                count: window.count,
                reset_at: window.reset_at,
            },
        };
        Ok(state)
    }

    /// Clear the window (and any lockout) of a request's identity.
    pub async fn reset(&self, ctx: &RequestContext) -> Result<()> {
        let key = self.policy.key_for(ctx).to_string_key();
        debug!(policy = %self.policy.name(), key = %key, "Resetting rate limit window");
        within(self.operation_timeout, self.store.reset(&key)).await
    }
}

/// Whole seconds until `reset_at`, rounded up, never below one.
fn retry_after_secs(now: DateTime<Utc>, reset_at: DateTime<Utc>) -> u64 {
    millis_until(now, reset_at).div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::descriptor;
    use crate::ratelimit::memory::MemoryCounterStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(policy: PolicyConfig) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(MemoryCounterStore::with_clock(Arc::new(clock.clone())));
        let limiter = RateLimiter::new(policy, store).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    fn policy(points: u64, window_secs: u64) -> PolicyConfig {
        PolicyConfig::builder("test")
            .max_requests(points)
            .window(Duration::from_secs(window_secs))
            .build()
            .unwrap()
    }

    fn client() -> RequestContext {
        RequestContext::from_ip("10.0.0.1".parse().unwrap())
    }

    #[derive(Debug)]
    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<RateWindow> {
            Err(TurnstileError::StoreUnavailable("connection refused".into()))
        }
        async fn get(&self, _key: &str) -> Result<Option<RateWindow>> {
            Err(TurnstileError::StoreUnavailable("connection refused".into()))
        }
        async fn reset(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn block(&self, _key: &str, _duration: Duration) -> Result<()> {
            Ok(())
        }
        async fn decrement(&self, _window: &RateWindow) -> Result<bool> {
            Ok(false)
        }
    }

    #[derive(Debug)]
    struct SlowStore;

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn increment(&self, key: &str, window: Duration) -> Result<RateWindow> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(RateWindow::open(key, Utc::now(), window))
        }
        async fn get(&self, _key: &str) -> Result<Option<RateWindow>> {
            Ok(None)
        }
        async fn reset(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn block(&self, _key: &str, _duration: Duration) -> Result<()> {
            Ok(())
        }
        async fn decrement(&self, _window: &RateWindow) -> Result<bool> {
            Ok(false)
        }
    }

    /// Read-then-write counter with a suspension point in between, the way an
    /// unsynchronised store behaves under concurrent callers.
    #[derive(Debug, Default)]
    struct NaiveCounterStore {
        counts: parking_lot::Mutex<HashMap<String, u64>>,
    }

    #[async_trait]
    impl CounterStore for NaiveCounterStore {
        async fn increment(&self, key: &str, window: Duration) -> Result<RateWindow> {
            let seen = self.counts.lock().get(key).copied().unwrap_or(0);
            tokio::task::yield_now().await;
            self.counts.lock().insert(key.to_string(), seen + 1);

            let mut opened = RateWindow::open(key, Utc::now(), window);
            opened.count = seen + 1;
            Ok(opened)
        }
        async fn get(&self, _key: &str) -> Result<Option<RateWindow>> {
            Ok(None)
        }
        async fn reset(&self, key: &str) -> Result<()> {
            self.counts.lock().remove(key);
            Ok(())
        }
        async fn block(&self, _key: &str, _duration: Duration) -> Result<()> {
            Ok(())
        }
        async fn decrement(&self, _window: &RateWindow) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_then_denies() {
        let (limiter, _clock) = limiter(policy(3, 60));
        let ctx = client();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check(&ctx).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.remaining(), expected_remaining);
        }

        let decision = limiter.check(&ctx).await;
        assert!(!decision.is_allowed());
        assert_eq!(decision.retry_after(), Some(60));
    }

    #[tokio::test]
    async fn test_identities_are_counted_separately() {
        let (limiter, _clock) = limiter(policy(1, 60));

        assert!(limiter.check(&client()).await.is_allowed());
        assert!(!limiter.check(&client()).await.is_allowed());

        let other = RequestContext::from_ip("10.0.0.2".parse().unwrap());
        assert!(limiter.check(&other).await.is_allowed());
    }

    #[tokio::test]
    async fn test_fresh_window_after_reset_at() {
        let (limiter, clock) = limiter(policy(2, 60));
        let ctx = client();

        limiter.check(&ctx).await;
        limiter.check(&ctx).await;
        assert!(!limiter.check(&ctx).await.is_allowed());

        clock.advance(Duration::from_secs(60));

        let decision = limiter.check(&ctx).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 1);
        assert_eq!(limiter.peek(&ctx).await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_block_outlasts_window() {
        let policy = PolicyConfig::builder("strict")
            .max_requests(5)
            .window(Duration::from_secs(60))
            .block(Duration::from_secs(300))
            .build()
            .unwrap();
        let (limiter, clock) = limiter(policy);
        let ctx = client();

        for expected_remaining in (0..5).rev() {
            let decision = limiter.check(&ctx).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.remaining(), expected_remaining);
            clock.advance(Duration::from_secs(2));
        }

        let denied = limiter.check(&ctx).await;
        let retry_after = denied.retry_after().unwrap();
        assert!((290..=300).contains(&retry_after), "retry_after = {}", retry_after);
        assert!(matches!(denied, Decision::Deny { exceeded_now: true, .. }));

        // The first 60s window is long gone, the lockout is not
        clock.advance(Duration::from_secs(120));
        let still_denied = limiter.check(&ctx).await;
        assert!(matches!(still_denied, Decision::Deny { exceeded_now: false, .. }));
        assert_eq!(still_denied.retry_after(), Some(180));

        clock.advance(Duration::from_secs(180));
        let decision = limiter.check(&ctx).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 4);
    }

    #[tokio::test]
    async fn test_longest_block_does_not_overflow() {
        let longest = Duration::from_secs(crate::config::MAX_DURATION_SECS);
        let policy = PolicyConfig::builder("strict")
            .max_requests(1)
            .window(longest)
            .block(longest)
            .build()
            .unwrap();
        let (limiter, _clock) = limiter(policy);
        let ctx = client();

        assert!(limiter.check(&ctx).await.is_allowed());
        let denied = limiter.check(&ctx).await;
        assert!(matches!(denied, Decision::Deny { exceeded_now: true, .. }));
        assert_eq!(denied.retry_after(), Some(crate::config::MAX_DURATION_SECS));
    }

    #[tokio::test]
    async fn test_state_machine() {
        let policy = PolicyConfig::builder("strict")
            .max_requests(1)
            .window(Duration::from_secs(10))
            .block(Duration::from_secs(30))
            .build()
            .unwrap();
        let (limiter, clock) = limiter(policy);
        let ctx = client();

        assert_eq!(limiter.state(&ctx).await.unwrap(), KeyState::Fresh);

        limiter.check(&ctx).await;
        assert!(matches!(limiter.state(&ctx).await.unwrap(), KeyState::Counting { count: 1, .. }));

        limiter.check(&ctx).await;
        assert!(matches!(limiter.state(&ctx).await.unwrap(), KeyState::Blocked { count: 2, .. }));

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.state(&ctx).await.unwrap(), KeyState::Fresh);
    }

    #[tokio::test]
    async fn test_hook_fires_once_per_violation() {
        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        let policy = PolicyConfig::builder("hooked")
            .max_requests(1)
            .on_limit_reached(move |event| {
                assert_eq!(event.limit, 1);
                assert_eq!(event.count, 2);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();
        let (limiter, _clock) = limiter(policy);

        for _ in 0..5 {
            limiter.check(&client()).await;
        }
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_successful_requests() {
        let policy = PolicyConfig::builder("auth")
            .max_requests(3)
            .skip_successful(true)
            .build()
            .unwrap();
        let (limiter, _clock) = limiter(policy);
        let ctx = client();

        for _ in 0..10 {
            let decision = limiter.check(&ctx).await;
            assert!(decision.is_allowed());
            assert!(limiter.report(&decision, 200).await);
        }
        assert_eq!(limiter.peek(&ctx).await.unwrap().unwrap().count, 0);

        // Failures still count
        for _ in 0..3 {
            let decision = limiter.check(&ctx).await;
            assert!(!limiter.report(&decision, 401).await);
        }
        assert!(!limiter.check(&ctx).await.is_allowed());
    }

    #[tokio::test]
    async fn test_report_after_rollover_is_ignored() {
        let policy = PolicyConfig::builder("auth")
            .max_requests(3)
            .window(Duration::from_secs(60))
            .skip_successful(true)
            .build()
            .unwrap();
        let (limiter, clock) = limiter(policy);
        let ctx = client();

        let stale = limiter.check(&ctx).await;
        clock.advance(Duration::from_secs(61));
        limiter.check(&ctx).await;

        assert!(!limiter.report(&stale, 200).await);
        assert_eq!(limiter.peek(&ctx).await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_report_ignores_denied_and_unskipped() {
        let policy = PolicyConfig::builder("auth")
            .max_requests(1)
            .skip_failed(true)
            .build()
            .unwrap();
        let (limiter, _clock) = limiter(policy);
        let ctx = client();

        let allowed = limiter.check(&ctx).await;
        assert!(!limiter.report(&allowed, 200).await);

        let denied = limiter.check(&ctx).await;
        assert!(!limiter.report(&denied, 500).await);
        assert_eq!(limiter.peek(&ctx).await.unwrap().unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_unidentified_requests_share_wildcard_bucket() {
        let policy = PolicyConfig::builder("per_user")
            .max_requests(1)
            .key_derivation(descriptor::by_user())
            .build()
            .unwrap();
        let (limiter, _clock) = limiter(policy);

        assert!(limiter.check(&RequestContext::default()).await.is_allowed());
        assert!(!limiter.check(&RequestContext::default()).await.is_allowed());
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let limiter = RateLimiter::new(policy(1, 60), Arc::new(FailingStore));

        for _ in 0..5 {
            let decision = limiter.check(&client()).await;
            assert!(decision.is_allowed());
            assert!(matches!(decision, Decision::Allow { ticket: None, .. }));
        }
        assert!(limiter.peek(&client()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_open_when_store_is_slow() {
        let limiter = RateLimiter::new(policy(1, 60), Arc::new(SlowStore))
            .with_operation_timeout(Duration::from_millis(100));

        let decision = limiter.check(&client()).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 1);
    }

    #[tokio::test]
    async fn test_denied_decision_headers_and_error() {
        let (limiter, _clock) = limiter(policy(1, 60));
        let ctx = client();

        let allowed = limiter.check(&ctx).await;
        let pairs = allowed.headers().to_pairs();
        assert_eq!(pairs.len(), 3);
        tokio_test::assert_ok!(allowed.into_result());

        let denied = limiter.check(&ctx).await;
        let headers = denied.headers();
        assert_eq!(headers.remaining, 0);
        assert_eq!(headers.retry_after, Some(60));

        let err = tokio_test::assert_err!(denied.into_result());
        match err {
            TurnstileError::LimitExceeded(rejection) => {
                assert_eq!(rejection.limit, 1);
                assert_eq!(rejection.window_ms, 60_000);
                assert_eq!(rejection.retry_after, 60);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_simultaneous_requests_admit_exactly_limit() {
        const LIMIT: u64 = 50;
        let limiter = Arc::new(RateLimiter::new(
            policy(LIMIT, 60),
            Arc::new(MemoryCounterStore::new()),
        ));

        let handles: Vec<_> = (0..2 * LIMIT)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_identity("ip:10.0.0.1").await.is_allowed() })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, LIMIT);
    }

    #[tokio::test]
    async fn test_non_atomic_store_lets_requests_through() {
        const LIMIT: u64 = 5;
        let limiter = RateLimiter::new(policy(LIMIT, 60), Arc::new(NaiveCounterStore::default()));

        let checks = (0..2 * LIMIT).map(|_| limiter.check_identity("ip:10.0.0.1"));
        let decisions = futures::future::join_all(checks).await;
        let allowed = decisions.iter().filter(|d| d.is_allowed()).count() as u64;

        assert!(allowed > LIMIT, "lost updates should admit more than the limit, got {}", allowed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        assert_eq!(retry_after_secs(now, now + chrono::Duration::milliseconds(1001)), 2);
        assert_eq!(retry_after_secs(now, now), 1);
    }
}
