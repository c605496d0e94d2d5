//! Rate limit policies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::descriptor::{self, KeyDerivation, LimitKey, RequestContext};
use crate::config::{PolicySettings, MAX_DURATION_SECS};
use crate::error::{Result, TurnstileError};

/// Emitted once when an identity first goes over its limit in a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitEvent {
    /// Policy name
    pub policy: String,
    /// Counter key that went over
    pub key: String,
    /// Count observed by the exceeding request
    pub count: u64,
    /// Configured limit
    pub limit: u64,
    /// When the identity may send requests again
    pub blocked_until: DateTime<Utc>,
}

/// Callback invoked when a limit is reached, for audit and alerting.
pub type LimitHook = Arc<dyn Fn(&LimitEvent) + Send + Sync>;

/// Immutable rate limit policy.
///
/// Built once at startup through [`PolicyConfig::builder`]; only the counters
/// it governs change at runtime.
#[derive(Clone)]
pub struct PolicyConfig {
    name: Arc<str>,
    key_prefix: String,
    max_requests: u64,
    window: Duration,
    block: Duration,
    skip_successful: bool,
    skip_failed: bool,
    key_derivation: KeyDerivation,
    on_limit_reached: Option<LimitHook>,
}

impl fmt::Debug for PolicyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyConfig")
            .field("name", &self.name)
            .field("key_prefix", &self.key_prefix)
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("block", &self.block)
            .field("skip_successful", &self.skip_successful)
            .field("skip_failed", &self.skip_failed)
            .finish_non_exhaustive()
    }
}

impl PolicyConfig {
    /// Start building a policy named `name`.
    pub fn builder(name: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder::new(name)
    }

    /// Policy name, used in logs and hooks.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    /// Prefix for every counter key of this policy.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Requests allowed per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Lockout applied after the limit is exceeded.
    pub fn block(&self) -> Duration {
        self.block
    }

    /// Whether successful requests are given back.
    pub fn skip_successful(&self) -> bool {
        self.skip_successful
    }

    /// Whether failed requests are given back.
    pub fn skip_failed(&self) -> bool {
        self.skip_failed
    }

    /// Whether callers must report request outcomes.
    pub fn counts_conditionally(&self) -> bool {
        self.skip_successful || self.skip_failed
    }

    /// Whether a response with `status` should not count.
    ///
    /// Statuses below 400 are successes.
    pub fn skips_status(&self, status: u16) -> bool {
        if status < 400 {
            self.skip_successful
        } else {
            self.skip_failed
        }
    }

    /// Derive the counter key for a request.
    pub fn key_for(&self, ctx: &RequestContext) -> LimitKey {
        let identity = (self.key_derivation)(ctx);
        LimitKey::new(&self.key_prefix, identity.as_deref())
    }

    /// Counter key for an already derived identity.
    pub fn key_for_identity(&self, identity: &str) -> LimitKey {
        LimitKey::new(&self.key_prefix, Some(identity))
    }

    pub(crate) fn notify_limit_reached(&self, event: &LimitEvent) {
        if let Some(hook) = &self.on_limit_reached {
            hook(event);
        }
    }
}

/// Builder for [`PolicyConfig`].
pub struct PolicyBuilder {
    name: String,
    key_prefix: Option<String>,
    max_requests: u64,
    window: Duration,
    block: Duration,
    skip_successful: bool,
    skip_failed: bool,
    key_derivation: KeyDerivation,
    on_limit_reached: Option<LimitHook>,
}

impl PolicyBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_prefix: None,
            max_requests: 100,
            window: Duration::from_secs(60),
            block: Duration::ZERO,
            skip_successful: false,
            skip_failed: false,
            key_derivation: descriptor::by_ip(),
            on_limit_reached: None,
        }
    }

    /// Counter key prefix (defaults to `rl:<name>`).
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Requests allowed per window.
    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Window length.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Lockout after exceeding the limit; may outlast the window.
    pub fn block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Give back requests that complete with a status below 400.
    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful = skip;
        self
    }

    /// Give back requests that complete with a status of 400 or above.
    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed = skip;
        self
    }

    /// How requests map to identities.
    pub fn key_derivation(mut self, derivation: KeyDerivation) -> Self {
        self.key_derivation = derivation;
        self
    }

    /// Hook run when an identity first exceeds the limit.
    pub fn on_limit_reached<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LimitEvent) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(hook));
        self
    }

    /// Install an already shared hook.
    pub fn hook(mut self, hook: LimitHook) -> Self {
        self.on_limit_reached = Some(hook);
        self
    }

    /// Apply points/duration/block/skip settings from configuration.
    pub fn settings(self, settings: &PolicySettings) -> Self {
        self.max_requests(settings.points)
            .window(Duration::from_secs(settings.duration))
            .block(Duration::from_secs(settings.block_duration))
            .skip_successful(settings.skip_successful)
            .skip_failed(settings.skip_failed)
    }

    /// Validate and freeze the policy.
    pub fn build(self) -> Result<PolicyConfig> {
        if self.name.trim().is_empty() {
            return Err(TurnstileError::Config("policy name must not be empty".to_string()));
        }
        if self.max_requests == 0 {
            return Err(TurnstileError::Config(format!(
                "policy '{}': max_requests must be greater than zero",
                self.name
            )));
        }
        if self.window.as_millis() == 0 {
            return Err(TurnstileError::Config(format!(
                "policy '{}': window must be at least one millisecond",
                self.name
            )));
        }
        let longest = Duration::from_secs(MAX_DURATION_SECS);
        if self.window > longest || self.block > longest {
            return Err(TurnstileError::Config(format!(
                "policy '{}': window and block must not exceed {} seconds",
                self.name, MAX_DURATION_SECS
            )));
        }
        if self.skip_successful && self.skip_failed {
            return Err(TurnstileError::Config(format!(
                "policy '{}': skipping both successful and failed requests disables the limit",
                self.name
            )));
        }

        let key_prefix = self
            .key_prefix
            .unwrap_or_else(|| format!("rl:{}", self.name));

        Ok(PolicyConfig {
            name: Arc::from(self.name.as_str()),
            key_prefix,
            max_requests: self.max_requests,
            window: self.window,
            block: self.block,
            skip_successful: self.skip_successful,
            skip_failed: self.skip_failed,
            key_derivation: self.key_derivation,
            on_limit_reached: self.on_limit_reached,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_builder_defaults() {
        let policy = PolicyConfig::builder("per_ip").build().unwrap();
        assert_eq!(policy.name(), "per_ip");
        assert_eq!(policy.key_prefix(), "rl:per_ip");
        assert_eq!(policy.max_requests(), 100);
        assert_eq!(policy.block(), Duration::ZERO);
        assert!(!policy.counts_conditionally());
    }

    #[test]
    fn test_builder_from_settings() {
        let settings = PolicySettings::new(5, 60).with_block(300);
        let policy = PolicyConfig::builder("strict").settings(&settings).build().unwrap();

        assert_eq!(policy.max_requests(), 5);
        assert_eq!(policy.window(), Duration::from_secs(60));
        assert_eq!(policy.block(), Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_policies_rejected() {
        assert!(PolicyConfig::builder("").build().is_err());
        assert!(PolicyConfig::builder("p").max_requests(0).build().is_err());
        assert!(PolicyConfig::builder("p").window(Duration::ZERO).build().is_err());
        assert!(PolicyConfig::builder("p").window(Duration::MAX).build().is_err());
        assert!(PolicyConfig::builder("p")
            .block(Duration::from_secs(10_000_000_000_000))
            .build()
            .is_err());
        assert!(PolicyConfig::builder("p")
            .skip_successful(true)
            .skip_failed(true)
            .build()
            .is_err());
    }

    #[test]
    fn test_skips_status() {
        let auth = PolicyConfig::builder("auth").skip_successful(true).build().unwrap();
        assert!(auth.skips_status(200));
        assert!(auth.skips_status(302));
        assert!(!auth.skips_status(401));

        let lenient = PolicyConfig::builder("lenient").skip_failed(true).build().unwrap();
        assert!(!lenient.skips_status(204));
        assert!(lenient.skips_status(500));
    }

    #[test]
    fn test_key_for_uses_derivation() {
        let policy = PolicyConfig::builder("per_user")
            .key_derivation(descriptor::by_user())
            .build()
            .unwrap();

        let ctx = RequestContext::default().with_user("7");
        assert_eq!(policy.key_for(&ctx).to_string_key(), "rl:per_user:user:7");
        assert_eq!(policy.key_for(&RequestContext::default()).to_string_key(), "rl:per_user:*");
    }

    #[test]
    fn test_hook_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let policy = PolicyConfig::builder("p")
            .on_limit_reached(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        policy.notify_limit_reached(&LimitEvent {
            policy: "p".into(),
            key: "rl:p:*".into(),
            count: 101,
            limit: 100,
            blocked_until: Utc::now(),
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
