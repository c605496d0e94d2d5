//! Named policy presets and plan-tiered limiting.
//!
//! Presets are plain [`PolicyBuilder`] values composed from configuration
//! settings and a key derivation; every one of them ends up in the same
//! generic [`RateLimiter`]. Callers can keep customising a preset (hooks,
//! derivation) before building it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::backend::Admission;
use super::counter::CounterStore;
use super::descriptor::{self, KeyDerivation, RequestContext};
use super::limiter::{Decision, RateLimiter};
use super::policy::{LimitHook, PolicyBuilder, PolicyConfig};
use crate::clock::Clock;
use crate::config::{PolicySettings, RateLimitingConfig};
use crate::error::{Result, TurnstileError};

fn preset(name: &str, settings: &PolicySettings, derivation: KeyDerivation) -> PolicyBuilder {
    PolicyConfig::builder(name)
        .settings(settings)
        .key_derivation(derivation)
}

/// One bucket for the whole service.
pub fn global(settings: &PolicySettings) -> PolicyBuilder {
    preset("global", settings, descriptor::global())
}

/// One bucket per client IP.
pub fn per_ip(settings: &PolicySettings) -> PolicyBuilder {
    preset("per_ip", settings, descriptor::by_ip())
}

/// One bucket per authenticated user; anonymous callers are keyed by IP.
pub fn per_user(settings: &PolicySettings) -> PolicyBuilder {
    preset("per_user", settings, descriptor::by_user())
}

/// One bucket per API key; callers without a key are keyed by IP.
pub fn per_api_key(settings: &PolicySettings) -> PolicyBuilder {
    preset("per_api_key", settings, descriptor::by_api_key())
}

/// Tight per-IP limit for expensive endpoints, usually with a lockout.
pub fn strict(settings: &PolicySettings) -> PolicyBuilder {
    preset("strict", settings, descriptor::by_ip())
}

/// Per-IP limit for authentication endpoints.
///
/// Successful attempts are given back unless the settings say otherwise, so
/// only failures count toward the lockout.
pub fn auth(settings: &PolicySettings) -> PolicyBuilder {
    let settings = if settings.skip_failed {
        settings.clone()
    } else {
        PolicySettings {
            skip_successful: true,
            ..settings.clone()
        }
    };
    preset("auth", &settings, descriptor::by_ip())
}

/// Policy for one plan tier.
pub fn tier(name: &str, settings: &PolicySettings) -> PolicyBuilder {
    PolicyConfig::builder(format!("tier_{}", name))
        .key_prefix(format!("rl:tier:{}", name))
        .settings(settings)
        .key_derivation(descriptor::by_user())
}

/// Classifies a request into a tier name.
pub type Classifier = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

/// Classify by the request's subscription plan.
pub fn by_plan() -> Classifier {
    Arc::new(|ctx: &RequestContext| ctx.plan.clone())
}

/// Limiter that picks a tier per request.
///
/// The classifier runs on every request; unknown or missing tiers use the
/// default tier.
#[derive(Clone)]
pub struct TieredLimiter {
    classify: Classifier,
    tiers: HashMap<String, RateLimiter>,
    default_tier: String,
}

impl std::fmt::Debug for TieredLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tiers: Vec<&String> = self.tiers.keys().collect();
        tiers.sort();
        f.debug_struct("TieredLimiter")
            .field("tiers", &tiers)
            .field("default_tier", &self.default_tier)
            .finish_non_exhaustive()
    }
}

impl TieredLimiter {
    /// Create a tiered limiter whose fallback is `default_tier`.
    pub fn new(classify: Classifier, default_tier: impl Into<String>, default_limiter: RateLimiter) -> Self {
        let default_tier = default_tier.into();
        let mut tiers = HashMap::new();
        tiers.insert(default_tier.clone(), default_limiter);
        Self {
            classify,
            tiers,
            default_tier,
        }
    }

    /// Add (or replace) a tier.
    pub fn with_tier(mut self, name: impl Into<String>, limiter: RateLimiter) -> Self {
        self.tiers.insert(name.into(), limiter);
        self
    }

    /// Build one limiter per configured tier over a shared store.
    pub fn from_settings(
        tiers: &BTreeMap<String, PolicySettings>,
        default_tier: &str,
        classify: Classifier,
        factory: &LimiterFactory,
    ) -> Result<Self> {
        let default_settings = tiers.get(default_tier).ok_or_else(|| {
            TurnstileError::Config(format!("default tier '{}' is not configured", default_tier))
        })?;

        let mut limiter = Self::new(
            classify,
            default_tier,
            factory.build(tier(default_tier, default_settings))?,
        );
        for (name, settings) in tiers {
            if name != default_tier {
                limiter = limiter.with_tier(name.clone(), factory.build(tier(name, settings))?);
            }
        }
        Ok(limiter)
    }

    /// Tier a request falls into.
    pub fn classify(&self, ctx: &RequestContext) -> &str {
        match (self.classify)(ctx) {
            Some(name) => match self.tiers.get_key_value(&name) {
                Some((known, _)) => known,
                None => {
                    debug!(tier = %name, "Unknown tier, using default");
                    &self.default_tier
                }
            },
            None => &self.default_tier,
        }
    }

    /// Limiter for a named tier.
    pub fn tier(&self, name: &str) -> Option<&RateLimiter> {
        self.tiers.get(name)
    }

    fn select(&self, ctx: &RequestContext) -> &RateLimiter {
        let name = self.classify(ctx);
        // The default tier is inserted at construction and never removed
        &self.tiers[name]
    }

    /// Count a request against its tier.
    pub async fn check(&self, ctx: &RequestContext) -> Decision {
        self.select(ctx).check(ctx).await
    }

    /// Report an outcome to the tier that made `decision`.
    pub async fn report(&self, decision: &Decision, status: u16) -> bool {
        let policy = decision.info().policy.as_ref();
        match self.tiers.values().find(|l| l.policy().name() == policy) {
            Some(limiter) => limiter.report(decision, status).await,
            None => false,
        }
    }
}

#[async_trait]
impl Admission for TieredLimiter {
    async fn check(&self, ctx: &RequestContext) -> Decision {
        TieredLimiter::check(self, ctx).await
    }

    async fn report(&self, decision: &Decision, status: u16) -> bool {
        TieredLimiter::report(self, decision, status).await
    }
}

/// Shared ingredients for building limiters: store, clock, timeout, hook.
#[derive(Clone)]
pub struct LimiterFactory {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
    hook: Option<LimitHook>,
}

impl LimiterFactory {
    /// Factory over a counter store.
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, operation_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            operation_timeout,
            hook: None,
        }
    }

    /// Install `hook` on every policy built from now on.
    pub fn with_hook(mut self, hook: LimitHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Freeze a policy and wrap it in a limiter.
    pub fn build(&self, builder: PolicyBuilder) -> Result<RateLimiter> {
        let builder = match &self.hook {
            Some(hook) => builder.hook(hook.clone()),
            None => builder,
        };
        Ok(RateLimiter::new(builder.build()?, self.store.clone())
            .with_clock(self.clock.clone())
            .with_operation_timeout(self.operation_timeout))
    }
}

/// Every named preset, built from configuration.
#[derive(Debug, Clone)]
pub struct PolicySet {
    pub global: RateLimiter,
    pub per_ip: RateLimiter,
    pub per_user: RateLimiter,
    pub per_api_key: RateLimiter,
    pub strict: RateLimiter,
    pub auth: RateLimiter,
    pub tiered: TieredLimiter,
}

impl PolicySet {
    /// Names accepted by [`PolicySet::get`].
    pub const NAMES: [&'static str; 7] = [
        "global",
        "per_ip",
        "per_user",
        "per_api_key",
        "strict",
        "auth",
        "tiered",
    ];

    /// Build every preset; tiers are classified by plan.
    pub fn from_config(config: &RateLimitingConfig, factory: &LimiterFactory) -> Result<Self> {
        Self::with_classifier(config, factory, by_plan())
    }

    /// Build every preset with a custom tier classifier.
    pub fn with_classifier(
        config: &RateLimitingConfig,
        factory: &LimiterFactory,
        classify: Classifier,
    ) -> Result<Self> {
        let set = Self {
            global: factory.build(global(&config.global))?,
            per_ip: factory.build(per_ip(&config.per_ip))?,
            per_user: factory.build(per_user(&config.per_user))?,
            per_api_key: factory.build(per_api_key(&config.per_api_key))?,
            strict: factory.build(strict(&config.strict))?,
            auth: factory.build(auth(&config.auth))?,
            tiered: TieredLimiter::from_settings(
                &config.tiers,
                &config.default_tier,
                classify,
                factory,
            )?,
        };

        info!(
            policies = Self::NAMES.len(),
            tiers = config.tiers.len(),
            "Rate limit policies initialized"
        );
        Ok(set)
    }

    /// Look up a preset by name.
    pub fn get(&self, name: &str) -> Option<&dyn Admission> {
        let admission: &dyn Admission = match name {
            "global" => &self.global,
            "per_ip" => &self.per_ip,
            "per_user" => &self.per_user,
            "per_api_key" => &self.per_api_key,
            "strict" => &self.strict,
            "auth" => &self.auth,
            "tiered" => &self.tiered,
            _ => return None,
        };
        Some(admission)
    }
}
