//! Admission trait for abstracting single-policy and tiered limiters.

use async_trait::async_trait;

use super::descriptor::RequestContext;
use super::limiter::{Decision, RateLimiter};

/// Trait for anything that admits or rejects requests.
///
/// This trait abstracts over both [`RateLimiter`] and
/// [`TieredLimiter`](super::presets::TieredLimiter) so the transport layer can
/// hold a list of admission checks without caring which kind each one is.
#[async_trait]
pub trait Admission: Send + Sync {
    /// Count a request and decide whether it may proceed.
    async fn check(&self, ctx: &RequestContext) -> Decision;

    /// Report the final status of a request previously checked here.
    async fn report(&self, decision: &Decision, status: u16) -> bool;
}

#[async_trait]
impl Admission for RateLimiter {
    async fn check(&self, ctx: &RequestContext) -> Decision {
        RateLimiter::check(self, ctx).await
    }

    async fn report(&self, decision: &Decision, status: u16) -> bool {
        RateLimiter::report(self, decision, status).await
    }
}

/// Run every admission check in order and stop at the first denial.
///
/// Returns the decisions made so far; the last one is the denial if any
/// check failed. Callers report outcomes for every returned decision.
pub async fn admit_all(checks: &[&dyn Admission], ctx: &RequestContext) -> Vec<Decision> {
    let mut decisions = Vec::with_capacity(checks.len());
    for check in checks {
        let decision = check.check(ctx).await;
        let denied = !decision.is_allowed();
        decisions.push(decision);
        if denied {
            break;
        }
    }
    decisions
}
