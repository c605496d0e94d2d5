//! Request descriptors and limit key derivation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Identity used when a derivation yields nothing.
///
/// Unidentifiable requests share this one bucket instead of bypassing the
/// limiter.
pub const WILDCARD_IDENTITY: &str = "*";

/// What the admission layer knows about an inbound request.
///
/// Populated by the transport layer before business logic runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Client address
    pub ip: Option<IpAddr>,
    /// Authenticated user id
    pub user_id: Option<String>,
    /// API key presented by the client
    pub api_key: Option<String>,
    /// Subscription plan of the caller
    pub plan: Option<String>,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Selected request headers, lower-cased names
    pub headers: HashMap<String, String>,
}

impl RequestContext {
    /// Context for a request from `ip`.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            ..Self::default()
        }
    }

    /// Set the authenticated user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the subscription plan.
    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    /// Set method and path.
    pub fn with_route(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.method = method.into();
        self.path = path.into();
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header by name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Function deriving the identity part of a limit key from a request.
///
/// Must be deterministic. Identities from different sources should carry a
/// distinguishing kind (see [`by_ip`], [`by_user`]) so they cannot collide.
pub type KeyDerivation = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

/// A key that uniquely identifies a rate limit counter.
///
/// The key is composed of the policy prefix and the derived identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// The policy prefix this key belongs to
    pub prefix: String,
    /// The derived identity
    pub identity: String,
}

impl LimitKey {
    /// Create a key, substituting [`WILDCARD_IDENTITY`] for an empty identity.
    pub fn new(prefix: &str, identity: Option<&str>) -> Self {
        let identity = match identity.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => WILDCARD_IDENTITY.to_string(),
        };

        Self {
            prefix: prefix.to_string(),
            identity,
        }
    }

    /// Whether the identity fell back to the wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.identity == WILDCARD_IDENTITY
    }

    /// Convert the key to the string used in the counter store.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.prefix, self.identity)
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Every request shares one identity.
pub fn global() -> KeyDerivation {
    Arc::new(|_: &RequestContext| Some("all".to_string()))
}

/// Identity by client IP.
pub fn by_ip() -> KeyDerivation {
    Arc::new(|ctx: &RequestContext| ctx.ip.map(|ip| format!("ip:{}", ip)))
}

/// Identity by authenticated user, falling back to client IP.
pub fn by_user() -> KeyDerivation {
    let ip = by_ip();
    Arc::new(move |ctx: &RequestContext| match non_empty(ctx.user_id.as_ref()) {
        Some(user) => Some(format!("user:{}", user)),
        None => ip(ctx),
    })
}

/// Identity by API key, falling back to client IP.
pub fn by_api_key() -> KeyDerivation {
    let ip = by_ip();
    Arc::new(move |ctx: &RequestContext| match non_empty(ctx.api_key.as_ref()) {
        Some(key) => Some(format!("apikey:{}", key)),
        None => ip(ctx),
    })
}

/// Identity by the value of a request header.
pub fn by_header(name: &str) -> KeyDerivation {
    let name = name.to_ascii_lowercase();
    Arc::new(move |ctx: &RequestContext| {
        ctx.header(&name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| format!("{}:{}", name, v))
    })
}

/// Join several derivations into one identity.
///
/// Parts that derive nothing are skipped; if every part is empty the result
/// is empty too (and the limiter falls back to the wildcard).
pub fn composite(parts: Vec<KeyDerivation>) -> KeyDerivation {
    Arc::new(move |ctx: &RequestContext| {
        let derived: Vec<String> = parts.iter().filter_map(|part| part(ctx)).collect();
        if derived.is_empty() {
            None
        } else {
            Some(derived.join("|"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "192.168.1.10".parse().unwrap()
    }

    #[test]
    fn test_limit_key_to_string() {
        let key = LimitKey::new("rl:per_ip", Some("ip:10.0.0.1"));
        assert_eq!(key.to_string_key(), "rl:per_ip:ip:10.0.0.1");
        assert_eq!(key.to_string(), "rl:per_ip:ip:10.0.0.1");
        assert!(!key.is_wildcard());
    }

    #[test]
    fn test_empty_identity_falls_back_to_wildcard() {
        assert!(LimitKey::new("rl", None).is_wildcard());
        assert!(LimitKey::new("rl", Some("   ")).is_wildcard());
        assert_eq!(LimitKey::new("rl", Some("")).to_string_key(), "rl:*");
    }

    #[test]
    fn test_by_user_falls_back_to_ip() {
        let derive = by_user();

        let anonymous = RequestContext::from_ip(ip());
        assert_eq!(derive(&anonymous).as_deref(), Some("ip:192.168.1.10"));

        let authenticated = RequestContext::from_ip(ip()).with_user("42");
        assert_eq!(derive(&authenticated).as_deref(), Some("user:42"));

        let blank_user = RequestContext::from_ip(ip()).with_user(" ");
        assert_eq!(derive(&blank_user).as_deref(), Some("ip:192.168.1.10"));
    }

    #[test]
    fn test_identity_kinds_do_not_collide() {
        // A user literally named like an IP must not share the IP's bucket
        let as_user = RequestContext::default().with_user("ip:192.168.1.10");
        let as_ip = RequestContext::from_ip(ip());

        assert_ne!(by_user()(&as_user), by_user()(&as_ip));
    }

    #[test]
    fn test_by_api_key() {
        let derive = by_api_key();
        let ctx = RequestContext::from_ip(ip()).with_api_key("k-123");
        assert_eq!(derive(&ctx).as_deref(), Some("apikey:k-123"));
        assert_eq!(derive(&RequestContext::default()), None);
    }

    #[test]
    fn test_by_header_is_case_insensitive() {
        let derive = by_header("X-Tenant");
        let ctx = RequestContext::default().with_header("x-tenant", "acme");
        assert_eq!(derive(&ctx).as_deref(), Some("x-tenant:acme"));
    }

    #[test]
    fn test_composite_skips_missing_parts() {
        let derive = composite(vec![by_ip(), by_header("x-tenant")]);

        let ctx = RequestContext::from_ip(ip()).with_header("X-Tenant", "acme");
        assert_eq!(derive(&ctx).as_deref(), Some("ip:192.168.1.10|x-tenant:acme"));

        let only_ip = RequestContext::from_ip(ip());
        assert_eq!(derive(&only_ip).as_deref(), Some("ip:192.168.1.10"));

        assert_eq!(derive(&RequestContext::default()), None);
    }

    #[test]
    fn test_global_derivation() {
        assert_eq!(global()(&RequestContext::default()).as_deref(), Some("all"));
    }
}
