use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::cache::{Cache, CachedValue};
use turnstile::clock::SystemClock;
use turnstile::config::{LoggingConfig, PolicySettings, TurnstileConfig};
use turnstile::ratelimit::{Admission, LimitEvent, LimitHook, LimiterFactory, PolicySet, RequestContext};
use turnstile::store::Backends;

/// Turnstile - rate limiting and cache admission layer
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Rate limiting and tag-aware caching for API gateways")]
struct Cli {
    /// Configuration file (YAML); TURNSTILE__* environment variables override it
    #[arg(short, long, global = true, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send simulated requests through a named policy
    Check(CheckArgs),

    /// Read and modify cache entries
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Load the configuration, build every policy and print a summary
    Validate,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Policy to check against
    #[arg(short, long, default_value = "per_ip")]
    policy: String,

    /// Client address
    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Authenticated user id
    #[arg(long)]
    user: Option<String>,

    /// API key
    #[arg(long)]
    api_key: Option<String>,

    /// Subscription plan, used by the tiered policy
    #[arg(long)]
    plan: Option<String>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 1)]
    requests: u32,

    /// Response status to report for every allowed request
    #[arg(long)]
    status: Option<u16>,
}

impl CheckArgs {
    fn context(&self) -> RequestContext {
        let mut ctx = RequestContext::from_ip(self.ip);
        ctx.user_id = self.user.clone();
        ctx.api_key = self.api_key.clone();
        ctx.plan = self.plan.clone();
        ctx
    }
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Print a cached value
    Get { key: String },

    /// Store a value (parsed as JSON, otherwise stored as a string)
    Set {
        key: String,
        value: String,
        /// TTL in seconds; defaults to cache.default_ttl_secs
        #[arg(long)]
        ttl: Option<u64>,
        /// Tag to record the key under; repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Delete a key
    Del { key: String },

    /// List keys matching a glob pattern
    Keys {
        #[arg(default_value = "*")]
        pattern: String,
    },

    /// Delete every key recorded under the given tags
    InvalidateTag {
        #[arg(required = true)]
        tags: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TurnstileConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    init_logging(&config.logging, cli.json_logs)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.store.backend,
        "Starting Turnstile"
    );

    match cli.command {
        Command::Check(args) => check(&config, args).await,
        Command::Cache(command) => cache(&config, command).await,
        Command::Validate => validate(&config),
    }
}

fn init_logging(config: &LoggingConfig, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log level '{}'", config.level))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json || config.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn check(config: &TurnstileConfig, args: CheckArgs) -> anyhow::Result<()> {
    let backends = Backends::from_config(config).await?;

    let hook: LimitHook = Arc::new(|event: &LimitEvent| {
        println!(
            "      limit reached: policy={} key={} count={}/{} blocked_until={}",
            event.policy, event.key, event.count, event.limit, event.blocked_until
        );
    });
    let factory = LimiterFactory::new(
        backends.counters.clone(),
        backends.clock.clone(),
        config.store.operation_timeout(),
    )
    .with_hook(hook);
    let policies = PolicySet::from_config(&config.rate_limiting, &factory)?;

    let Some(limiter) = policies.get(&args.policy) else {
        bail!(
            "Unknown policy '{}', expected one of: {}",
            args.policy,
            PolicySet::NAMES.join(", ")
        );
    };

    let ctx = args.context();
    for n in 1..=args.requests {
        let decision = limiter.check(&ctx).await;
        let headers = decision
            .headers()
            .to_pairs()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(" ");

        match decision.rejection() {
            None => {
                println!("#{:<4} allow  {}", n, headers);
                if let Some(status) = args.status {
                    if limiter.report(&decision, status).await {
                        println!("      status {} not counted", status);
                    }
                }
            }
            Some(rejection) => {
                println!("#{:<4} deny   {}", n, headers);
                println!("      {}", rejection.body().to_json()?);
            }
        }
    }

    Ok(())
}

async fn cache(config: &TurnstileConfig, command: CacheCommand) -> anyhow::Result<()> {
    let backends = Backends::from_config(config).await?;
    let cache = Cache::new(backends.cache.clone(), &config.cache)
        .with_operation_timeout(config.store.operation_timeout());

    match command {
        CacheCommand::Get { key } => match cache.get_value(&key).await {
            Some(CachedValue::Json(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
            Some(CachedValue::Raw(bytes)) => println!("{}", String::from_utf8_lossy(&bytes)),
            None => println!("(miss)"),
        },
        CacheCommand::Set {
            key,
            value,
            ttl,
            tags,
        } => {
            let value: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let ttl = ttl.map(Duration::from_secs);

            let stored = if tags.is_empty() {
                cache.set(&key, &value, ttl).await
            } else {
                cache.set_with_tags(&key, &value, tags.as_slice(), ttl).await
            };
            if !stored {
                bail!("Failed to store '{}'", key);
            }
            println!("stored {}", key);
        }
        CacheCommand::Del { key } => {
            let outcome = if cache.del(&key).await { "deleted" } else { "not found" };
            println!("{}", outcome);
        }
        CacheCommand::Keys { pattern } => {
            for key in cache.keys(&pattern).await {
                println!("{}", key);
            }
        }
        CacheCommand::InvalidateTag { tags } => {
            let removed = cache.invalidate_tags(tags.as_slice()).await;
            println!("removed {} keys", removed);
        }
    }

    Ok(())
}

fn validate(config: &TurnstileConfig) -> anyhow::Result<()> {
    let backends = Backends::in_memory(Arc::new(SystemClock::new()));
    let factory = LimiterFactory::new(
        backends.counters.clone(),
        backends.clock.clone(),
        config.store.operation_timeout(),
    );
    PolicySet::from_config(&config.rate_limiting, &factory).context("Invalid rate limit policy")?;

    let rl = &config.rate_limiting;
    println!("configuration is valid");
    println!(
        "store: {:?} {}:{} (timeout {}ms)",
        config.store.backend, config.store.host, config.store.port, config.store.operation_timeout_ms
    );
    println!(
        "cache: namespace '{}', default ttl {}s",
        config.cache.namespace, config.cache.default_ttl_secs
    );

    let named: [(&str, &PolicySettings); 6] = [
        ("global", &rl.global),
        ("per_ip", &rl.per_ip),
        ("per_user", &rl.per_user),
        ("per_api_key", &rl.per_api_key),
        ("strict", &rl.strict),
        ("auth", &rl.auth),
    ];
    for (name, settings) in named {
        print_policy(name, settings);
    }
    for (tier, settings) in &rl.tiers {
        let marker = if *tier == rl.default_tier { " (default)" } else { "" };
        print_policy(&format!("tier {}{}", tier, marker), settings);
    }

    Ok(())
}

fn print_policy(name: &str, settings: &PolicySettings) {
    println!(
        "  {:<24} {} per {}s, block {}s{}{}",
        name,
        settings.points,
        settings.duration,
        settings.block_duration,
        if settings.skip_successful { ", skips successful" } else { "" },
        if settings.skip_failed { ", skips failed" } else { "" },
    );
}
