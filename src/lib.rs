//! Turnstile - request admission layer
//!
//! This crate implements the two halves of an API gateway's admission path:
//! a fixed-window rate limiter with named policy presets and plan tiers, and
//! a TTL cache with tag-based invalidation. Both run against either
//! in-process stores or a shared Redis-compatible server, so every instance
//! of a service enforces one set of counters.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
