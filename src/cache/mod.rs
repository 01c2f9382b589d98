//! Generic in-memory caching primitives.
//!
//! The cache here is deliberately Jira-agnostic:
//! - String keys, any value type
//! - Optional per-entry TTL, evicted lazily on access
//! - In-place updates that keep the original expiry

mod expiring;

pub use expiring::ExpiringCache;
