//! Keyed in-memory cache with per-entry time-to-live.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A single cached value with an optional expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  value: T,
  /// Relative lifetime the entry was inserted with
  ttl: Option<Duration>,
  /// Absolute expiry, computed once at insertion
  expires_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
  fn new(value: T, ttl: Option<Duration>, now: Instant) -> Self {
    Self {
      value,
      ttl,
      expires_at: ttl.map(|ttl| now + ttl),
    }
  }

  fn is_expired(&self, now: Instant) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }
}

/// Cache mapping string keys to values that expire lazily.
///
/// Expired entries are only purged when they are next touched; there is no
/// background sweep. Nothing here fails or performs I/O.
#[derive(Debug)]
pub struct ExpiringCache<T> {
  entries: HashMap<String, CacheEntry<T>>,
}

impl<T> Default for ExpiringCache<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> ExpiringCache<T> {
  pub fn new() -> Self {
    Self {
      entries: HashMap::new(),
    }
  }

  /// Get the value for `key`, evicting it first if it has expired.
  pub fn get(&mut self, key: &str) -> Option<&T> {
    self.live_entry(key).map(|entry| &entry.value)
  }

  /// Get a mutable reference to a live value.
  pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
    self.live_entry(key).map(|entry| &mut entry.value)
  }

  /// Insert or replace `key`. Without a `ttl` the entry never expires.
  pub fn set(&mut self, key: impl Into<String>, value: T, ttl: Option<Duration>) {
    let entry = CacheEntry::new(value, ttl, Instant::now());
    self.entries.insert(key.into(), entry);
  }

  /// Replace the value of an existing entry without touching its expiry.
  ///
  /// Returns `false` and leaves the cache untouched when `key` is absent or
  /// already expired.
  pub fn update(&mut self, key: &str, value: T) -> bool {
    match self.live_entry(key) {
      Some(entry) => {
        entry.value = value;
        true
      }
      None => false,
    }
  }

  /// Remove a single entry.
  pub fn clear(&mut self, key: &str) {
    self.entries.remove(key);
  }

  /// Remove every entry.
  pub fn clear_all(&mut self) {
    self.entries.clear();
  }

  /// The TTL a live entry was inserted with.
  pub fn ttl(&mut self, key: &str) -> Option<Duration> {
    self.live_entry(key).and_then(|entry| entry.ttl)
  }

  /// Absolute expiry of a live entry, `None` if absent or immortal.
  pub fn expires_at(&mut self, key: &str) -> Option<Instant> {
    self.live_entry(key).and_then(|entry| entry.expires_at)
  }

  /// Number of entries currently held, including ones not yet evicted.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn live_entry(&mut self, key: &str) -> Option<&mut CacheEntry<T>> {
    let now = Instant::now();
    if self.entries.get(key)?.is_expired(now) {
      self.entries.remove(key);
      return None;
    }
    self.entries.get_mut(key)
  }
}
