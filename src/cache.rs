use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// A cached value byte is considered stale after this long.
pub const VALUE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: u8,
    observed_at: Instant,
}

/// Last known raw value byte per protocol variable.
///
/// Written by the telegram receive path and read by the derived value engine,
/// so access goes through one lock. Entries expire after [`VALUE_TTL`];
/// expired entries still return their value, expiry only drives re-polling
/// and is never an error.
#[derive(Debug, Default)]
pub struct ValueCache {
    entries: Mutex<HashMap<u8, CacheEntry>>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u8, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, variable: u8, value: u8) {
        trace!(message = "variable cached", variable = format_args!("{variable:02X}"), value);
        self.lock().insert(variable, CacheEntry { value, observed_at: Instant::now() });
    }

    pub fn get(&self, variable: u8) -> Option<u8> {
        self.lock().get(&variable).map(|entry| entry.value)
    }

    pub fn contains(&self, variable: u8) -> bool {
        self.lock().contains_key(&variable)
    }

    /// True when the variable is absent or its entry has outlived the TTL.
    pub fn is_expired(&self, variable: u8) -> bool {
        match self.lock().get(&variable) {
            None => true,
            Some(entry) => entry.observed_at.elapsed() > VALUE_TTL,
        }
    }

    /// Are all of `variables` present? Gates composite calculations.
    pub fn has_all_of(&self, variables: &[u8]) -> bool {
        let entries = self.lock();
        variables.iter().all(|variable| entries.contains_key(variable))
    }

    /// Dropped wholesale on reconnect so derived values never mix sessions.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_overwrites_and_get_returns_last_value() {
        let cache = ValueCache::new();
        assert_eq!(cache.get(0x34), None);
        cache.put(0x34, 0xA0);
        cache.put(0x34, 0xA1);
        assert_eq!(cache.get(0x34), Some(0xA1));
        assert!(cache.contains(0x34));
        cache.clear();
        assert_eq!(cache.get(0x34), None);
    }

    #[test]
    fn has_all_of_requires_every_variable() {
        let cache = ValueCache::new();
        cache.put(0x2B, 0x01);
        assert!(!cache.has_all_of(&[0x2B, 0x2C]));
        cache.put(0x2C, 0x2C);
        assert!(cache.has_all_of(&[0x2B, 0x2C]));
        assert!(cache.has_all_of(&[]));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_the_ttl() {
        let cache = ValueCache::new();
        cache.put(0x34, 0xA0);
        assert!(!cache.is_expired(0x34));

        tokio::time::advance(VALUE_TTL - Duration::from_millis(1)).await;
        assert!(!cache.is_expired(0x34));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(cache.is_expired(0x34));
        // The value itself is still readable, staleness only drives polling.
        assert_eq!(cache.get(0x34), Some(0xA0));

        cache.put(0x34, 0xA2);
        assert!(!cache.is_expired(0x34));
    }

    #[test]
    fn absent_variables_read_as_expired() {
        let cache = ValueCache::new();
        assert!(cache.is_expired(0x77));
    }
}
