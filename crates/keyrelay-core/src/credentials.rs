//! Per-provider API key rotation.
//!
//! Every provider owns a ring of credentials with one current index. Spent
//! credentials carry an expiry timestamp and come back on their own once the
//! cool-down passes; the check happens lazily whenever the ring is touched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::util::mask_key;

/// Default cool-down before an exhausted credential is tried again.
pub const DEFAULT_COOLDOWN_SECS: i64 = 300;

/// Health bookkeeping for a single credential.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialStatus {
    pub exhausted: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub response_time_ms: u64,
    pub exhausted_until: Option<DateTime<Utc>>,
}

/// Masked view of a credential for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSnapshot {
    pub key: String,
    pub exhausted: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub response_time_ms: u64,
}

/// Masked view of one provider's ring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRingSnapshot {
    pub current_index: usize,
    pub keys: Vec<CredentialSnapshot>,
}

#[derive(Debug, Default)]
struct KeyRing {
    keys: Vec<String>,
    index: usize,
    status: HashMap<String, CredentialStatus>,
}

impl KeyRing {
    fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            index: 0,
            status: HashMap::new(),
        }
    }

    /// Re-enable credentials whose cool-down has passed.
    fn expire(&mut self, now: DateTime<Utc>) {
        for status in self.status.values_mut() {
            if status.exhausted && status.exhausted_until.is_some_and(|until| until <= now) {
                *status = CredentialStatus {
                    last_used: status.last_used,
                    ..CredentialStatus::default()
                };
            }
        }
    }

    fn is_exhausted(&self, key: &str) -> bool {
        self.status.get(key).is_some_and(|s| s.exhausted)
    }

    fn has_available(&self) -> bool {
        self.keys.iter().any(|k| !self.is_exhausted(k))
    }

    /// Index of the first non-exhausted key after `self.index`, wrapping.
    fn next_available(&self) -> Option<usize> {
        let len = self.keys.len();
        (1..=len)
            .map(|offset| (self.index + offset) % len)
            .find(|&i| !self.is_exhausted(&self.keys[i]))
    }

    fn current(&mut self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        if self.is_exhausted(&self.keys[self.index]) {
            if let Some(next) = self.next_available() {
                self.index = next;
            }
        }
        Some(self.keys[self.index].clone())
    }

    /// The key `current` would hand out, without moving the index.
    fn peek(&self) -> Option<String> {
        let current = self.keys.get(self.index)?;
        if !self.is_exhausted(current) {
            return Some(current.clone());
        }
        self.next_available().map(|i| self.keys[i].clone())
    }

    fn rotate(&mut self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        match self.next_available() {
            Some(next) => self.index = next,
            None => {
                self.reset();
            }
        }
        Some(self.keys[self.index].clone())
    }

    fn reset(&mut self) {
        self.status.clear();
        self.index = 0;
    }
}

/// Credential status table for every provider, owned by one orchestrator.
pub struct KeyRotationTable {
    rings: DashMap<String, KeyRing>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
}

impl KeyRotationTable {
    pub fn new(clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            rings: DashMap::new(),
            clock,
            cooldown,
        }
    }

    /// Register (or replace) the credential ring of a provider.
    /// Duplicate and empty keys are dropped, order is kept.
    pub fn register(&self, provider: &str, keys: impl IntoIterator<Item = String>) {
        let mut seen = std::collections::HashSet::new();
        let keys: Vec<String> = keys
            .into_iter()
            .filter(|k| !k.is_empty() && seen.insert(k.clone()))
            .collect();
        self.rings.insert(provider.to_string(), KeyRing::new(keys));
    }

    /// Current credential of a provider, skipping past an exhausted one when
    /// another credential is still usable.
    pub fn current(&self, provider: &str) -> Option<String> {
        let now = self.clock.now();
        let mut ring = self.rings.get_mut(provider)?;
        ring.expire(now);
        ring.current()
    }

    /// Usable credential a call would get next, leaving the ring index alone.
    /// `None` when the provider has no usable credential.
    pub fn peek(&self, provider: &str) -> Option<String> {
        let now = self.clock.now();
        let mut ring = self.rings.get_mut(provider)?;
        ring.expire(now);
        ring.peek()
    }

    /// Advance to the next usable credential in ring order. When every
    /// credential is exhausted the whole ring is cleared and index 0 returned.
    pub fn rotate(&self, provider: &str) -> Option<String> {
        let now = self.clock.now();
        let mut ring = self.rings.get_mut(provider)?;
        ring.expire(now);
        if !ring.has_available() && !ring.keys.is_empty() {
            info!("All {} keys for {} exhausted, resetting key table", ring.keys.len(), provider);
        }
        ring.rotate()
    }

    pub fn mark_exhausted(&self, provider: &str, key: &str, reason: &str) {
        let now = self.clock.now();
        let until = now + self.cooldown;
        if let Some(mut ring) = self.rings.get_mut(provider) {
            let status = ring.status.entry(key.to_string()).or_default();
            status.exhausted = true;
            status.error_count += 1;
            status.last_used = Some(now);
            status.exhausted_until = Some(until);
            warn!(
                "Key {} for {} exhausted ({}), cooling down until {}",
                mask_key(key),
                provider,
                reason,
                until.to_rfc3339()
            );
        }
    }

    pub fn mark_success(&self, provider: &str, key: &str, response_time_ms: u64) {
        let now = self.clock.now();
        if let Some(mut ring) = self.rings.get_mut(provider) {
            let status = ring.status.entry(key.to_string()).or_default();
            status.exhausted = false;
            status.exhausted_until = None;
            status.last_used = Some(now);
            status.response_time_ms = response_time_ms;
        }
    }

    /// A provider is available iff it owns at least one non-exhausted credential.
    pub fn is_available(&self, provider: &str) -> bool {
        let now = self.clock.now();
        match self.rings.get_mut(provider) {
            Some(mut ring) => {
                ring.expire(now);
                ring.has_available()
            }
            None => false,
        }
    }

    pub fn is_exhausted(&self, provider: &str, key: &str) -> bool {
        let now = self.clock.now();
        match self.rings.get_mut(provider) {
            Some(mut ring) => {
                ring.expire(now);
                ring.is_exhausted(key)
            }
            None => false,
        }
    }

    /// Non-exhausted credentials of a provider in ring order.
    pub fn available_keys(&self, provider: &str) -> Vec<String> {
        let now = self.clock.now();
        match self.rings.get_mut(provider) {
            Some(mut ring) => {
                ring.expire(now);
                ring.keys
                    .iter()
                    .filter(|k| !ring.is_exhausted(k))
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    pub fn key_count(&self, provider: &str) -> usize {
        self.rings.get(provider).map(|r| r.keys.len()).unwrap_or(0)
    }

    pub fn status(&self, provider: &str, key: &str) -> Option<CredentialStatus> {
        let now = self.clock.now();
        let mut ring = self.rings.get_mut(provider)?;
        ring.expire(now);
        Some(ring.status.get(key).cloned().unwrap_or_default())
    }

    pub fn reset_provider(&self, provider: &str) {
        if let Some(mut ring) = self.rings.get_mut(provider) {
            ring.reset();
        }
    }

    pub fn snapshot(&self, provider: &str) -> Option<KeyRingSnapshot> {
        let now = self.clock.now();
        let mut ring = self.rings.get_mut(provider)?;
        ring.expire(now);
        let keys = ring
            .keys
            .iter()
            .map(|k| {
                let status = ring.status.get(k).cloned().unwrap_or_default();
                CredentialSnapshot {
                    key: mask_key(k),
                    exhausted: status.exhausted,
                    last_used: status.last_used,
                    error_count: status.error_count,
                    response_time_ms: status.response_time_ms,
                }
            })
            .collect();
        Some(KeyRingSnapshot {
            current_index: ring.index,
            keys,
        })
    }
}

impl Default for KeyRotationTable {
    fn default() -> Self {
        Self::new(
            Arc::new(SystemClock),
            Duration::seconds(DEFAULT_COOLDOWN_SECS),
        )
    }
}
