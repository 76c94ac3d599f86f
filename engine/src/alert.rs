//! Alert vocabulary and the at-most-once admission ledger.

use crate::{DedupKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How urgent a notification is.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a notification channel receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub severity: Severity,
}

/// Person notified alongside SOS and geofence alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyContact {
    pub name: String,
    pub phone: String,
}

impl std::fmt::Display for EmergencyContact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.phone)
    }
}

/// Ledger verdict for one candidate alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting in the window; hand to the channel
    Deliver,
    /// Already admitted at `first_seen`
    Suppressed { first_seen: Timestamp },
    /// Older than the maximum alert age
    Stale { age_ms: u64 },
}

/// Remembers which dedup keys have been admitted.
///
/// A key is recorded the moment it is admitted, before delivery is even
/// attempted, so a retried sync that re-delivers the same event while the
/// first delivery is still retrying is suppressed too.
#[derive(Debug, Clone)]
pub struct AlertLedger {
    suppression_ms: u64,
    max_age_ms: u64,
    seen: BTreeMap<DedupKey, Timestamp>,
}

impl AlertLedger {
    pub fn new(suppression_ms: u64, max_age_ms: u64) -> Self {
        Self {
            suppression_ms,
            max_age_ms,
            seen: BTreeMap::new(),
        }
    }

    /// Decide whether an event triggered at `triggered_at` may alert at `now`.
    pub fn admit(&mut self, key: &DedupKey, triggered_at: Timestamp, now: Timestamp) -> Admission {
        let age_ms = now.saturating_sub(triggered_at);
        if self.max_age_ms > 0 && age_ms > self.max_age_ms {
            return Admission::Stale { age_ms };
        }

        if let Some(&first_seen) = self.seen.get(key) {
            if now.saturating_sub(first_seen) < self.suppression_ms {
                return Admission::Suppressed { first_seen };
            }
        }

        self.seen.insert(key.clone(), now);
        Admission::Deliver
    }

    /// Forget keys whose suppression window has passed. Returns how many
    /// were dropped.
    pub fn expire(&mut self, now: Timestamp) -> usize {
        let before = self.seen.len();
        let window = self.suppression_ms;
        self.seen
            .retain(|_, first_seen| now.saturating_sub(*first_seen) < window);
        before - self.seen.len()
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
