//! Write stamps for last-writer-wins ordering of transition events.
//!
//! The stamp provides a total order across devices, which is essential for
//! a commutative merge.

use crate::{DeviceId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Ordering rules:
/// 1. Later `triggered_at` wins
/// 2. If equal, lexicographically higher device_id wins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteStamp {
    pub triggered_at: Timestamp,
    pub device_id: DeviceId,
}

impl WriteStamp {
    pub fn new(triggered_at: Timestamp, device_id: impl Into<DeviceId>) -> Self {
        Self {
            triggered_at,
            device_id: device_id.into(),
        }
    }

    /// Whether `self` beats `other` under last-writer-wins.
    pub fn supersedes(&self, other: &WriteStamp) -> bool {
        self > other
    }

    /// Same instant from different devices; resolved by device id alone.
    pub fn is_tie_with(&self, other: &WriteStamp) -> bool {
        self.triggered_at == other.triggered_at && self.device_id != other.device_id
    }
}

impl Ord for WriteStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.triggered_at.cmp(&other.triggered_at) {
            Ordering::Equal => self.device_id.cmp(&other.device_id),
            other => other,
        }
    }
}

impl PartialOrd for WriteStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
