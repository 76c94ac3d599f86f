//! Geofence definitions.
//!
//! Geofences are owned by the account configuration and are read-only to the
//! engine. A [`GeofenceSet`] is ordered by id so evaluation visits fences in
//! a stable order.

use crate::{error::Result, Coordinate, Error, GeofenceId, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a geofence fires on. Also the kind of a transition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Enter,
    Exit,
    Dwell,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
            Self::Dwell => "dwell",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named circular region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    pub id: GeofenceId,
    /// Human-readable name used in alert text
    #[serde(default)]
    pub label: String,
    pub center: Coordinate,
    pub radius_meters: f64,
    pub kind: TriggerKind,
    /// Required for dwell geofences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_seconds: Option<u64>,
    #[serde(default)]
    pub severity: Severity,
}

impl Geofence {
    /// Create a geofence firing on `kind`.
    pub fn new(
        id: impl Into<GeofenceId>,
        center: Coordinate,
        radius_meters: f64,
        kind: TriggerKind,
    ) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            center,
            radius_meters,
            kind,
            dwell_seconds: None,
            severity: Severity::default(),
        }
    }

    /// Create a dwell geofence.
    pub fn dwell(
        id: impl Into<GeofenceId>,
        center: Coordinate,
        radius_meters: f64,
        dwell_seconds: u64,
    ) -> Self {
        let mut fence = Self::new(id, center, radius_meters, TriggerKind::Dwell);
        fence.dwell_seconds = Some(dwell_seconds);
        fence
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Label if set, otherwise the id.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }

    /// Whether a position lies inside (or on the boundary of) this fence.
    pub fn contains(&self, point: &Coordinate) -> bool {
        self.center.distance_to(point) <= self.radius_meters
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidGeofence {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.is_empty() {
            return Err(invalid("empty id"));
        }
        self.center
            .validate()
            .map_err(|_| invalid("center out of range"))?;
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return Err(invalid("radius must be positive"));
        }
        if self.kind == TriggerKind::Dwell && self.dwell_seconds.is_none() {
            return Err(invalid("dwell geofence requires dwellSeconds"));
        }
        Ok(())
    }
}

/// The geofences configured for an account, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeofenceSet {
    fences: BTreeMap<GeofenceId, Geofence>,
}

impl GeofenceSet {
    pub fn new() -> Self {
        Self {
            fences: BTreeMap::new(),
        }
    }

    /// Add a geofence after validating it.
    pub fn insert(&mut self, fence: Geofence) -> Result<()> {
        fence.validate()?;
        if self.fences.contains_key(&fence.id) {
            return Err(Error::DuplicateGeofence(fence.id));
        }
        self.fences.insert(fence.id.clone(), fence);
        Ok(())
    }

    /// Builder-style insert.
    pub fn with_fence(mut self, fence: Geofence) -> Result<Self> {
        self.insert(fence)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&Geofence> {
        self.fences.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.fences.contains_key(id)
    }

    /// Fences in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Geofence> {
        self.fences.values()
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    /// Parse a JSON array of geofences.
    pub fn from_json(json: &str) -> Result<Self> {
        let fences: Vec<Geofence> = serde_json::from_str(json).map_err(|e| {
            Error::InvalidGeofence {
                id: String::new(),
                reason: e.to_string(),
            }
        })?;

        let mut set = Self::new();
        for fence in fences {
            set.insert(fence)?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn center() -> Coordinate {
        Coordinate::new(40.7128, -74.0060)
    }

    #[test]
    fn contains_uses_radius() {
        let fence = Geofence::new("office", center(), 100.0, TriggerKind::Enter);
        assert!(fence.contains(&center()));
        // ~0.001 deg latitude is ~111 m
        assert!(!fence.contains(&Coordinate::new(40.7138, -74.0060)));
        assert!(fence.contains(&Coordinate::new(40.7135, -74.0060)));
    }

    #[test]
    fn dwell_requires_seconds() {
        let mut fence = Geofence::new("park", center(), 50.0, TriggerKind::Dwell);
        assert!(fence.validate().is_err());
        fence.dwell_seconds = Some(60);
        assert!(fence.validate().is_ok());
    }

    #[test]
    fn rejects_bad_radius() {
        let fence = Geofence::new("x", center(), 0.0, TriggerKind::Exit);
        assert!(matches!(
            fence.validate(),
            Err(Error::InvalidGeofence { .. })
        ));
    }

    #[test]
    fn set_rejects_duplicates() {
        let mut set = GeofenceSet::new();
        set.insert(Geofence::new("a", center(), 10.0, TriggerKind::Enter))
            .unwrap();
        let err = set
            .insert(Geofence::new("a", center(), 20.0, TriggerKind::Exit))
            .unwrap_err();
        assert_eq!(err, Error::DuplicateGeofence("a".into()));
    }

    #[test]
    fn iteration_is_ordered_by_id() {
        let set = GeofenceSet::new()
            .with_fence(Geofence::new("zoo", center(), 10.0, TriggerKind::Enter))
            .unwrap()
            .with_fence(Geofence::new("airport", center(), 10.0, TriggerKind::Enter))
            .unwrap();
        let ids: Vec<_> = set.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["airport", "zoo"]);
    }

    #[test]
    fn from_json_with_defaults() {
        let json = r#"[
            {"id": "home", "label": "Home", "center": {"latitude": 1.0, "longitude": 2.0},
             "radiusMeters": 100.0, "kind": "enter"},
            {"id": "school", "center": {"latitude": 1.0, "longitude": 2.1},
             "radiusMeters": 80.0, "kind": "dwell", "dwellSeconds": 300, "severity": "critical"}
        ]"#;
        let set = GeofenceSet::from_json(json).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("home").unwrap().severity, Severity::Warning);
        assert_eq!(set.get("school").unwrap().dwell_seconds, Some(300));
        assert_eq!(set.get("school").unwrap().display_name(), "school");
        assert_eq!(set.get("home").unwrap().display_name(), "Home");
    }

    #[test]
    fn from_json_rejects_invalid_fence() {
        let json = r#"[{"id": "bad", "center": {"latitude": 1.0, "longitude": 2.0},
                        "radiusMeters": 10.0, "kind": "dwell"}]"#;
        assert!(GeofenceSet::from_json(json).is_err());
    }
}
