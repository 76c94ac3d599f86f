//! Alert text.

use chrono::{DateTime, SecondsFormat};
use sentinel_engine::{
    Coordinate, EmergencyContact, Geofence, Notification, SafetyTrigger, Timestamp,
    TransitionEvent, TriggerKind,
};

/// RFC 3339 in UTC, or the raw millisecond value if out of range.
pub fn format_time(ms: Timestamp) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}

/// Notification for a geofence transition. `fence` is `None` when the
/// transition names a geofence this agent does not know.
pub fn transition_notification(
    event: &TransitionEvent,
    fence: Option<&Geofence>,
    contact: Option<&EmergencyContact>,
) -> Notification {
    let place = fence
        .map(|f| f.display_name().to_string())
        .unwrap_or_else(|| event.geofence_id.clone());
    let severity = fence.map(|f| f.severity).unwrap_or_default();

    let title = match event.kind {
        TriggerKind::Enter => format!("{} arrived at {place}", event.device_id),
        TriggerKind::Exit => format!("{} left {place}", event.device_id),
        TriggerKind::Dwell => format!("{} is staying at {place}", event.device_id),
    };

    let mut lines = vec![
        format!("Device: {}", event.device_id),
        format!("Geofence: {place}"),
        format!("Time: {}", format_time(event.triggered_at)),
    ];
    push_location(&mut lines, &event.location);
    if event.is_provisional() {
        lines.push("Based on a low-accuracy fix; may be corrected.".to_string());
    }
    if let Some(contact) = contact {
        lines.push(format!("Emergency contact: {contact}"));
    }

    Notification {
        title,
        body: lines.join("\n"),
        severity,
    }
}

/// Notification for an SOS gesture or explicit emergency.
pub fn safety_notification(
    device_id: &str,
    trigger: SafetyTrigger,
    location: Option<&Coordinate>,
    at: Timestamp,
    contact: Option<&EmergencyContact>,
) -> Notification {
    let mut lines = vec![
        format!("Device: {device_id}"),
        format!("Time: {}", format_time(at)),
    ];
    match location {
        Some(location) => push_location(&mut lines, location),
        None => lines.push("Location: unknown".to_string()),
    }
    if let Some(contact) = contact {
        lines.push(format!("Emergency contact: {contact}"));
    }

    Notification {
        title: format!("{} from {device_id}", trigger.title()),
        body: lines.join("\n"),
        severity: trigger.severity(),
    }
}

pub fn append_summary(notification: &mut Notification, summary: &str) {
    let summary = summary.trim();
    if !summary.is_empty() {
        notification.body.push_str("\n\nSummary: ");
        notification.body.push_str(summary);
    }
}

fn push_location(lines: &mut Vec<String>, location: &Coordinate) {
    lines.push(format!("Location: {location}"));
    lines.push(format!("Map: {}", location.maps_url()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_engine::{Confidence, Severity};

    fn event(confidence: Confidence) -> TransitionEvent {
        TransitionEvent {
            geofence_id: "home".into(),
            device_id: "phone".into(),
            kind: TriggerKind::Enter,
            triggered_at: 1_706_745_600_000,
            source_sample_seq: 3,
            location: Coordinate::new(52.52, 13.405),
            confidence,
        }
    }

    #[test]
    fn rfc3339_time() {
        assert_eq!(format_time(1_706_745_600_000), "2024-02-01T00:00:00Z");
    }

    #[test]
    fn transition_text() {
        let fence = Geofence::new("home", Coordinate::new(52.52, 13.405), 100.0, TriggerKind::Enter)
            .with_label("Home");
        let contact = EmergencyContact {
            name: "Sam".into(),
            phone: "+49 30 1234".into(),
        };
        let n = transition_notification(&event(Confidence::Confirmed), Some(&fence), Some(&contact));

        assert_eq!(n.title, "phone arrived at Home");
        assert!(n.body.contains("Time: 2024-02-01T00:00:00Z"));
        assert!(n.body.contains("Location: 52.520000, 13.405000"));
        assert!(n.body.contains("https://maps.google.com/?q=52.520000,13.405000"));
        assert!(n.body.contains("Emergency contact: Sam (+49 30 1234)"));
        assert!(!n.body.contains("low-accuracy"));
    }

    #[test]
    fn unknown_fence_and_provisional() {
        let n = transition_notification(&event(Confidence::Provisional), None, None);
        assert_eq!(n.title, "phone arrived at home");
        assert_eq!(n.severity, Severity::Warning);
        assert!(n.body.contains("low-accuracy"));
    }

    #[test]
    fn safety_text() {
        let mut n = safety_notification("phone", SafetyTrigger::Sos, None, 0, None);
        assert_eq!(n.title, "SOS alert from phone");
        assert_eq!(n.severity, Severity::Critical);
        assert!(n.body.contains("Location: unknown"));

        append_summary(&mut n, "  ");
        assert!(!n.body.contains("Summary"));
        append_summary(&mut n, "Left home at 9, no movement since.");
        assert!(n.body.ends_with("Summary: Left home at 9, no movement since."));
    }
}
