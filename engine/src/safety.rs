//! SOS gesture detection.
//!
//! Both detectors are plain state machines over timestamped inputs. The host
//! feeds sensor readings and button edges; long presses are detected on the
//! next input or on [`VolumeGestureDetector::on_tick`], so no timers are
//! needed.

use crate::{Severity, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Standard gravity in m/s².
pub const GRAVITY: f64 = 9.806_65;

/// An emergency signalled by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SafetyTrigger {
    /// Device shaken repeatedly
    Sos,
    /// Volume down pressed rapidly
    SilentEmergency,
    /// Volume up pressed rapidly
    Police,
    /// Volume down held
    Medical,
    /// Both volume buttons held
    Panic,
}

impl SafetyTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sos => "sos",
            Self::SilentEmergency => "silent_emergency",
            Self::Police => "police",
            Self::Medical => "medical",
            Self::Panic => "panic",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Sos => "SOS alert",
            Self::SilentEmergency => "Silent emergency",
            Self::Police => "Police needed",
            Self::Medical => "Medical emergency",
            Self::Panic => "Panic alert",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Critical
    }
}

impl std::fmt::Display for SafetyTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShakeConfig {
    /// Acceleration above gravity counted as a shake (m/s²)
    pub threshold: f64,
    /// Minimum spacing between counted shakes
    pub debounce_ms: u64,
    pub window_ms: u64,
    pub required_shakes: u32,
}

impl Default for ShakeConfig {
    fn default() -> Self {
        Self {
            threshold: 15.0,
            debounce_ms: 500,
            window_ms: 3_000,
            required_shakes: 3,
        }
    }
}

/// Counts hard shakes from accelerometer readings.
#[derive(Debug, Clone)]
pub struct ShakeDetector {
    config: ShakeConfig,
    count: u32,
    first_at: Option<Timestamp>,
    last_at: Option<Timestamp>,
}

impl ShakeDetector {
    pub fn new(config: ShakeConfig) -> Self {
        Self {
            config,
            count: 0,
            first_at: None,
            last_at: None,
        }
    }

    /// Shakes counted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Feed one accelerometer reading (m/s² per axis).
    pub fn on_acceleration(&mut self, x: f64, y: f64, z: f64, at: Timestamp) -> Option<SafetyTrigger> {
        let magnitude = (x * x + y * y + z * z).sqrt() - GRAVITY;
        if magnitude.is_nan() || magnitude <= self.config.threshold {
            return None;
        }

        if self
            .first_at
            .is_some_and(|first| at.saturating_sub(first) > self.config.window_ms)
        {
            self.count = 0;
            self.first_at = None;
        }

        if self
            .last_at
            .is_some_and(|last| at.saturating_sub(last) <= self.config.debounce_ms)
        {
            return None;
        }

        self.last_at = Some(at);
        if self.count == 0 {
            self.first_at = Some(at);
        }
        self.count += 1;

        if self.count >= self.config.required_shakes {
            self.count = 0;
            self.first_at = None;
            return Some(SafetyTrigger::Sos);
        }
        None
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.first_at = None;
        self.last_at = None;
    }
}

impl Default for ShakeDetector {
    fn default() -> Self {
        Self::new(ShakeConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeButton {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGestureConfig {
    pub rapid_window_ms: u64,
    pub down_presses: usize,
    pub up_presses: usize,
    pub long_press_ms: u64,
    pub both_hold_ms: u64,
}

impl Default for VolumeGestureConfig {
    fn default() -> Self {
        Self {
            rapid_window_ms: 3_000,
            down_presses: 5,
            up_presses: 3,
            long_press_ms: 5_000,
            both_hold_ms: 3_000,
        }
    }
}

/// Recognizes volume button patterns.
///
/// | Pattern                         | Trigger           |
/// |---------------------------------|-------------------|
/// | 5 × down within 3 s             | `SilentEmergency` |
/// | 3 × up within 3 s               | `Police`          |
/// | down held 5 s                   | `Medical`         |
/// | up and down held together 3 s   | `Panic`           |
///
/// Any recognized pattern clears all press history.
#[derive(Debug, Clone)]
pub struct VolumeGestureDetector {
    config: VolumeGestureConfig,
    down_presses: VecDeque<Timestamp>,
    up_presses: VecDeque<Timestamp>,
    down_held_since: Option<Timestamp>,
    up_held_since: Option<Timestamp>,
}

impl VolumeGestureDetector {
    pub fn new(config: VolumeGestureConfig) -> Self {
        Self {
            config,
            down_presses: VecDeque::new(),
            up_presses: VecDeque::new(),
            down_held_since: None,
            up_held_since: None,
        }
    }

    /// A button went down.
    pub fn on_press(&mut self, button: VolumeButton, at: Timestamp) -> Option<SafetyTrigger> {
        if let Some(trigger) = self.check_holds(at) {
            return Some(trigger);
        }

        // Key repeat while held is not a new press
        let (held, presses) = match button {
            VolumeButton::Down => (&mut self.down_held_since, &mut self.down_presses),
            VolumeButton::Up => (&mut self.up_held_since, &mut self.up_presses),
        };
        if held.is_some() {
            return None;
        }
        *held = Some(at);
        presses.push_back(at);

        self.check_rapid(at)
    }

    /// A button came back up.
    pub fn on_release(&mut self, button: VolumeButton, at: Timestamp) -> Option<SafetyTrigger> {
        let trigger = self.check_holds(at);
        match button {
            VolumeButton::Down => self.down_held_since = None,
            VolumeButton::Up => self.up_held_since = None,
        }
        trigger
    }

    /// Advance time without input, so long presses fire while still held.
    pub fn on_tick(&mut self, now: Timestamp) -> Option<SafetyTrigger> {
        self.check_holds(now)
    }

    pub fn reset(&mut self) {
        self.down_presses.clear();
        self.up_presses.clear();
        self.down_held_since = None;
        self.up_held_since = None;
    }

    fn check_holds(&mut self, now: Timestamp) -> Option<SafetyTrigger> {
        let held_for = |since: Option<Timestamp>| since.map(|s| now.saturating_sub(s));

        if let (Some(down), Some(up)) = (held_for(self.down_held_since), held_for(self.up_held_since)) {
            if down.min(up) >= self.config.both_hold_ms {
                self.reset();
                return Some(SafetyTrigger::Panic);
            }
            // Both held: wait for panic rather than firing medical
            return None;
        }

        if held_for(self.down_held_since).is_some_and(|d| d >= self.config.long_press_ms) {
            self.reset();
            return Some(SafetyTrigger::Medical);
        }
        None
    }

    fn check_rapid(&mut self, now: Timestamp) -> Option<SafetyTrigger> {
        let window = self.config.rapid_window_ms;
        for presses in [&mut self.down_presses, &mut self.up_presses] {
            while presses
                .front()
                .is_some_and(|&t| now.saturating_sub(t) > window)
            {
                presses.pop_front();
            }
        }

        let trigger = if self.down_presses.len() >= self.config.down_presses {
            Some(SafetyTrigger::SilentEmergency)
        } else if self.up_presses.len() >= self.config.up_presses {
            Some(SafetyTrigger::Police)
        } else {
            None
        };
        if trigger.is_some() {
            self.reset();
        }
        trigger
    }
}

impl Default for VolumeGestureDetector {
    fn default() -> Self {
        Self::new(VolumeGestureConfig::default())
    }
}
