//! Per-session record of color-change events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One logged transition of the displayed challenge color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorEvent {
    pub previous_color: String,
    pub new_color: String,
    /// Capture-clock milliseconds at which `new_color` was shown.
    pub timestamp: i64,
    /// Capture-clock milliseconds at which recording began.
    pub video_start_time: i64,
}

impl ColorEvent {
    /// Milliseconds between the start of the recording and this event.
    pub fn relative_ms(&self) -> i64 {
        self.timestamp - self.video_start_time
    }

    pub fn label(&self) -> FrameLabel {
        FrameLabel {
            timestamp: self.timestamp,
            color: self.new_color.clone(),
        }
    }
}

/// Name of an extracted frame: `"{timestamp}_{color}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameLabel {
    pub timestamp: i64,
    pub color: String,
}

impl FrameLabel {
    /// Parse a label (typically a file stem). The color may itself contain
    /// underscores; only the first one separates it from the timestamp.
    pub fn parse(raw: &str) -> Option<Self> {
        let (timestamp, color) = raw.split_once('_')?;
        if color.is_empty() {
            return None;
        }
        Some(Self {
            timestamp: timestamp.parse().ok()?,
            color: color.to_string(),
        })
    }
}

impl fmt::Display for FrameLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.timestamp, self.color)
    }
}

/// Append-only color event log.
///
/// Holds events in arrival order. Transport order is not capture order, so
/// anything that needs time order must ask for it explicitly through
/// [`EventLog::sorted_by_timestamp`].
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<ColorEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, event: ColorEvent) {
        self.events.push(event);
    }

    /// All events in arrival order.
    pub fn snapshot(&self) -> Vec<ColorEvent> {
        self.events.clone()
    }

    /// All events in capture order. Stable: equal timestamps keep arrival order.
    pub fn sorted_by_timestamp(&self) -> Vec<ColorEvent> {
        let mut events = self.events.clone();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Serialize as the `color_data` JSON array.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.events)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        Ok(Self {
            events: serde_json::from_slice(bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(color: &str, timestamp: i64) -> ColorEvent {
        ColorEvent {
            previous_color: "transparent".to_string(),
            new_color: color.to_string(),
            timestamp,
            video_start_time: 1_000,
        }
    }

    #[test]
    fn test_snapshot_keeps_arrival_order() {
        let mut log = EventLog::new();
        log.append(event("red", 3_000));
        log.append(event("blue", 2_000));
        log.append(event("green", 2_500));

        let colors: Vec<_> = log.snapshot().into_iter().map(|e| e.new_color).collect();
        assert_eq!(colors, ["red", "blue", "green"]);
    }

    #[test]
    fn test_sorted_by_timestamp_is_capture_order() {
        let mut log = EventLog::new();
        log.append(event("red", 3_000));
        log.append(event("blue", 2_000));
        log.append(event("cyan", 2_000));
        log.append(event("green", 2_500));

        let colors: Vec<_> = log
            .sorted_by_timestamp()
            .into_iter()
            .map(|e| e.new_color)
            .collect();
        // Equal timestamps stay in arrival order
        assert_eq!(colors, ["blue", "cyan", "green", "red"]);
    }

    #[test]
    fn test_relative_ms() {
        assert_eq!(event("red", 1_700).relative_ms(), 700);
        assert_eq!(event("red", 900).relative_ms(), -100);
    }

    #[test]
    fn test_json_uses_color_data_field_names() {
        let mut log = EventLog::new();
        log.append(event("red", 1_700));
        let json: serde_json::Value = serde_json::from_slice(&log.to_json().unwrap()).unwrap();
        let entry = &json[0];
        assert_eq!(entry["previous_color"], "transparent");
        assert_eq!(entry["new_color"], "red");
        assert_eq!(entry["timestamp"], 1_700);
        assert_eq!(entry["video_start_time"], 1_000);

        let parsed = EventLog::from_json(&log.to_json().unwrap()).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_label_format_and_parse() {
        let label = event("blue", 1744959510474).label();
        assert_eq!(label.to_string(), "1744959510474_blue");

        let parsed = FrameLabel::parse("1744959510474_light_blue").unwrap();
        assert_eq!(parsed.timestamp, 1744959510474);
        assert_eq!(parsed.color, "light_blue");

        assert!(FrameLabel::parse("transparent").is_none());
        assert!(FrameLabel::parse("abc_red").is_none());
        assert!(FrameLabel::parse("123_").is_none());
    }
}
