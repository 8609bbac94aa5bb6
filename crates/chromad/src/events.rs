//! The session event stream: wire envelope and the closed set of events.

use axum::body::Bytes;
use base64::Engine as _;
use chroma_core::heuristics::Palette;
use chroma_core::{ColorEvent, FragmentMeta};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    #[serde(alias = "video_start")]
    CaptureStart,
    #[serde(alias = "color_change")]
    ColorChange,
    #[serde(alias = "video_chunk")]
    VideoFragment,
    #[serde(alias = "video_end")]
    CaptureEnd,
}

/// `{ "event": kind, "data": {...} }` as posted to `/sessions/{id}/events`.
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    pub event: EventKind,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug)]
pub enum SessionEvent {
    CaptureStart {
        timestamp: Option<i64>,
        mime_type: Option<String>,
    },
    ColorChange(ColorEvent),
    VideoFragment { meta: FragmentMeta, payload: Bytes },
    CaptureEnd,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureStartData {
    #[serde(default, deserialize_with = "opt_millis")]
    timestamp: Option<i64>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColorChangeData {
    #[serde(alias = "previous_color", default)]
    previous_color: String,
    #[serde(alias = "new_color")]
    new_color: String,
    #[serde(deserialize_with = "millis")]
    timestamp: i64,
    #[serde(alias = "video_start_time", deserialize_with = "millis")]
    video_start_time: i64,
}

#[derive(Debug, Deserialize)]
struct FragmentData {
    #[serde(flatten)]
    meta: FragmentMeta,
    /// Base64-encoded fragment bytes.
    payload: Option<String>,
}

/// Client clocks send milliseconds as JSON numbers, sometimes fractional.
fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() {
        return Err(serde::de::Error::custom("timestamp is not a finite number"));
    }
    Ok(value.round() as i64)
}

fn opt_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.filter(|v| v.is_finite()).map(|v| v.round() as i64))
}

impl EventEnvelope {
    /// Decode the envelope's payload into a typed event. Color names are
    /// resolved through `palette`.
    pub fn into_event(self, palette: &Palette) -> Result<SessionEvent, String> {
        let data = match self.data {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let invalid = |e: serde_json::Error| format!("invalid {:?} data: {e}", self.event);

        match self.event {
            EventKind::CaptureStart => {
                let d: CaptureStartData = serde_json::from_value(data).map_err(invalid)?;
                Ok(SessionEvent::CaptureStart {
                    timestamp: d.timestamp,
                    mime_type: d.mime_type,
                })
            }
            EventKind::ColorChange => {
                let d: ColorChangeData = serde_json::from_value(data).map_err(invalid)?;
                Ok(SessionEvent::ColorChange(ColorEvent {
                    previous_color: palette.resolve(&d.previous_color),
                    new_color: palette.resolve(&d.new_color),
                    timestamp: d.timestamp,
                    video_start_time: d.video_start_time,
                }))
            }
            EventKind::VideoFragment => {
                let d: FragmentData = serde_json::from_value(data).map_err(invalid)?;
                let encoded = d
                    .payload
                    .ok_or_else(|| "video-fragment event carries no payload".to_string())?;
                let payload = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| format!("invalid fragment payload: {e}"))?;
                Ok(SessionEvent::VideoFragment {
                    meta: d.meta,
                    payload: Bytes::from(payload),
                })
            }
            EventKind::CaptureEnd => Ok(SessionEvent::CaptureEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> Result<SessionEvent, String> {
        let envelope: EventEnvelope = serde_json::from_value(value).unwrap();
        envelope.into_event(&Palette::default())
    }

    #[test]
    fn test_color_change_resolves_palette() {
        let event = decode(json!({
            "event": "color-change",
            "data": {
                "previousColor": "transparent",
                "newColor": "#0000FF",
                "timestamp": 1700000001500.4,
                "videoStartTime": 1700000000000u64
            }
        }))
        .unwrap();
        let SessionEvent::ColorChange(event) = event else {
            panic!("expected color change");
        };
        assert_eq!(event.new_color, "blue");
        assert_eq!(event.previous_color, "transparent");
        assert_eq!(event.relative_ms(), 1500);
    }

    #[test]
    fn test_legacy_event_names_and_fields() {
        let event = decode(json!({
            "event": "color_change",
            "data": {
                "previousColor": "#FF0000",
                "newColor": "#00FF00",
                "timestamp": 2000,
                "video_start_time": 1000,
                "colorIndex": 2,
                "isLastColor": false
            }
        }))
        .unwrap();
        assert!(matches!(
            event,
            SessionEvent::ColorChange(ColorEvent { ref new_color, video_start_time: 1000, .. })
                if new_color == "green"
        ));

        assert!(matches!(
            decode(json!({"event": "video_end"})).unwrap(),
            SessionEvent::CaptureEnd
        ));
    }

    #[test]
    fn test_video_fragment_payload() {
        let event = decode(json!({
            "event": "video-fragment",
            "data": {
                "startTime": 0,
                "endTime": 1000,
                "mimeType": "video/webm",
                "sequence": 3,
                "payload": "GkXfow=="
            }
        }))
        .unwrap();
        let SessionEvent::VideoFragment { meta, payload } = event else {
            panic!("expected fragment");
        };
        assert_eq!(meta.sequence, Some(3));
        assert_eq!(meta.mime_type.as_deref(), Some("video/webm"));
        assert_eq!(&payload[..], &[0x1a, 0x45, 0xdf, 0xa3]);

        let err = decode(json!({
            "event": "video-fragment",
            "data": {"startTime": 0, "endTime": 1000}
        }))
        .unwrap_err();
        assert!(err.contains("no payload"));
    }

    #[test]
    fn test_capture_start_is_optional() {
        let event = decode(json!({"event": "capture-start", "data": {"timestamp": 42}})).unwrap();
        assert!(matches!(
            event,
            SessionEvent::CaptureStart { timestamp: Some(42), .. }
        ));
        assert!(matches!(
            decode(json!({"event": "capture-start"})).unwrap(),
            SessionEvent::CaptureStart { timestamp: None, .. }
        ));
    }

    #[test]
    fn test_rejects_unknown_kind_and_bad_data() {
        assert!(serde_json::from_value::<EventEnvelope>(json!({"event": "zoom"})).is_err());
        assert!(decode(json!({"event": "color-change", "data": {"newColor": "red"}})).is_err());
    }
}
