//! Parsing of `ffprobe -of json` stream descriptions.

use chroma_core::VideoInfo;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

/// Parse an ffprobe rational such as `30000/1001`. `0/0` and other
/// degenerate values yield `None`.
pub fn parse_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Extract the first video stream's properties from ffprobe JSON.
///
/// The average frame rate is preferred; WebM-derived files often report
/// `0/0` there, in which case the base rate is used.
pub fn parse_probe(json: &[u8]) -> Result<VideoInfo, String> {
    let output: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| format!("unreadable ffprobe output: {e}"))?;
    let stream = output
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| "no video stream".to_string())?;

    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err("video stream has no dimensions".to_string());
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .ok_or_else(|| "video stream has no frame rate".to_string())?;

    Ok(VideoInfo {
        width,
        height,
        fps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn test_stream_info_falls_back_to_base_rate() {
        let json = br#"{
            "programs": [],
            "streams": [
                {"width": 1280, "height": 720, "avg_frame_rate": "0/0", "r_frame_rate": "30/1"}
            ]
        }"#;
        let info = parse_probe(json).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert_eq!(info.fps, 30.0);
    }

    #[test]
    fn test_stream_info_ignores_extra_fields() {
        let json = br#"{"streams": [{"width": 640, "height": 480,
            "avg_frame_rate": "24/1", "r_frame_rate": "24/1", "nb_frames": "96"}]}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.fps, 24.0);
    }

    #[test]
    fn test_stream_info_errors() {
        assert!(parse_probe(br#"{"streams": []}"#).is_err());
        assert!(parse_probe(br#"{"streams": [{"width": 10}]}"#).is_err());
        assert!(parse_probe(b"not json").is_err());
    }
}
