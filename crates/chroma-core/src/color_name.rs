//! Human-readable names for RGB colors.

use crate::heuristics::ColorNaming;

/// Convert an RGB pixel to (hue in degrees, saturation, value), with
/// saturation and value in `[0, 1]`. Achromatic colors have hue 0.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> (f64, f64, f64) {
    let [r, g, b] = rgb.map(|c| c as f64 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let v = max;
    if max == min {
        return (0.0, 0.0, v);
    }
    let delta = max - min;
    let s = delta / max;

    let rc = (max - r) / delta;
    let gc = (max - g) / delta;
    let bc = (max - b) / delta;
    let h = if r == max {
        bc - gc
    } else if g == max {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    let h = (h / 6.0).rem_euclid(1.0);
    (h * 360.0, s, v)
}

/// Name an RGB color, e.g. "Light Pale Green" or "Gray".
pub fn color_name(rgb: [u8; 3], naming: &ColorNaming) -> String {
    let (h, s, v) = rgb_to_hsv(rgb);

    if s < naming.gray_saturation {
        return if v < naming.black_value {
            "Black".to_string()
        } else if v > naming.white_value {
            "White".to_string()
        } else {
            "Gray".to_string()
        };
    }

    let mut name = String::new();
    if v < naming.dark_value {
        name.push_str("Dark ");
    } else if v > naming.light_value {
        name.push_str("Light ");
    }
    if s < naming.pale_saturation {
        name.push_str("Pale ");
    }

    let hue = naming
        .hue_bands
        .iter()
        .find(|band| h < band.below)
        .map(|band| band.name.as_str())
        .unwrap_or(naming.wrap.as_str());
    name.push_str(hue);
    name
}
