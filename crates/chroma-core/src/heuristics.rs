//! Tunable tables shared by the analyzer and the aggregator.
//!
//! Every table has a `Default` that matches the deployed client, and every
//! field can be overridden from a TOML file; missing keys fall back to the
//! default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An RGB color channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl Channel {
    /// Channels in tie-break priority order.
    pub const ALL: [Channel; 3] = [Channel::Red, Channel::Green, Channel::Blue];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Red => "Red",
            Channel::Green => "Green",
            Channel::Blue => "Blue",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heuristics {
    pub expected_channels: ExpectedChannels,
    pub color_naming: ColorNaming,
    pub palette: Palette,
    pub reference: ReferenceRule,
}

/// Which channel a displayed color is expected to dominate in the reflection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpectedChannels(BTreeMap<String, Channel>);

impl ExpectedChannels {
    pub fn new(table: BTreeMap<String, Channel>) -> Self {
        Self(
            table
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        )
    }

    /// Case-insensitive lookup. `None` for colors with no expectation.
    pub fn expected(&self, color: &str) -> Option<Channel> {
        let key = color.to_ascii_lowercase();
        self.0.get(&key).copied().or_else(|| {
            // Tables loaded from TOML keep whatever case the operator wrote
            self.0
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&key))
                .map(|(_, v)| *v)
        })
    }
}

impl Default for ExpectedChannels {
    fn default() -> Self {
        // Yellow reflects mostly as red on skin; cyan as green.
        Self::new(BTreeMap::from([
            ("blue".to_string(), Channel::Blue),
            ("blue2".to_string(), Channel::Blue),
            ("red".to_string(), Channel::Red),
            ("green".to_string(), Channel::Green),
            ("green2".to_string(), Channel::Green),
            ("yellow".to_string(), Channel::Red),
            ("cyan".to_string(), Channel::Green),
        ]))
    }
}

/// One hue band: hues strictly below `below` degrees get `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HueBand {
    pub below: f64,
    pub name: String,
}

/// HSV thresholds for naming a cluster centroid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorNaming {
    /// Saturation below which a color is achromatic.
    pub gray_saturation: f64,
    /// Achromatic colors darker than this are Black.
    pub black_value: f64,
    /// Achromatic colors brighter than this are White.
    pub white_value: f64,
    pub dark_value: f64,
    pub light_value: f64,
    pub pale_saturation: f64,
    /// Ascending hue bands in degrees.
    pub hue_bands: Vec<HueBand>,
    /// Name for hues past the last band.
    pub wrap: String,
}

impl Default for ColorNaming {
    fn default() -> Self {
        let band = |below: f64, name: &str| HueBand {
            below,
            name: name.to_string(),
        };
        Self {
            gray_saturation: 0.15,
            black_value: 0.30,
            white_value: 0.80,
            dark_value: 0.3,
            light_value: 0.7,
            pale_saturation: 0.4,
            hue_bands: vec![
                band(30.0, "Red"),
                band(90.0, "Yellow"),
                band(150.0, "Green"),
                band(210.0, "Cyan"),
                band(270.0, "Blue"),
                band(330.0, "Magenta"),
            ],
            wrap: "Red".to_string(),
        }
    }
}

/// Hex color string to symbolic name table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Palette(BTreeMap<String, String>);

impl Palette {
    /// Map a client color to its symbolic name. Unknown values, including
    /// colors that are already symbolic, pass through unchanged.
    pub fn resolve(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        self.0
            .iter()
            .find(|(hex, _)| hex.eq_ignore_ascii_case(trimmed))
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| raw.to_string())
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self(
            [
                ("#00000000", "transparent"),
                ("#000000", "black"),
                ("#0000FF", "blue"),
                ("#FFFF00", "yellow"),
                ("#00FF00", "green"),
                ("#FF0000", "red"),
                ("#00FFFF", "cyan"),
                ("#FFFFFF", "white"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        )
    }
}

/// How to pick the reference frame when more than one frame is marked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceSelection {
    /// Exactly one reference frame; anything else is an error.
    #[default]
    Strict,
    /// The earliest reference frame wins; later ones are analyzed as colored.
    Earliest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceRule {
    /// Case-insensitive substring identifying reference frame labels.
    pub marker: String,
    pub selection: ReferenceSelection,
}

impl ReferenceRule {
    pub fn is_reference(&self, color: &str) -> bool {
        color
            .to_ascii_lowercase()
            .contains(&self.marker.to_ascii_lowercase())
    }
}

impl Default for ReferenceRule {
    fn default() -> Self {
        Self {
            marker: "transparent".to_string(),
            selection: ReferenceSelection::Strict,
        }
    }
}
