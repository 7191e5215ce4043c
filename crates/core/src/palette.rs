use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Color of the missing sentinel, as drawn by the viewer.
pub const MISSING_COLOR: &str = "rgba(200, 200, 200, 0.4)";

/// Plotly's qualitative palette.
pub const QUALITATIVE: [&str; 10] = [
    "#636EFA", "#EF553B", "#00CC96", "#AB63FA", "#FFA15A", "#19D3F3", "#FF6692", "#B6E880",
    "#FF97FF", "#FECB52",
];

/// Base colors of the taxonomic-group families. No gray on purpose: grays
/// belong to the neutral family.
pub const GROUP_BASES: [Rgb; 9] = [
    Rgb(31, 119, 180),
    Rgb(255, 127, 14),
    Rgb(44, 160, 44),
    Rgb(214, 39, 40),
    Rgb(148, 103, 189),
    Rgb(140, 86, 75),
    Rgb(227, 119, 194),
    Rgb(188, 189, 34),
    Rgb(23, 190, 207),
];

/// Neutral family for values without a hierarchy placement. Kept darker
/// than the missing color.
pub const NEUTRAL_BASES: [Rgb; 5] = [
    Rgb(99, 99, 99),
    Rgb(130, 130, 130),
    Rgb(70, 70, 70),
    Rgb(160, 160, 160),
    Rgb(45, 45, 45),
];

static HEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("valid regex"));
static RGB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(rgba?)\(\s*(\d{1,3})\s*,\s*(\d{1,3})\s*,\s*(\d{1,3})\s*(?:,\s*(\d*\.?\d+)\s*)?\)$")
        .expect("valid regex")
});

/// Whether `raw` is one of the color forms written into artifacts:
/// `#rrggbb`, `rgb(r, g, b)` or `rgba(r, g, b, a)` with channels up to 255
/// and alpha in [0, 1].
pub fn is_color(raw: &str) -> bool {
    if HEX_RE.is_match(raw) {
        return true;
    }
    let Some(caps) = RGB_RE.captures(raw) else {
        return false;
    };
    let channels_ok = (2..=4).all(|i| caps[i].parse::<u16>().map_or(false, |c| c <= 255));
    let alpha_ok = match (&caps[1], caps.get(5)) {
        ("rgb", None) => true,
        ("rgba", Some(alpha)) => alpha
            .as_str()
            .parse::<f64>()
            .map_or(false, |a| (0.0..=1.0).contains(&a)),
        _ => false,
    };
    channels_ok && alpha_ok
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Moves the color towards white by `t` in [0, 1].
    pub fn lighten(self, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        let mix = |c: u8| -> u8 { (c as f64 + (255.0 - c as f64) * t).round() as u8 };
        Rgb(mix(self.0), mix(self.1), mix(self.2))
    }

    pub fn with_alpha(self, alpha: f64) -> Rgba {
        Rgba(self, alpha.clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba(pub Rgb, pub f64);

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Rgba(Rgb(r, g, b), a) = *self;
        write!(f, "rgba({r}, {g}, {b}, {})", format_alpha(a))
    }
}

fn format_alpha(alpha: f64) -> String {
    let text = format!("{alpha:.2}");
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Shades of one family, darkest first.
pub fn family_shades(base: Rgb, shades: usize, step: f64, alpha: f64) -> Vec<String> {
    (0..shades.max(1))
        .map(|k| base.lighten(step * k as f64).with_alpha(alpha).to_string())
        .collect()
}

/// The qualitative palette rotated by a stable hash of the feature name, so
/// different features do not all start on the same color.
pub fn qualitative_for(feature: &str, rotate: bool) -> Vec<String> {
    let offset = if rotate {
        (stable_hash(feature) % QUALITATIVE.len() as u64) as usize
    } else {
        0
    };
    QUALITATIVE
        .iter()
        .cycle()
        .skip(offset)
        .take(QUALITATIVE.len())
        .map(|c| c.to_string())
        .collect()
}

pub fn stable_hash(text: &str) -> u64 {
    let hash = blake3::hash(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
