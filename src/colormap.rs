//! False-colour palettes for 8-bit intensity indices
//!
//! The AGC stage reduces each raw sample to an index in `0..=255`; this module maps
//! that index to a display colour. Palettes cycle Iron -> Rainbow -> Grayscale.

use serde::{Deserialize, Serialize};

/// 8-bit RGB colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    /// Red component (0-255)
    pub r: u8,
    /// Green component (0-255)
    pub g: u8,
    /// Blue component (0-255)
    pub b: u8,
}

impl Rgb {
    /// Create a colour from its components
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Components as `[r, g, b]`
    pub const fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

/// Available false-colour palettes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Palette {
    /// Black through purple, red and yellow to white
    #[default]
    Iron,
    /// HSV hue sweep from red (cold) to magenta (hot)
    Rainbow,
    /// Index replicated on all three channels
    Grayscale,
}

impl Palette {
    /// Every palette in cycle order
    pub const ALL: [Palette; 3] = [Palette::Iron, Palette::Rainbow, Palette::Grayscale];

    /// The palette after this one in cycle order, wrapping around
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Palette::Iron => Palette::Rainbow,
            Palette::Rainbow => Palette::Grayscale,
            Palette::Grayscale => Palette::Iron,
        }
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            Palette::Iron => "IRON",
            Palette::Rainbow => "RAINBOW",
            Palette::Grayscale => "GRAYSCALE",
        }
    }

    /// Parse a palette name from an environment variable (case-insensitive)
    pub fn from_env_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "iron" => Some(Palette::Iron),
            "rainbow" => Some(Palette::Rainbow),
            "grayscale" | "greyscale" | "gray" | "grey" => Some(Palette::Grayscale),
            _ => None,
        }
    }

    /// Colour for an intensity index
    #[inline]
    pub fn color(self, index: u8) -> Rgb {
        colorize(index, self)
    }
}

impl std::fmt::Display for Palette {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Map an intensity index to a colour
pub fn colorize(index: u8, palette: Palette) -> Rgb {
    match palette {
        Palette::Iron => {
            let [r, g, b] = IRON_PALETTE[usize::from(index)];
            Rgb::new(r, g, b)
        }
        Palette::Rainbow => rainbow(index),
        Palette::Grayscale => Rgb::new(index, index, index),
    }
}

/// HSV to RGB with hue spread over 0..=300 degrees, full saturation and value
fn rainbow(index: u8) -> Rgb {
    let h = f32::from(index) / 255.0 * 300.0;
    let c = 1.0f32;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());

    let (r, g, b) = match h {
        h if h < 60.0 => (c, x, 0.0),
        h if h < 120.0 => (x, c, 0.0),
        h if h < 180.0 => (0.0, c, x),
        h if h < 240.0 => (0.0, x, c),
        h if h < 300.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    // Truncating float-to-int casts saturate, so 255.0 stays 255
    Rgb::new((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8)
}

/// Iron palette lookup table
#[rustfmt::skip]
pub const IRON_PALETTE: [[u8; 3]; 256] = [
    [0, 0, 0], [0, 0, 9], [2, 0, 16], [4, 0, 24], [6, 0, 31], [8, 0, 38], [10, 0, 45], [12, 0, 53],
    [14, 0, 60], [17, 0, 67], [19, 0, 74], [21, 0, 82], [23, 0, 89], [25, 0, 96], [27, 0, 103], [29, 0, 111],
    [31, 0, 118], [36, 0, 120], [41, 0, 121], [46, 0, 122], [51, 0, 123], [56, 0, 124], [61, 0, 125], [66, 0, 126],
    [71, 0, 128], [76, 1, 129], [81, 1, 130], [86, 2, 131], [91, 2, 132], [96, 3, 133], [101, 3, 134], [106, 4, 135],
    [111, 4, 137], [115, 5, 137], [119, 6, 138], [123, 7, 138], [127, 8, 139], [131, 9, 139], [135, 10, 140], [139, 11, 140],
    [143, 12, 141], [147, 13, 141], [151, 14, 142], [155, 15, 142], [159, 16, 143], [163, 17, 143], [167, 18, 144], [171, 19, 144],
    [175, 20, 145], [178, 21, 145], [181, 22, 145], [184, 23, 145], [187, 24, 145], [190, 25, 145], [193, 26, 145], [196, 27, 145],
    [199, 28, 146], [202, 29, 146], [205, 30, 146], [208, 31, 146], [211, 32, 146], [214, 33, 146], [217, 34, 146], [220, 35, 146],
    [224, 36, 147], [224, 38, 144], [225, 40, 142], [225, 42, 139], [226, 44, 137], [226, 46, 134], [227, 48, 132], [227, 50, 129],
    [228, 52, 127], [228, 54, 124], [229, 56, 122], [229, 58, 119], [230, 60, 117], [230, 62, 114], [231, 64, 112], [231, 66, 109],
    [232, 68, 107], [232, 70, 105], [233, 73, 102], [233, 75, 100], [234, 77, 97], [234, 79, 95], [235, 81, 92], [235, 83, 90],
    [236, 85, 87], [236, 87, 85], [237, 89, 82], [237, 91, 80], [238, 93, 77], [238, 95, 75], [239, 97, 72], [239, 99, 70],
    [240, 101, 67], [240, 104, 66], [241, 106, 64], [241, 109, 63], [242, 111, 62], [242, 114, 60], [243, 116, 59], [243, 119, 58],
    [244, 121, 56], [244, 124, 55], [245, 126, 54], [245, 129, 52], [246, 131, 51], [246, 134, 50], [247, 136, 48], [247, 139, 47],
    [248, 141, 46], [248, 144, 45], [248, 147, 44], [249, 149, 43], [249, 152, 42], [249, 155, 41], [250, 157, 40], [250, 160, 39],
    [250, 163, 38], [251, 165, 38], [251, 168, 37], [251, 171, 36], [252, 173, 35], [252, 176, 34], [252, 179, 33], [253, 181, 32],
    [253, 184, 32], [253, 187, 31], [253, 190, 31], [253, 192, 30], [254, 195, 30], [254, 198, 29], [254, 201, 29], [254, 203, 28],
    [254, 206, 28], [254, 209, 27], [255, 211, 27], [255, 214, 27], [255, 217, 26], [255, 219, 26], [255, 222, 25], [255, 225, 25],
    [255, 227, 25], [255, 229, 25], [255, 231, 24], [255, 233, 24], [255, 235, 24], [255, 237, 24], [255, 239, 24], [255, 241, 24],
    [255, 243, 24], [255, 245, 23], [255, 247, 23], [255, 249, 23], [255, 250, 23], [255, 251, 24], [255, 252, 24], [255, 253, 25],
    [255, 253, 25], [255, 254, 26], [255, 254, 26], [255, 255, 27], [255, 255, 28], [255, 255, 29], [255, 255, 30], [255, 255, 31],
    [255, 255, 32], [255, 255, 33], [255, 255, 34], [255, 255, 35], [255, 255, 36], [255, 255, 37], [255, 255, 38], [255, 255, 40],
    [255, 255, 41], [255, 255, 42], [255, 255, 44], [255, 255, 45], [255, 255, 47], [255, 255, 48], [255, 255, 50], [255, 255, 51],
    [255, 255, 53], [255, 255, 55], [255, 255, 57], [255, 255, 59], [255, 255, 61], [255, 255, 63], [255, 255, 65], [255, 255, 67],
    [255, 255, 69], [255, 255, 71], [255, 255, 73], [255, 255, 76], [255, 255, 78], [255, 255, 81], [255, 255, 83], [255, 255, 86],
    [255, 255, 88], [255, 255, 91], [255, 255, 94], [255, 255, 97], [255, 255, 100], [255, 255, 103], [255, 255, 106], [255, 255, 109],
    [255, 255, 112], [255, 255, 115], [255, 255, 118], [255, 255, 121], [255, 255, 125], [255, 255, 128], [255, 255, 132], [255, 255, 135],
    [255, 255, 139], [255, 255, 143], [255, 255, 147], [255, 255, 151], [255, 255, 155], [255, 255, 159], [255, 255, 163], [255, 255, 167],
    [255, 255, 171], [255, 255, 175], [255, 255, 180], [255, 255, 184], [255, 255, 189], [255, 255, 193], [255, 255, 198], [255, 255, 203],
    [255, 255, 207], [255, 255, 212], [255, 255, 217], [255, 255, 222], [255, 255, 227], [255, 255, 232], [255, 255, 237], [255, 255, 242],
    [255, 255, 247], [255, 255, 249], [255, 255, 251], [255, 255, 253], [255, 255, 254], [255, 255, 255], [255, 255, 255], [255, 255, 255],
    [255, 255, 255], [255, 255, 255], [255, 255, 255], [255, 255, 255], [255, 255, 255], [255, 255, 255], [255, 255, 255], [255, 255, 255],
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_palette_cycle_order() {
        assert_eq!(Palette::default(), Palette::Iron);
        assert_eq!(Palette::Iron.next(), Palette::Rainbow);
        assert_eq!(Palette::Rainbow.next(), Palette::Grayscale);
        assert_eq!(Palette::Grayscale.next(), Palette::Iron);
    }

    #[test]
    fn test_cycle_returns_after_three() {
        for palette in Palette::ALL {
            assert_eq!(palette.next().next().next(), palette);
        }
    }

    #[test]
    fn test_from_env_str() {
        assert_eq!(Palette::from_env_str("IRON"), Some(Palette::Iron));
        assert_eq!(Palette::from_env_str(" rainbow "), Some(Palette::Rainbow));
        assert_eq!(Palette::from_env_str("grey"), Some(Palette::Grayscale));
        assert_eq!(Palette::from_env_str("plasma"), None);
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Palette::Grayscale).unwrap(), "\"grayscale\"");
        let parsed: Palette = serde_json::from_str("\"rainbow\"").unwrap();
        assert_eq!(parsed, Palette::Rainbow);
    }

    #[test]
    fn test_iron_endpoints() {
        assert_eq!(colorize(0, Palette::Iron), Rgb::new(0, 0, 0));
        assert_eq!(colorize(255, Palette::Iron), Rgb::new(255, 255, 255));
        assert_eq!(colorize(64, Palette::Iron), Rgb::new(224, 36, 147));
    }

    #[test]
    fn test_rainbow_endpoints() {
        assert_eq!(colorize(0, Palette::Rainbow), Rgb::new(255, 0, 0));
        assert_eq!(colorize(255, Palette::Rainbow), Rgb::new(255, 0, 255));
    }

    #[test]
    fn test_rainbow_mid_is_cyan_region() {
        // 153 / 255 * 300 = 180 degrees
        let mid = colorize(153, Palette::Rainbow);
        assert_eq!(mid.r, 0);
        assert!(mid.b > 250);
    }

    #[test]
    fn test_grayscale_replicates_index() {
        for index in [0u8, 1, 128, 255] {
            assert_eq!(colorize(index, Palette::Grayscale), Rgb::new(index, index, index));
        }
    }
}
