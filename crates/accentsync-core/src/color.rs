//! The RGB color value applied to lighting devices

use std::fmt;

/// An RGB color with 8-bit channels.
///
/// Equality is structural: two colors are the same value exactly when all
/// three channels match. This is the equality the propagation guard relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    /// Red component (0-255).
    pub r: u8,
    /// Green component (0-255).
    pub g: u8,
    /// Blue component (0-255).
    pub b: u8,
}

impl Color {
    /// Create a color from RGB components.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Decode the accent-color DWORD as stored by the Windows DWM.
    ///
    /// The registry value is laid out `0xAABBGGRR`: red in the lowest byte,
    /// then green, then blue. The top byte (alpha) is ignored.
    pub const fn from_accent_dword(raw: u32) -> Self {
        Self {
            r: (raw & 0xFF) as u8,
            g: ((raw >> 8) & 0xFF) as u8,
            b: ((raw >> 16) & 0xFF) as u8,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}
