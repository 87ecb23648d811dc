//! Debug visualisation of the shadow resolve.

/// Output of the resolve pass.
///
/// Press F3 to cycle through modes in the viewer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugMode {
    /// Normal shading.
    #[default]
    Lit = 0,
    /// Raw shadow comparison result.
    ShadowFactor = 1,
    /// Colour by the clipmap level each pixel samples.
    ClipmapLevel = 2,
    /// Green where the sampled page is resident, red where it is not.
    PageResidency = 3,
}

impl DebugMode {
    /// Cycle to the next debug mode.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Lit => Self::ShadowFactor,
            Self::ShadowFactor => Self::ClipmapLevel,
            Self::ClipmapLevel => Self::PageResidency,
            Self::PageResidency => Self::Lit,
        }
    }

    /// Get the mode as a u32 for shader push constants.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a command-line name such as `shadow-factor`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "lit" => Some(Self::Lit),
            "shadow" | "shadow-factor" => Some(Self::ShadowFactor),
            "level" | "clipmap-level" => Some(Self::ClipmapLevel),
            "pages" | "page-residency" => Some(Self::PageResidency),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_visits_every_mode() {
        let mut mode = DebugMode::default();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(mode.as_u32());
            mode = mode.next();
        }
        assert_eq!(mode, DebugMode::Lit);
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn names_parse() {
        assert_eq!(DebugMode::from_name("Pages"), Some(DebugMode::PageResidency));
        assert_eq!(DebugMode::from_name("shadow-factor"), Some(DebugMode::ShadowFactor));
        assert_eq!(DebugMode::from_name("nope"), None);
    }
}
