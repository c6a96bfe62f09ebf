//! Persisted frame configuration.
//!
//! The configuration portal (out of scope here) writes a single JSON
//! document; this module owns its schema and validation. A configuration is
//! loaded once at wake and dropped at suspend, never cached across cycles.

use heapless::{String, Vec};
use serde::Deserialize;

/// Upper bound on configured image slots.
pub const MAX_SLOTS: usize = 10;
/// Upper bound on a slot URL.
pub const MAX_URL_LEN: usize = 160;
/// Meaningful bits of the enabled-hours mask: bit `h` = local hour `h`.
pub const HOURS_MASK: u32 = 0x00FF_FFFF;

/// One configured image source.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ImageSlot {
    pub url: String<MAX_URL_LEN>,
    /// Refresh cadence; 0 means button-only (no timer wake is armed).
    pub interval_minutes: u16,
    /// Remain on this slot across non-manual wakes instead of advancing.
    #[serde(default)]
    pub stay: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FrameConfig {
    pub slots: Vec<ImageSlot, MAX_SLOTS>,
    #[serde(default)]
    pub change_detection: bool,
    #[serde(default = "all_hours")]
    pub enabled_hours: u32,
    #[serde(default)]
    pub tz_offset_hours: i8,
}

fn all_hours() -> u32 {
    HOURS_MASK
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisplayMode {
    /// Exactly one slot configured.
    Single,
    /// More than one slot, rotated by policy.
    Carousel,
}

impl DisplayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayMode::Single => "single",
            DisplayMode::Carousel => "carousel",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// Document missing or unreadable from the store.
    Unreadable,
    /// Document read but not valid JSON for the schema.
    Parse,
    /// No image slots configured.
    NoSlots,
    /// Timezone offset outside UTC-12..=UTC+14.
    TimezoneRange,
}

impl FrameConfig {
    pub fn mode(&self) -> DisplayMode {
        if self.slots.len() > 1 {
            DisplayMode::Carousel
        } else {
            DisplayMode::Single
        }
    }

    pub fn slot_count(&self) -> u8 {
        self.slots.len() as u8
    }

    /// Slot lookup with the index reduced modulo the slot count; a persisted
    /// index may predate a reconfiguration that shrank the list.
    pub fn slot(&self, index: u8) -> &ImageSlot {
        &self.slots[index as usize % self.slots.len()]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots.is_empty() {
            return Err(ConfigError::NoSlots);
        }
        if !(-12..=14).contains(&self.tz_offset_hours) {
            return Err(ConfigError::TimezoneRange);
        }
        Ok(())
    }
}

/// Parse and validate a configuration document.
pub fn parse_config(json: &str) -> Result<FrameConfig, ConfigError> {
    let (config, _) =
        serde_json_core::from_str::<FrameConfig>(json).map_err(|_| ConfigError::Parse)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_document() {
        let json = r#"{
            "slots": [
                {"url": "http://frame.local/a.png", "interval_minutes": 15, "stay": true},
                {"url": "http://frame.local/b.png", "interval_minutes": 0}
            ],
            "change_detection": true,
            "enabled_hours": 16711680,
            "tz_offset_hours": -5
        }"#;

        let config = parse_config(json).unwrap();
        assert_eq!(config.mode(), DisplayMode::Carousel);
        assert_eq!(config.slot_count(), 2);
        assert!(config.slots[0].stay);
        assert!(!config.slots[1].stay);
        assert_eq!(config.slots[1].interval_minutes, 0);
        assert!(config.change_detection);
        assert_eq!(config.tz_offset_hours, -5);
    }

    #[test]
    fn test_parse_applies_defaults() {
        let json = r#"{"slots": [{"url": "http://frame.local/a.png", "interval_minutes": 5}]}"#;

        let config = parse_config(json).unwrap();
        assert_eq!(config.mode(), DisplayMode::Single);
        assert!(!config.change_detection);
        assert_eq!(config.enabled_hours, HOURS_MASK);
        assert_eq!(config.tz_offset_hours, 0);
    }

    #[test]
    fn test_parse_rejects_empty_slots() {
        assert_eq!(parse_config(r#"{"slots": []}"#), Err(ConfigError::NoSlots));
    }

    #[test]
    fn test_parse_rejects_timezone_out_of_range() {
        let json = r#"{"slots": [{"url": "u", "interval_minutes": 5}], "tz_offset_hours": 15}"#;
        assert_eq!(parse_config(json), Err(ConfigError::TimezoneRange));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert_eq!(parse_config("not json"), Err(ConfigError::Parse));
        assert_eq!(parse_config(r#"{"slots": 3}"#), Err(ConfigError::Parse));
    }

    #[test]
    fn test_slot_lookup_wraps_stale_index() {
        let json = r#"{"slots": [
            {"url": "a", "interval_minutes": 1},
            {"url": "b", "interval_minutes": 2},
            {"url": "c", "interval_minutes": 3}
        ]}"#;
        let config = parse_config(json).unwrap();

        assert_eq!(config.slot(1).url.as_str(), "b");
        // Index persisted before the list shrank from e.g. five slots.
        assert_eq!(config.slot(4).url.as_str(), "b");
    }
}
