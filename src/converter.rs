//! Microwave wattage/time conversion.
//!
//! The heating energy `watts × seconds` is kept constant between the source
//! and the target oven.

use serde::{Deserialize, Serialize};

pub const MIN_WATTAGE: i64 = 100;
pub const MAX_WATTAGE: i64 = 1500;
pub const MAX_MINUTES: i64 = 60;
pub const MAX_SECONDS: i64 = 59;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookTime {
    pub minutes: i64,
    pub seconds: i64,
}

impl CookTime {
    pub fn from_total_seconds(total: i64) -> Self {
        Self {
            minutes: total / 60,
            seconds: total % 60,
        }
    }

    pub fn total_seconds(&self) -> i64 {
        self.minutes * 60 + self.seconds
    }
}

impl std::fmt::Display for CookTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}m{:02}s", self.minutes, self.seconds)
    }
}

/// Last values entered into the converter, restored on the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterInputs {
    #[serde(default = "default_source_watts")]
    pub source_watts: i64,
    #[serde(default = "default_minutes")]
    pub minutes: i64,
    #[serde(default)]
    pub seconds: i64,
    #[serde(default = "default_target_watts")]
    pub target_watts: i64,
    #[serde(default = "default_locale")]
    pub locale: String,
}

fn default_source_watts() -> i64 {
    500
}

fn default_minutes() -> i64 {
    1
}

fn default_target_watts() -> i64 {
    600
}

fn default_locale() -> String {
    "ja".to_string()
}

impl Default for ConverterInputs {
    fn default() -> Self {
        Self {
            source_watts: default_source_watts(),
            minutes: default_minutes(),
            seconds: 0,
            target_watts: default_target_watts(),
            locale: default_locale(),
        }
    }
}

impl ConverterInputs {
    /// Parse raw text fields, keeping the current value for any field that
    /// does not parse, then clamp everything into range.
    pub fn with_text(&self, source_watts: &str, minutes: &str, seconds: &str, target_watts: &str) -> Self {
        Self {
            source_watts: clamp_wattage(parse_or(source_watts, self.source_watts)),
            minutes: clamp_minutes(parse_or(minutes, self.minutes)),
            seconds: clamp_seconds(parse_or(seconds, self.seconds)),
            target_watts: clamp_wattage(parse_or(target_watts, self.target_watts)),
            locale: self.locale.clone(),
        }
    }

    pub fn convert(&self) -> CookTime {
        convert(self.source_watts, self.minutes, self.seconds, self.target_watts)
    }
}

pub fn clamp_wattage(watts: i64) -> i64 {
    watts.clamp(MIN_WATTAGE, MAX_WATTAGE)
}

pub fn clamp_minutes(minutes: i64) -> i64 {
    minutes.clamp(0, MAX_MINUTES)
}

pub fn clamp_seconds(seconds: i64) -> i64 {
    seconds.clamp(0, MAX_SECONDS)
}

pub fn parse_or(text: &str, default: i64) -> i64 {
    text.trim().parse().unwrap_or(default)
}

/// Convert a cooking time between wattages. Inputs are clamped first.
pub fn convert(source_watts: i64, minutes: i64, seconds: i64, target_watts: i64) -> CookTime {
    convert_unclamped(
        clamp_wattage(source_watts),
        clamp_minutes(minutes),
        clamp_seconds(seconds),
        clamp_wattage(target_watts),
    )
}

/// Same as [`convert`] without clamping. A non-positive target yields 0m00s.
pub fn convert_unclamped(source_watts: i64, minutes: i64, seconds: i64, target_watts: i64) -> CookTime {
    if target_watts <= 0 {
        return CookTime { minutes: 0, seconds: 0 };
    }
    let energy = (source_watts * (minutes * 60 + seconds)) as f64;
    let target_seconds = (energy / target_watts as f64).round() as i64;
    CookTime::from_total_seconds(target_seconds)
}
