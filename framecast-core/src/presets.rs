use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// x264 speed/quality presets, fastest first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderPreset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    #[default]
    Medium,
    Slow,
    Slower,
    Veryslow,
    Placebo,
}

impl EncoderPreset {
    pub const ALL: [EncoderPreset; 10] = [
        EncoderPreset::Ultrafast,
        EncoderPreset::Superfast,
        EncoderPreset::Veryfast,
        EncoderPreset::Faster,
        EncoderPreset::Fast,
        EncoderPreset::Medium,
        EncoderPreset::Slow,
        EncoderPreset::Slower,
        EncoderPreset::Veryslow,
        EncoderPreset::Placebo,
    ];

    /// Name passed to `-preset`
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderPreset::Ultrafast => "ultrafast",
            EncoderPreset::Superfast => "superfast",
            EncoderPreset::Veryfast => "veryfast",
            EncoderPreset::Faster => "faster",
            EncoderPreset::Fast => "fast",
            EncoderPreset::Medium => "medium",
            EncoderPreset::Slow => "slow",
            EncoderPreset::Slower => "slower",
            EncoderPreset::Veryslow => "veryslow",
            EncoderPreset::Placebo => "placebo",
        }
    }

    /// Get preset from string name
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }

    /// Get description of the preset
    pub fn description(&self) -> &'static str {
        match self {
            EncoderPreset::Ultrafast => "Fastest encode, largest files",
            EncoderPreset::Superfast => "Very fast encode for quick previews",
            EncoderPreset::Veryfast => "Fast encode, noticeably larger files",
            EncoderPreset::Faster => "Faster than default with small size cost",
            EncoderPreset::Fast => "Slightly faster than default",
            EncoderPreset::Medium => "Balanced default",
            EncoderPreset::Slow => "Better compression, slower encode",
            EncoderPreset::Slower => "High compression for final deliveries",
            EncoderPreset::Veryslow => "Near-best compression, very slow",
            EncoderPreset::Placebo => "Marginal gains over veryslow at huge cost",
        }
    }

    /// List all available presets
    pub fn list_all() -> Vec<(&'static str, &'static str)> {
        Self::ALL
            .iter()
            .map(|p| (p.as_str(), p.description()))
            .collect()
    }
}

impl fmt::Display for EncoderPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncoderPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| {
            format!(
                "unknown preset `{s}` (expected one of: {})",
                Self::ALL.map(|p| p.as_str()).join(", ")
            )
        })
    }
}
