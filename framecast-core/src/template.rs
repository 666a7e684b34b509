//! Template folders and their `template.json` descriptor.
//!
//! A template folder holds the descriptor, the template video and an
//! optional border overlay:
//!
//! ```text
//! templates/birthday/
//!   template.json
//!   template.mp4
//!   border.png
//! ```
//!
//! [`TemplateDescriptor::load`] parses the descriptor, fills in defaults,
//! resolves asset paths to absolute paths and validates every field once.
//! Nothing downstream re-checks the descriptor.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CompositeError, Result};
use crate::geometry::{FitMode, FrameSize, Rect};
use crate::presets::EncoderPreset;

pub const DESCRIPTOR_FILE: &str = "template.json";
pub const DEFAULT_TEMPLATE_VIDEO: &str = "template.mp4";

pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_CRF: u8 = 18;
pub const MAX_CRF: u8 = 51;
pub const DEFAULT_KEY_COLOR: &str = "3ec954";
pub const DEFAULT_SIMILARITY: f64 = 0.2;
pub const DEFAULT_BLEND: f64 = 0.0;

/// `template.json` as written on disk. Every field is optional here;
/// defaults and range checks are applied by [`TemplateDescriptor::from_config`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_video: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub border_png: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<PlaceholderConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chroma: Option<ChromaConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderConfig {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromaConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blend: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

/// 24-bit RGB key color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HexColor(pub [u8; 3]);

impl HexColor {
    /// `0xRRGGBB`, the form ffmpeg's color options accept.
    pub fn to_ffmpeg(&self) -> String {
        format!("0x{self}")
    }
}

impl FromStr for HexColor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s.trim();
        let digits = digits.strip_prefix('#').unwrap_or(digits);
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("expected a 6-digit RGB hex value, got `{s}`"));
        }
        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16);
        match (channel(0), channel(2), channel(4)) {
            (Ok(r), Ok(g), Ok(b)) => Ok(HexColor([r, g, b])),
            _ => Err(format!("expected a 6-digit RGB hex value, got `{s}`")),
        }
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "{r:02x}{g:02x}{b:02x}")
    }
}

/// Which layer the chroma key is applied to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum KeyTarget {
    /// Key the user photo, then lay it over the template video.
    #[default]
    Photo,
    /// Key the template video and let the photo show through from beneath.
    Template,
}

impl KeyTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyTarget::Photo => "photo",
            KeyTarget::Template => "template",
        }
    }
}

impl FromStr for KeyTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "photo" | "image" => Ok(KeyTarget::Photo),
            "template" | "video" => Ok(KeyTarget::Template),
            other => Err(format!("expected `photo` or `template`, got `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChromaKey {
    pub color: HexColor,
    /// Color distance in `[0, 1]` under which pixels become transparent.
    pub similarity: f64,
    /// Width of the soft edge band in `[0, 1]`; 0 is a hard mask.
    pub blend: f64,
    pub target: KeyTarget,
}

impl ChromaKey {
    pub fn is_enabled(&self) -> bool {
        self.similarity > 0.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputSettings {
    pub fps: u32,
    pub crf: u8,
    pub preset: EncoderPreset,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            crf: DEFAULT_CRF,
            preset: EncoderPreset::default(),
        }
    }
}

impl OutputSettings {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(CompositeError::validation("output.fps", "must be positive"));
        }
        if self.crf > MAX_CRF {
            return Err(CompositeError::validation(
                "output.crf",
                format!("must be within 0..={MAX_CRF}, got {}", self.crf),
            ));
        }
        Ok(())
    }
}

/// Validated template. Immutable once loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateDescriptor {
    pub template_video: PathBuf,
    pub border_image: Option<PathBuf>,
    pub placeholder: Rect,
    /// `None` when the descriptor has no `chroma` block.
    pub chroma: Option<ChromaKey>,
    pub fit: FitMode,
    pub output: OutputSettings,
}

impl TemplateDescriptor {
    /// Loads a descriptor from a template folder or a `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let descriptor_path = resolve_template_path(path.as_ref())?;
        let text = fs::read_to_string(&descriptor_path).map_err(|e| {
            CompositeError::validation(
                "template",
                format!("cannot read {}: {e}", descriptor_path.display()),
            )
        })?;
        let config: TemplateConfig = serde_json::from_str(&text).map_err(|e| {
            CompositeError::validation(
                "template",
                format!("{} is not a valid descriptor: {e}", descriptor_path.display()),
            )
        })?;

        let base_dir = descriptor_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let descriptor = Self::from_config(&config, &base_dir)?;
        log::debug!(
            "Loaded template {}: placeholder {:?}, fit {}, chroma {:?}",
            descriptor_path.display(),
            descriptor.placeholder,
            descriptor.fit,
            descriptor.chroma
        );
        Ok(descriptor)
    }

    /// Applies defaults and validates a raw record. Relative asset paths are
    /// resolved against `base_dir`.
    pub fn from_config(config: &TemplateConfig, base_dir: &Path) -> Result<Self> {
        let video_name = config
            .template_video
            .as_deref()
            .unwrap_or(DEFAULT_TEMPLATE_VIDEO);
        let template_video = absolute(base_dir, video_name)?;
        if !template_video.is_file() {
            return Err(CompositeError::validation(
                "template_video",
                format!("file not found: {}", template_video.display()),
            ));
        }

        let border_image = match config.border_png.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => {
                let path = absolute(base_dir, name)?;
                if path.is_file() {
                    Some(path)
                } else {
                    log::warn!(
                        "border_png configured but missing, ignoring: {}",
                        path.display()
                    );
                    None
                }
            }
            None => None,
        };

        let placeholder = parse_placeholder(config.placeholder)?;

        let fit = match config.fit.as_deref() {
            Some(fit) => fit
                .parse::<FitMode>()
                .map_err(|e| CompositeError::validation("fit", e))?,
            None => FitMode::default(),
        };

        let chroma = config.chroma.as_ref().map(parse_chroma).transpose()?;
        let output = parse_output(config.output.as_ref())?;

        Ok(Self {
            template_video,
            border_image,
            placeholder,
            chroma,
            fit,
            output,
        })
    }

    /// Serializes every field explicitly, with absolute asset paths.
    pub fn to_config(&self) -> TemplateConfig {
        TemplateConfig {
            template_video: Some(self.template_video.display().to_string()),
            border_png: self.border_image.as_ref().map(|p| p.display().to_string()),
            placeholder: Some(PlaceholderConfig {
                x: i64::from(self.placeholder.x),
                y: i64::from(self.placeholder.y),
                w: i64::from(self.placeholder.w),
                h: i64::from(self.placeholder.h),
            }),
            chroma: self.chroma.map(|c| ChromaConfig {
                hex: Some(c.color.to_string()),
                similarity: Some(c.similarity),
                blend: Some(c.blend),
                target: Some(c.target.as_str().to_string()),
            }),
            fit: Some(self.fit.as_str().to_string()),
            output: Some(OutputConfig {
                fps: Some(i64::from(self.output.fps)),
                crf: Some(i64::from(self.output.crf)),
                preset: Some(self.output.preset.as_str().to_string()),
            }),
        }
    }

    /// Writes the descriptor as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.to_config())
            .map_err(|e| CompositeError::validation("template", e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Replaces the encode settings, e.g. with command-line overrides.
    pub fn with_output(mut self, output: OutputSettings) -> Result<Self> {
        output.validate()?;
        self.output = output;
        Ok(self)
    }

    /// Rejects placeholders that extend past the template frame.
    pub fn check_frame(&self, frame: FrameSize) -> Result<()> {
        if !self.placeholder.fits_within(frame) {
            let p = self.placeholder;
            return Err(CompositeError::validation(
                "placeholder",
                format!(
                    "rectangle {}x{} at {},{} exceeds template frame {frame}",
                    p.w, p.h, p.x, p.y
                ),
            ));
        }
        Ok(())
    }

    /// Chroma key settings if keying is active.
    pub fn active_key(&self) -> Option<&ChromaKey> {
        self.chroma.as_ref().filter(|c| c.is_enabled())
    }
}

/// A template folder resolves to its `template.json`; any other path is
/// taken as the descriptor itself.
pub fn resolve_template_path(path: &Path) -> Result<PathBuf> {
    let candidate = if path.is_dir() {
        path.join(DESCRIPTOR_FILE)
    } else {
        path.to_path_buf()
    };
    if !candidate.is_file() {
        return Err(CompositeError::validation(
            "template",
            format!("{} not found", candidate.display()),
        ));
    }
    Ok(candidate)
}

/// Names of the sub-directories of `dir` that contain a `template.json`.
pub fn list_templates(dir: impl AsRef<Path>) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && path.join(DESCRIPTOR_FILE).is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn absolute(base_dir: &Path, name: &str) -> Result<PathBuf> {
    let joined = base_dir.join(name);
    if joined.is_absolute() {
        Ok(joined)
    } else {
        Ok(std::env::current_dir()?.join(joined))
    }
}

fn parse_placeholder(config: Option<PlaceholderConfig>) -> Result<Rect> {
    let Some(p) = config else {
        return Err(CompositeError::validation("placeholder", "missing"));
    };
    if p.w <= 0 || p.h <= 0 {
        return Err(CompositeError::validation(
            "placeholder",
            format!("w and h must be positive, got {}x{}", p.w, p.h),
        ));
    }
    if p.x < 0 || p.y < 0 {
        return Err(CompositeError::validation(
            "placeholder",
            format!("x and y must not be negative, got {},{}", p.x, p.y),
        ));
    }
    let to_u32 = |v: i64| {
        u32::try_from(v)
            .map_err(|_| CompositeError::validation("placeholder", format!("{v} is too large")))
    };
    Ok(Rect::new(to_u32(p.x)?, to_u32(p.y)?, to_u32(p.w)?, to_u32(p.h)?))
}

fn parse_chroma(config: &ChromaConfig) -> Result<ChromaKey> {
    let color = config
        .hex
        .as_deref()
        .unwrap_or(DEFAULT_KEY_COLOR)
        .parse::<HexColor>()
        .map_err(|e| CompositeError::validation("chroma.hex", e))?;
    let similarity = unit_interval(
        "chroma.similarity",
        config.similarity.unwrap_or(DEFAULT_SIMILARITY),
    )?;
    let blend = unit_interval("chroma.blend", config.blend.unwrap_or(DEFAULT_BLEND))?;
    let target = match config.target.as_deref() {
        Some(t) => t
            .parse::<KeyTarget>()
            .map_err(|e| CompositeError::validation("chroma.target", e))?,
        None => KeyTarget::default(),
    };
    Ok(ChromaKey {
        color,
        similarity,
        blend,
        target,
    })
}

fn unit_interval(field: &str, value: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&value) {
        return Err(CompositeError::validation(
            field,
            format!("must be within [0, 1], got {value}"),
        ));
    }
    Ok(value)
}

fn parse_output(config: Option<&OutputConfig>) -> Result<OutputSettings> {
    let defaults = OutputSettings::default();
    let Some(config) = config else {
        return Ok(defaults);
    };

    let fps = match config.fps {
        Some(fps) if fps <= 0 => {
            return Err(CompositeError::validation(
                "output.fps",
                format!("must be positive, got {fps}"),
            ));
        }
        Some(fps) => u32::try_from(fps)
            .map_err(|_| CompositeError::validation("output.fps", format!("{fps} is too large")))?,
        None => defaults.fps,
    };
    let crf = match config.crf {
        Some(crf) if !(0..=i64::from(MAX_CRF)).contains(&crf) => {
            return Err(CompositeError::validation(
                "output.crf",
                format!("must be within 0..={MAX_CRF}, got {crf}"),
            ));
        }
        Some(crf) => crf as u8,
        None => defaults.crf,
    };
    let preset = match config.preset.as_deref() {
        Some(name) => name
            .parse::<EncoderPreset>()
            .map_err(|e| CompositeError::validation("output.preset", e))?,
        None => defaults.preset,
    };

    let settings = OutputSettings { fps, crf, preset };
    settings.validate()?;
    Ok(settings)
}
