//! Mapping a photo of arbitrary size onto the placeholder rectangle.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CompositeError, Result};

/// Width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.w, self.h)
    }

    /// Whether the rectangle lies entirely inside a frame of `frame` size.
    pub fn fits_within(&self, frame: FrameSize) -> bool {
        u64::from(self.x) + u64::from(self.w) <= u64::from(frame.width)
            && u64::from(self.y) + u64::from(self.h) <= u64::from(frame.height)
    }
}

/// Policy for mapping the photo's aspect ratio onto the placeholder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Fill the placeholder, center-cropping the overflow.
    #[default]
    Cover,
    /// Fit inside the placeholder; uncovered area shows the layer beneath.
    Contain,
}

impl FitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FitMode::Cover => "cover",
            FitMode::Contain => "contain",
        }
    }
}

impl FromStr for FitMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cover" => Ok(FitMode::Cover),
            "contain" => Ok(FitMode::Contain),
            other => Err(format!("expected `cover` or `contain`, got `{other}`")),
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the source image maps onto the placeholder.
///
/// The image is first scaled to `scaled`; in cover mode `crop` selects the
/// placeholder-sized window of the scaled image, in contain mode the scaled
/// image sits at `offset_*` inside the placeholder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub scale_x: f64,
    pub scale_y: f64,
    pub scaled: FrameSize,
    pub offset_x: u32,
    pub offset_y: u32,
    pub crop: Option<Rect>,
    pub target: FrameSize,
}

impl Transform {
    /// Size of the visible photo inside the placeholder.
    pub fn visible_size(&self) -> FrameSize {
        match self.crop {
            Some(crop) => crop.size(),
            None => self.scaled,
        }
    }

    /// Whether the photo covers every pixel of the placeholder.
    pub fn fills_target(&self) -> bool {
        self.visible_size() == self.target && self.offset_x == 0 && self.offset_y == 0
    }
}

/// Computes the scale/crop (cover) or scale/pad (contain) transform.
pub fn resolve(
    image_width: u32,
    image_height: u32,
    placeholder: &Rect,
    fit: FitMode,
) -> Result<Transform> {
    if image_width == 0 || image_height == 0 {
        return Err(CompositeError::invalid_image(format!(
            "degenerate image size {image_width}x{image_height}"
        )));
    }
    if placeholder.w == 0 || placeholder.h == 0 {
        return Err(CompositeError::validation(
            "placeholder",
            format!("w and h must be positive, got {}x{}", placeholder.w, placeholder.h),
        ));
    }

    let (iw, ih) = (f64::from(image_width), f64::from(image_height));
    let (pw, ph) = (f64::from(placeholder.w), f64::from(placeholder.h));
    let ratio_w = pw / iw;
    let ratio_h = ph / ih;
    let target = placeholder.size();

    let transform = match fit {
        FitMode::Cover => {
            let scale = ratio_w.max(ratio_h);
            // Never smaller than the placeholder, whatever the rounding did.
            let scaled = FrameSize::new(
                scaled_dim(iw, scale).max(placeholder.w),
                scaled_dim(ih, scale).max(placeholder.h),
            );
            let crop = Rect::new(
                centered(scaled.width, placeholder.w),
                centered(scaled.height, placeholder.h),
                placeholder.w,
                placeholder.h,
            );
            Transform {
                scale_x: scale,
                scale_y: scale,
                scaled,
                offset_x: 0,
                offset_y: 0,
                crop: Some(crop),
                target,
            }
        }
        FitMode::Contain => {
            let scale = ratio_w.min(ratio_h);
            let scaled = FrameSize::new(
                scaled_dim(iw, scale).min(placeholder.w),
                scaled_dim(ih, scale).min(placeholder.h),
            );
            Transform {
                scale_x: scale,
                scale_y: scale,
                scaled,
                offset_x: centered(placeholder.w, scaled.width),
                offset_y: centered(placeholder.h, scaled.height),
                crop: None,
                target,
            }
        }
    };

    log::debug!(
        "{fit} {image_width}x{image_height} -> {} (scale {:.4}), crop {:?}, offset {}:{}",
        transform.scaled,
        transform.scale_x,
        transform.crop,
        transform.offset_x,
        transform.offset_y
    );

    Ok(transform)
}

fn scaled_dim(dim: f64, scale: f64) -> u32 {
    ((dim * scale).round() as u32).max(1)
}

/// Offset that centers `inner` inside `outer`, rounded then clamped.
fn centered(outer: u32, inner: u32) -> u32 {
    let slack = outer.saturating_sub(inner);
    let offset = (f64::from(slack) / 2.0).round() as u32;
    offset.min(slack)
}
