//! Declarative description of the compositing pipeline, rendered as an
//! ffmpeg `-filter_complex` string.
//!
//! Stream inputs are fixed: `0` is the template video, `1` the looped user
//! photo and `2` the optional border overlay.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CompositeError, Result};
use crate::geometry::{FrameSize, Rect, Transform};
use crate::template::{ChromaKey, HexColor, KeyTarget};

pub const TEMPLATE_INPUT: usize = 0;
pub const PHOTO_INPUT: usize = 1;
pub const BORDER_INPUT: usize = 2;

/// Label of the final video stream, mapped with `-map [vout]`.
pub const OUTPUT_LABEL: &str = "vout";
/// Label of a generated audio stream.
pub const AUDIO_LABEL: &str = "aout";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba,
    Yuv420p,
}

impl PixelFormat {
    pub fn has_alpha(&self) -> bool {
        matches!(self, PixelFormat::Rgba)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Rgba => "rgba",
            PixelFormat::Yuv420p => "yuv420p",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PadColor {
    Transparent,
    /// Padding in the key color, which the following color key removes.
    Key(HexColor),
}

impl fmt::Display for PadColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PadColor::Transparent => f.write_str("black@0"),
            PadColor::Key(color) => f.write_str(&color.to_ffmpeg()),
        }
    }
}

/// One filter inside a chain.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Scale {
        width: u32,
        height: u32,
    },
    Crop {
        rect: Rect,
    },
    Pad {
        size: FrameSize,
        x: u32,
        y: u32,
        color: PadColor,
    },
    Format(PixelFormat),
    ColorKey {
        color: HexColor,
        similarity: f64,
        blend: f64,
    },
    Overlay {
        x: u32,
        y: u32,
        /// End with the main input instead of running on with a looped layer.
        shortest: bool,
    },
    /// Solid color source, endless unless `duration` is set.
    Color {
        color: HexColor,
        size: FrameSize,
        rate: u32,
        duration: Option<f64>,
    },
    /// Text read from a file, horizontally centered.
    DrawText {
        textfile: PathBuf,
        fontfile: Option<PathBuf>,
        size: u32,
        color: HexColor,
        y: u32,
    },
    Fade {
        out: bool,
        start: f64,
        duration: f64,
    },
    /// Endless stereo silence.
    Silence {
        sample_rate: u32,
    },
    AudioTrim {
        duration: f64,
    },
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Scale { width, height } => write!(f, "scale={width}:{height}"),
            Filter::Crop { rect } => write!(f, "crop={}:{}:{}:{}", rect.w, rect.h, rect.x, rect.y),
            Filter::Pad { size, x, y, color } => write!(
                f,
                "pad={}:{}:{x}:{y}:color={color}",
                size.width, size.height
            ),
            Filter::Format(format) => write!(f, "format={}", format.as_str()),
            Filter::ColorKey {
                color,
                similarity,
                blend,
            } => write!(f, "colorkey={}:{similarity}:{blend}", color.to_ffmpeg()),
            Filter::Overlay { x, y, shortest } => {
                write!(f, "overlay={x}:{y}")?;
                if *shortest {
                    f.write_str(":shortest=1")?;
                }
                Ok(())
            }
            Filter::Color {
                color,
                size,
                rate,
                duration,
            } => {
                write!(f, "color=c={}:s={size}:r={rate}", color.to_ffmpeg())?;
                if let Some(d) = duration {
                    write!(f, ":d={d}")?;
                }
                Ok(())
            }
            Filter::DrawText {
                textfile,
                fontfile,
                size,
                color,
                y,
            } => {
                f.write_str("drawtext=")?;
                if let Some(font) = fontfile {
                    write!(f, "fontfile={}:", escape_option(&font.to_string_lossy()))?;
                }
                write!(
                    f,
                    "textfile={}:expansion=none:fontsize={size}:fontcolor={}:x=(w-text_w)/2:y={y}",
                    escape_option(&textfile.to_string_lossy()),
                    color.to_ffmpeg()
                )
            }
            Filter::Fade {
                out,
                start,
                duration,
            } => {
                let kind = if *out { "out" } else { "in" };
                write!(f, "fade=t={kind}:st={start}:d={duration}")
            }
            Filter::Silence { sample_rate } => write!(
                f,
                "anullsrc=channel_layout=stereo:sample_rate={sample_rate}"
            ),
            Filter::AudioTrim { duration } => write!(f, "atrim=duration={duration}"),
        }
    }
}

/// `[in..]filter,filter[out]`
#[derive(Clone, Debug, PartialEq)]
pub struct Chain {
    pub inputs: Vec<String>,
    pub filters: Vec<Filter>,
    pub output: String,
}

impl Chain {
    pub fn new(inputs: &[&str], filters: Vec<Filter>, output: &str) -> Self {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            filters,
            output: output.to_string(),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for input in &self.inputs {
            write!(f, "[{input}]")?;
        }
        let filters: Vec<String> = self.filters.iter().map(ToString::to_string).collect();
        write!(f, "{}[{}]", filters.join(","), self.output)
    }
}

/// Ordered filter chains ending in [`OUTPUT_LABEL`]. Built fresh per render
/// and never mutated after being handed to the renderer.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterGraph {
    chains: Vec<Chain>,
}

impl FilterGraph {
    pub fn new(chains: Vec<Chain>) -> Self {
        Self { chains }
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn output_label(&self) -> &str {
        OUTPUT_LABEL
    }

    /// Number of file inputs the graph reads (highest referenced index + 1).
    pub fn input_count(&self) -> usize {
        self.chains
            .iter()
            .flat_map(|c| c.inputs.iter())
            .filter_map(|label| stream_index(label))
            .map(|i| i + 1)
            .max()
            .unwrap_or(0)
    }

    /// The `-filter_complex` argument.
    pub fn to_filter_complex(&self) -> String {
        self.to_string()
    }

    /// Checks label wiring and that every keyed or transparently padded
    /// stream carries an alpha channel at that point.
    pub fn validate(&self) -> Result<()> {
        // label -> whether the stream carries alpha
        let mut produced: HashMap<&str, bool> = HashMap::new();

        for chain in &self.chains {
            let mut alpha = false;
            for (i, input) in chain.inputs.iter().enumerate() {
                let has_alpha = if stream_index(input).is_some() {
                    false
                } else {
                    *produced.get(input.as_str()).ok_or_else(|| {
                        CompositeError::graph(format!(
                            "label [{input}] is used before it is produced"
                        ))
                    })?
                };
                if i == 0 {
                    alpha = has_alpha;
                }
            }

            for filter in &chain.filters {
                match filter {
                    Filter::Format(format) => alpha = format.has_alpha(),
                    Filter::ColorKey { .. } if !alpha => {
                        return Err(CompositeError::graph(format!(
                            "color key in chain [{}] needs an alpha channel; convert to rgba first",
                            chain.output
                        )));
                    }
                    Filter::Pad {
                        color: PadColor::Transparent,
                        ..
                    } if !alpha => {
                        return Err(CompositeError::graph(format!(
                            "transparent padding in chain [{}] needs an alpha channel",
                            chain.output
                        )));
                    }
                    // overlay defaults to a yuv420 output
                    Filter::Overlay { .. } | Filter::Color { .. } => alpha = false,
                    _ => {}
                }
            }

            if produced.insert(chain.output.as_str(), alpha).is_some() {
                return Err(CompositeError::graph(format!(
                    "label [{}] is produced twice",
                    chain.output
                )));
            }
        }

        if !produced.contains_key(OUTPUT_LABEL) {
            return Err(CompositeError::graph(format!(
                "graph never produces [{OUTPUT_LABEL}]"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chain) in self.chains.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{chain}")?;
        }
        Ok(())
    }
}

/// Escapes a filter option value for use inside `-filter_complex`: first for
/// the option parser, then for the graph parser.
pub fn escape_option(value: &str) -> String {
    fn escape(value: &str, special: &[char]) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            if special.contains(&c) {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }
    let option = escape(value, &['\\', '\'', ':']);
    escape(&option, &['\\', '\'', '[', ']', ',', ';'])
}

fn stream_index(label: &str) -> Option<usize> {
    label.strip_suffix(":v")?.parse().ok()
}

fn stream(index: usize) -> String {
    format!("{index}:v")
}

/// Assembles the compositing graph:
///
/// 1. scale the photo per `transform`
/// 2. crop (cover) or pad (contain) to the placeholder size
/// 3. color key, when enabled
/// 4. overlay onto the template video at the placeholder origin
/// 5. overlay the border, when present, over the whole frame
///
/// With [`KeyTarget::Template`] the key is applied to the template video
/// instead, and the photo is laid beneath it on a black canvas of `frame` size.
pub fn build(
    transform: &Transform,
    chroma: Option<&ChromaKey>,
    placeholder: &Rect,
    border: Option<&Path>,
    frame: FrameSize,
    fps: u32,
) -> Result<FilterGraph> {
    if transform.target != placeholder.size() {
        return Err(CompositeError::graph(format!(
            "transform targets {} but placeholder is {}",
            transform.target,
            placeholder.size()
        )));
    }
    if let Some(crop) = transform.crop
        && (crop.x + crop.w > transform.scaled.width || crop.y + crop.h > transform.scaled.height)
    {
        return Err(CompositeError::graph(format!(
            "crop {crop:?} exceeds scaled image {}",
            transform.scaled
        )));
    }

    let key = chroma.filter(|c| c.is_enabled());
    let photo_key = key.filter(|c| c.target == KeyTarget::Photo);
    let template_key = key.filter(|c| c.target == KeyTarget::Template);

    let mut chains = Vec::new();

    let mut photo = vec![Filter::Scale {
        width: transform.scaled.width,
        height: transform.scaled.height,
    }];
    match transform.crop {
        Some(rect) => {
            photo.push(Filter::Crop { rect });
            photo.push(Filter::Format(PixelFormat::Rgba));
        }
        None => {
            photo.push(Filter::Format(PixelFormat::Rgba));
            photo.push(Filter::Pad {
                size: placeholder.size(),
                x: transform.offset_x,
                y: transform.offset_y,
                color: match photo_key {
                    Some(k) => PadColor::Key(k.color),
                    None => PadColor::Transparent,
                },
            });
        }
    }
    if let Some(k) = photo_key {
        photo.push(color_key(k));
    }
    chains.push(Chain::new(&[stream(PHOTO_INPUT).as_str()], photo, "photo"));

    match template_key {
        None => {
            chains.push(Chain::new(
                &[stream(TEMPLATE_INPUT).as_str(), "photo"],
                vec![Filter::Overlay {
                    x: placeholder.x,
                    y: placeholder.y,
                    shortest: true,
                }],
                "comp",
            ));
        }
        Some(k) => {
            let canvas = Filter::Color {
                color: HexColor([0, 0, 0]),
                size: frame,
                rate: fps,
                duration: None,
            };
            chains.push(Chain::new(&[], vec![canvas], "base"));
            chains.push(Chain::new(
                &["base", "photo"],
                vec![Filter::Overlay {
                    x: placeholder.x,
                    y: placeholder.y,
                    shortest: false,
                }],
                "bg",
            ));
            chains.push(Chain::new(
                &[stream(TEMPLATE_INPUT).as_str()],
                vec![Filter::Format(PixelFormat::Rgba), color_key(k)],
                "fg",
            ));
            chains.push(Chain::new(
                &["bg", "fg"],
                vec![Filter::Overlay {
                    x: 0,
                    y: 0,
                    shortest: true,
                }],
                "comp",
            ));
        }
    }

    let mut last = "comp";
    if border.is_some() {
        chains.push(Chain::new(
            &[last, stream(BORDER_INPUT).as_str()],
            vec![Filter::Overlay {
                x: 0,
                y: 0,
                shortest: false,
            }],
            "framed",
        ));
        last = "framed";
    }
    chains.push(Chain::new(
        &[last],
        vec![Filter::Format(PixelFormat::Yuv420p)],
        OUTPUT_LABEL,
    ));

    let graph = FilterGraph::new(chains);
    graph.validate()?;
    log::debug!("Filter graph: {graph}");
    Ok(graph)
}

fn color_key(key: &ChromaKey) -> Filter {
    Filter::ColorKey {
        color: key.color,
        similarity: key.similarity,
        blend: key.blend,
    }
}
