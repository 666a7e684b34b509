//! Intro and outro title cards, and joining them around the main render.
//!
//! Cards are generated entirely by ffmpeg (a `color` source with `drawtext`
//! lines and fades) at the template's frame size and output rate, with a
//! silent stereo track so the parts can be joined by the concat demuxer
//! without re-encoding.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CompositeError, Result};
use crate::filter_graph::{AUDIO_LABEL, Chain, Filter, FilterGraph, OUTPUT_LABEL, PixelFormat};
use crate::geometry::FrameSize;
use crate::render::{
    Assembler, ConcatJob, OutputGuard, RenderMonitor, TitleCardJob, ensure_parent_dir,
};
use crate::template::{HexColor, OutputSettings};

pub const INTRO_SECONDS: f64 = 4.0;
pub const OUTRO_SECONDS: f64 = 3.0;
/// Sample rate of the silent track on title cards.
pub const CARD_SAMPLE_RATE: u32 = 48_000;

const FADE_SECONDS: f64 = 0.6;
const BACKGROUND: HexColor = HexColor([0x1a, 0x1a, 0x2e]);
const GOLD: HexColor = HexColor([0xff, 0xd7, 0x00]);
const WHITE: HexColor = HexColor([0xff, 0xff, 0xff]);
const PINK: HexColor = HexColor([0xff, 0xb6, 0xc1]);
/// Baseline-to-baseline distance as a multiple of the font size.
const LINE_SPACING: f64 = 1.3;

#[cfg(target_os = "macos")]
const FONT_CANDIDATES: &[&str] = &[
    "/System/Library/Fonts/Supplemental/Arial Black.ttf",
    "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
    "/System/Library/Fonts/Supplemental/Impact.ttf",
    "/Library/Fonts/Arial.ttf",
];
#[cfg(target_os = "windows")]
const FONT_CANDIDATES: &[&str] = &[
    "C:/Windows/Fonts/impact.ttf",
    "C:/Windows/Fonts/arialbd.ttf",
    "C:/Windows/Fonts/ariblk.ttf",
    "C:/Windows/Fonts/arial.ttf",
];
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
];

/// First bold system font found, or `None` to let ffmpeg pick its default.
pub fn find_font() -> Option<PathBuf> {
    let font = FONT_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file());
    match &font {
        Some(path) => log::debug!("Title font: {}", path.display()),
        None => log::warn!("No bold system font found, using ffmpeg's default font"),
    }
    font
}

#[derive(Debug, Clone, PartialEq)]
pub struct TitleLine {
    pub text: String,
    /// Font size as a fraction of the frame's shorter side.
    pub scale: f64,
    pub color: HexColor,
}

impl TitleLine {
    fn new(text: impl Into<String>, scale: f64, color: HexColor) -> Self {
        Self {
            text: text.into(),
            scale,
            color,
        }
    }
}

/// A solid background with centered text lines, faded in and out.
#[derive(Debug, Clone, PartialEq)]
pub struct TitleCard {
    /// File stem for the card's clip and text files.
    pub name: &'static str,
    pub lines: Vec<TitleLine>,
    pub duration: f64,
}

/// Greeting shown before and after the main render.
#[derive(Debug, Clone)]
pub struct Bookends {
    customer_name: String,
    sender: Option<String>,
}

impl Bookends {
    pub fn new(customer_name: impl Into<String>) -> Result<Self> {
        let customer_name = customer_name.into().trim().to_string();
        if customer_name.is_empty() {
            return Err(CompositeError::validation(
                "customer_name",
                "must not be empty",
            ));
        }
        Ok(Self {
            customer_name,
            sender: None,
        })
    }

    /// Signs the cards with `sender`; blank text is ignored.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        let sender = sender.into().trim().to_string();
        self.sender = (!sender.is_empty()).then_some(sender);
        self
    }

    pub fn customer_name(&self) -> &str {
        &self.customer_name
    }

    pub fn intro(&self) -> TitleCard {
        let mut lines = vec![
            TitleLine::new("Happy Birthday", 0.10, GOLD),
            TitleLine::new(self.customer_name.clone(), 0.12, WHITE),
        ];
        if let Some(sender) = &self.sender {
            lines.push(TitleLine::new("from", 0.06, PINK));
            lines.push(TitleLine::new(sender.clone(), 0.08, GOLD));
        }
        TitleCard {
            name: "intro",
            lines,
            duration: INTRO_SECONDS,
        }
    }

    /// The sender's name, or a plain fading card when there is none.
    pub fn outro(&self) -> TitleCard {
        let lines = self
            .sender
            .iter()
            .map(|sender| TitleLine::new(sender.clone(), 0.10, GOLD))
            .collect();
        TitleCard {
            name: "outro",
            lines,
            duration: OUTRO_SECONDS,
        }
    }
}

/// Font size and top edge of each line, with the block centered vertically.
fn layout(lines: &[TitleLine], frame: FrameSize) -> Vec<(u32, u32)> {
    let base = f64::from(frame.width.min(frame.height));
    let sizes: Vec<u32> = lines
        .iter()
        .map(|line| ((base * line.scale).round() as u32).max(1))
        .collect();
    let block: f64 = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let size = f64::from(size);
            if i + 1 < sizes.len() {
                size * LINE_SPACING
            } else {
                size
            }
        })
        .sum();

    let mut y = ((f64::from(frame.height) - block) / 2.0).max(0.0);
    sizes
        .into_iter()
        .map(|size| {
            let top = y.round() as u32;
            y += f64::from(size) * LINE_SPACING;
            (size, top)
        })
        .collect()
}

/// Builds the graph for `card`: video on [vout], silence on [aout].
///
/// `text_files[i]` must hold the text of `card.lines[i]`; drawtext reads
/// text from files so names never need escaping.
pub fn title_card_graph(
    card: &TitleCard,
    text_files: &[PathBuf],
    font: Option<&Path>,
    frame: FrameSize,
    fps: u32,
) -> Result<FilterGraph> {
    if text_files.len() != card.lines.len() {
        return Err(CompositeError::graph(format!(
            "{} card has {} lines but {} text files",
            card.name,
            card.lines.len(),
            text_files.len()
        )));
    }
    if !card.duration.is_finite() || card.duration <= 0.0 {
        return Err(CompositeError::graph(format!(
            "{} card needs a positive duration",
            card.name
        )));
    }

    let mut video = vec![Filter::Color {
        color: BACKGROUND,
        size: frame,
        rate: fps,
        duration: Some(card.duration),
    }];
    for ((line, file), (size, y)) in card
        .lines
        .iter()
        .zip(text_files)
        .zip(layout(&card.lines, frame))
    {
        video.push(Filter::DrawText {
            textfile: file.clone(),
            fontfile: font.map(Path::to_path_buf),
            size,
            color: line.color,
            y,
        });
    }
    let fade = FADE_SECONDS.min(card.duration / 4.0);
    video.push(Filter::Fade {
        out: false,
        start: 0.0,
        duration: fade,
    });
    video.push(Filter::Fade {
        out: true,
        start: card.duration - fade,
        duration: fade,
    });
    video.push(Filter::Format(PixelFormat::Yuv420p));

    let audio = vec![
        Filter::Silence {
            sample_rate: CARD_SAMPLE_RATE,
        },
        Filter::AudioTrim {
            duration: card.duration,
        },
    ];

    let graph = FilterGraph::new(vec![
        Chain::new(&[], video, OUTPUT_LABEL),
        Chain::new(&[], audio, AUDIO_LABEL),
    ]);
    graph.validate()?;
    Ok(graph)
}

/// Concat demuxer list naming `parts` in order.
pub fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|part| {
            let path = part.to_string_lossy().replace('\'', r"'\''");
            format!("file '{path}'\n")
        })
        .collect()
}

/// Writes title cards and joins clips inside a scratch directory.
pub struct Sequencer<'a, A> {
    assembler: &'a A,
    work_dir: &'a Path,
    frame: FrameSize,
    settings: &'a OutputSettings,
    font: Option<PathBuf>,
}

impl<'a, A: Assembler> Sequencer<'a, A> {
    pub fn new(
        assembler: &'a A,
        work_dir: &'a Path,
        frame: FrameSize,
        settings: &'a OutputSettings,
    ) -> Self {
        Self {
            assembler,
            work_dir,
            frame,
            settings,
            font: find_font(),
        }
    }

    pub fn with_font(mut self, font: Option<PathBuf>) -> Self {
        self.font = font;
        self
    }

    /// Renders `card` to `<work_dir>/<name>.mp4`.
    pub fn title_card(&self, card: &TitleCard, monitor: &RenderMonitor) -> Result<PathBuf> {
        let mut text_files = Vec::with_capacity(card.lines.len());
        for (i, line) in card.lines.iter().enumerate() {
            let path = self.work_dir.join(format!("{}-{i}.txt", card.name));
            fs::write(&path, &line.text)?;
            text_files.push(path);
        }
        let graph = title_card_graph(
            card,
            &text_files,
            self.font.as_deref(),
            self.frame,
            self.settings.fps,
        )?;
        if monitor.is_cancelled() {
            return Err(CompositeError::Cancelled);
        }

        let destination = self.work_dir.join(format!("{}.mp4", card.name));
        let job = TitleCardJob {
            graph: &graph,
            settings: self.settings,
            destination: &destination,
        };
        log::info!("Rendering {} card ({}s)", card.name, card.duration);
        OutputGuard::new(&destination).finish(self.assembler.title_card(&job, monitor))?;
        monitor.report(100.0);
        Ok(destination)
    }

    /// Joins `parts` into `destination`, removing it again on failure.
    pub fn concat(
        &self,
        parts: &[PathBuf],
        destination: &Path,
        monitor: &RenderMonitor,
    ) -> Result<PathBuf> {
        let list = self.work_dir.join("parts.txt");
        fs::write(&list, concat_list(parts))?;
        if monitor.is_cancelled() {
            return Err(CompositeError::Cancelled);
        }
        ensure_parent_dir(destination)?;

        let job = ConcatJob {
            list: &list,
            destination,
        };
        log::info!("Joining {} parts into {}", parts.len(), destination.display());
        OutputGuard::new(destination).finish(self.assembler.concat(&job, monitor))?;
        monitor.report(100.0);
        Ok(destination.to_path_buf())
    }
}
