//! Framecast Core - composite a photo into a video template using the FFmpeg CLI
//!
//! A template is a video with a placeholder rectangle, optional chroma key
//! settings and an optional full-frame border overlay. Rendering:
//! - loads and validates the template descriptor once
//! - resolves how the photo maps onto the placeholder (cover or contain)
//! - builds a declarative filter graph (scale, crop/pad, color key, overlays)
//! - hands the graph to ffmpeg and classifies the outcome
//! - optionally wraps the result in intro and outro title cards
//!
//! Geometry and graph construction are pure; only the [`render::Backend`]
//! touches processes.

pub mod compositor;
pub mod error;
pub mod ffmpeg_wrapper;
pub mod filter_graph;
pub mod geometry;
pub mod output;
pub mod presets;
pub mod render;
pub mod sequence;
pub mod template;

// Re-export commonly used types at the crate root
pub use compositor::{Compositor, RenderPlan, RenderRequest};
pub use error::{CompositeError, Result};
pub use ffmpeg_wrapper::{FfmpegBackend, FfmpegCommand, check_ffmpeg};
pub use filter_graph::FilterGraph;
pub use geometry::{FitMode, FrameSize, Rect, Transform};
pub use output::OutputManager;
pub use presets::EncoderPreset;
pub use render::{
    Assembler, Backend, CancelToken, MediaProbe, RenderInputs, RenderMonitor, Renderer,
};
pub use sequence::{Bookends, TitleCard};
pub use template::{ChromaKey, KeyTarget, OutputSettings, TemplateDescriptor, list_templates};
