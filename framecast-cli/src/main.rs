use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

use framecast_core::{
    Backend, Bookends, CancelToken, CompositeError, Compositor, EncoderPreset, FfmpegBackend,
    MediaProbe, OutputManager, OutputSettings, RenderMonitor, RenderRequest, TemplateDescriptor,
    list_templates,
};

/// Exit code when ffmpeg/ffprobe are missing
const EXIT_BACKEND_UNAVAILABLE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "framecast")]
#[command(about = "Composite a photo into a video template's placeholder and encode the result")]
#[command(version)]
struct Args {
    /// Template folder (containing template.json) or descriptor file
    #[arg(short, long, required_unless_present_any = ["list_presets", "list_templates"])]
    template: Option<PathBuf>,

    /// Customer photo (.jpg/.png)
    #[arg(
        short,
        long,
        required_unless_present_any = ["list_presets", "list_templates", "show_template"]
    )]
    image: Option<PathBuf>,

    /// Add a greeting intro and an outro card around the video
    #[arg(long, value_name = "NAME")]
    customer_name: Option<String>,

    /// Sender shown on the intro and outro cards
    #[arg(long = "from", value_name = "TEXT", requires = "customer_name")]
    sender: Option<String>,

    /// Output video path; defaults to a timestamped file in --out-dir
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Directory for timestamped outputs
    #[arg(long, default_value = "output")]
    out_dir: PathBuf,

    /// Base name for timestamped outputs
    #[arg(long, default_value = "render")]
    name: String,

    /// Override output frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Override output quality (0-51, lower is better)
    #[arg(long)]
    crf: Option<u8>,

    /// Override encoder preset
    #[arg(long, value_enum)]
    preset: Option<EncoderPreset>,

    /// Print the resolved template descriptor as JSON and exit
    #[arg(long)]
    show_template: bool,

    /// Print the filter graph that would be rendered and exit
    #[arg(long)]
    dry_run: bool,

    /// List templates found in a directory
    #[arg(long, value_name = "DIR")]
    list_templates: Option<PathBuf>,

    /// List available encoder presets
    #[arg(long)]
    list_presets: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    if args.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    if args.list_presets {
        println!("\nAvailable presets:");
        println!("{:-<50}", "");
        for (name, description) in EncoderPreset::list_all() {
            println!("{:<12} - {}", name, description);
        }
        println!("\nUsage: framecast -t templates/birthday -i photo.jpg --preset slow");
        return Ok(());
    }

    if let Some(dir) = &args.list_templates {
        let names = list_templates(dir)
            .with_context(|| format!("Failed to list templates in {}", dir.display()))?;
        if names.is_empty() {
            println!("No templates found in {}", dir.display());
        }
        for name in names {
            println!("{name}");
        }
        return Ok(());
    }

    let template_path = args
        .template
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Template required"))?;
    let template = load_template(&template_path, &args)?;

    if args.show_template {
        println!("{}", serde_json::to_string_pretty(&template.to_config())?);
        return Ok(());
    }

    let backend = FfmpegBackend::new();
    match backend.check() {
        Ok(version) => log::info!("FFmpeg version {} detected", version),
        Err(e) => backend_unavailable(&e),
    }

    let image = args
        .image
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Image required"))?;

    let bookends = match &args.customer_name {
        Some(name) => {
            let bookends = Bookends::new(name.as_str())?;
            Some(match &args.sender {
                Some(sender) => bookends.with_sender(sender.as_str()),
                None => bookends,
            })
        }
        None => None,
    };

    let Some(request) = prepare(&args, template, &image, &backend)? else {
        return Ok(());
    };

    log::info!("Template: {:?}", template_path);
    log::info!("Image: {:?}", image);
    log::info!("Output: {:?}", request.destination);

    // Set up progress bar
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let pb_clone = pb.clone();
    let mut render = tokio::task::spawn_blocking(move || {
        let monitor = RenderMonitor::new()
            .with_cancel(worker_cancel)
            .on_progress(move |progress| {
                pb_clone.set_position(progress as u64);
                pb_clone.set_message(format!("Rendering: {:.1}%", progress));
            });
        let compositor = Compositor::new(backend);
        match &bookends {
            Some(bookends) => compositor.render_with_bookends(&request, bookends, &monitor),
            None => compositor.render(&request, &monitor),
        }
    });

    let outcome = tokio::select! {
        joined = &mut render => joined.context("Render task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            pb.set_message("Cancelling...");
            cancel.cancel();
            render.await.context("Render task panicked")?
        }
    };

    match outcome {
        Ok(path) => {
            pb.finish_with_message("Rendering complete!");
            println!("\n✅ Rendered successfully!");
            println!("📁 Output saved to: {:?}", path);
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("Rendering failed");
            if e.is_fatal() {
                backend_unavailable(&e);
            }
            Err(e).context("Render failed")
        }
    }
}

/// Prints the filter graph for `--dry-run` and returns `None`; otherwise
/// resolves the destination, creating `--out-dir` when it is used.
fn prepare<B: Backend + MediaProbe>(
    args: &Args,
    template: TemplateDescriptor,
    image: &Path,
    backend: &B,
) -> Result<Option<RenderRequest>> {
    if args.dry_run {
        let request = RenderRequest::new(template, image, args.out.clone().unwrap_or_default());
        let plan = Compositor::new(backend).plan(&request)?;
        println!("{}", plan.graph.to_filter_complex());
        return Ok(None);
    }

    let destination = match &args.out {
        Some(out) => out.clone(),
        None => OutputManager::new(&args.out_dir)
            .destination(&args.name)
            .context("Failed to prepare output directory")?,
    };
    Ok(Some(RenderRequest::new(template, image, destination)))
}

fn load_template(path: &Path, args: &Args) -> Result<TemplateDescriptor> {
    let template = TemplateDescriptor::load(path)
        .with_context(|| format!("Failed to load template {}", path.display()))?;

    if args.fps.is_none() && args.crf.is_none() && args.preset.is_none() {
        return Ok(template);
    }

    let output = OutputSettings {
        fps: args.fps.unwrap_or(template.output.fps),
        crf: args.crf.unwrap_or(template.output.crf),
        preset: args.preset.unwrap_or(template.output.preset),
    };
    template
        .with_output(output)
        .context("Invalid output override")
}

fn backend_unavailable(e: &CompositeError) -> ! {
    eprintln!("Error: FFmpeg not found!");
    eprintln!("Please install FFmpeg (ffmpeg and ffprobe) to use this tool.");
    eprintln!();
    eprintln!("Installation instructions:");
    eprintln!("  Ubuntu/Debian: sudo apt install ffmpeg");
    eprintln!("  macOS:         brew install ffmpeg");
    eprintln!("  Windows:       Download from https://ffmpeg.org/download.html");
    eprintln!();
    eprintln!("Details: {}", e);
    std::process::exit(EXIT_BACKEND_UNAVAILABLE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use framecast_core::FrameSize;
    use framecast_core::render::EncodeJob;
    use framecast_core::template::{DEFAULT_TEMPLATE_VIDEO, DESCRIPTOR_FILE};
    use std::fs;
    use tempfile::TempDir;

    struct StillBackend;

    impl MediaProbe for StillBackend {
        fn dimensions(&self, _path: &Path) -> framecast_core::Result<FrameSize> {
            Ok(FrameSize::new(1080, 1920))
        }
    }

    impl Backend for StillBackend {
        fn execute(
            &self,
            _job: &EncodeJob<'_>,
            _monitor: &RenderMonitor,
        ) -> framecast_core::Result<()> {
            unreachable!("nothing is encoded here")
        }
    }

    fn setup(dir: &Path) -> (TemplateDescriptor, PathBuf) {
        fs::write(dir.join(DEFAULT_TEMPLATE_VIDEO), b"video").unwrap();
        fs::write(
            dir.join(DESCRIPTOR_FILE),
            r#"{ "placeholder": { "x": 50, "y": 90, "w": 960, "h": 890 } }"#,
        )
        .unwrap();
        let photo = dir.join("photo.jpg");
        fs::write(&photo, b"jpeg").unwrap();
        (TemplateDescriptor::load(dir).unwrap(), photo)
    }

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["framecast", "-t", "tpl", "-i", "photo.jpg"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn dry_run_leaves_out_dir_alone() {
        let dir = TempDir::new().unwrap();
        let (template, photo) = setup(dir.path());
        let out_dir = dir.path().join("renders");
        let args = args(&["--dry-run", "--out-dir", out_dir.to_str().unwrap()]);

        let request = prepare(&args, template, &photo, &StillBackend).unwrap();
        assert!(request.is_none());
        assert!(!out_dir.exists());
    }

    #[test]
    fn render_destination_lands_in_out_dir() {
        let dir = TempDir::new().unwrap();
        let (template, photo) = setup(dir.path());
        let out_dir = dir.path().join("renders");
        let args = args(&["--out-dir", out_dir.to_str().unwrap(), "--name", "ana"]);

        let request = prepare(&args, template, &photo, &StillBackend)
            .unwrap()
            .unwrap();
        assert!(out_dir.is_dir());
        assert_eq!(request.destination.parent(), Some(out_dir.as_path()));
    }

    #[test]
    fn sender_requires_a_customer_name() {
        let argv = ["framecast", "-t", "tpl", "-i", "p.jpg", "--from", "City Bakers"];
        assert!(Args::try_parse_from(argv).is_err());

        let args = args(&["--customer-name", "Ana", "--from", "City Bakers"]);
        assert_eq!(args.customer_name.as_deref(), Some("Ana"));
        assert_eq!(args.sender.as_deref(), Some("City Bakers"));
    }
}
