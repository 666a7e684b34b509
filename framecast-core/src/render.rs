//! Submitting a filter graph to the media backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use crate::error::{CompositeError, Result};
use crate::filter_graph::FilterGraph;
use crate::geometry::FrameSize;
use crate::template::OutputSettings;

/// Shared flag a caller raises to abort a running render.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancellation and progress reporting for one render.
pub struct RenderMonitor {
    cancel: CancelToken,
    progress: Option<Rc<dyn Fn(f64)>>,
    /// Slice of the overall `0..=100` range this monitor reports into.
    start: f64,
    span: f64,
}

impl Default for RenderMonitor {
    fn default() -> Self {
        Self {
            cancel: CancelToken::default(),
            progress: None,
            start: 0.0,
            span: 100.0,
        }
    }
}

impl RenderMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Called with a percentage in `0.0..=100.0`.
    pub fn on_progress(mut self, callback: impl Fn(f64) + 'static) -> Self {
        self.progress = Some(Rc::new(callback));
        self
    }

    /// Monitor for one step of a multi-step render. Its `0..=100` maps onto
    /// `from..=to` of this monitor; cancellation is shared.
    pub fn stage(&self, from: f64, to: f64) -> RenderMonitor {
        RenderMonitor {
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            start: self.start + self.span * from / 100.0,
            span: self.span * (to - from) / 100.0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn report(&self, percent: f64) {
        if let Some(progress) = &self.progress {
            progress(self.start + self.span * percent.clamp(0.0, 100.0) / 100.0);
        }
    }
}

/// File inputs in the order the filter graph indexes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderInputs {
    pub template_video: PathBuf,
    pub photo: PathBuf,
    pub border: Option<PathBuf>,
}

impl RenderInputs {
    pub fn count(&self) -> usize {
        2 + usize::from(self.border.is_some())
    }
}

/// Everything the backend needs for one encode.
#[derive(Clone, Copy, Debug)]
pub struct EncodeJob<'a> {
    pub graph: &'a FilterGraph,
    pub inputs: &'a RenderInputs,
    pub settings: &'a OutputSettings,
    pub destination: &'a Path,
}

/// A generated clip: a graph with no file inputs, producing `[vout]` and `[aout]`.
#[derive(Clone, Copy, Debug)]
pub struct TitleCardJob<'a> {
    pub graph: &'a FilterGraph,
    pub settings: &'a OutputSettings,
    pub destination: &'a Path,
}

/// Joins the clips named in a concat list without re-encoding.
#[derive(Clone, Copy, Debug)]
pub struct ConcatJob<'a> {
    pub list: &'a Path,
    pub destination: &'a Path,
}

/// A media-processing backend that executes a filter graph into a file.
pub trait Backend {
    /// Runs the encode to completion, blocking the calling thread.
    fn execute(&self, job: &EncodeJob<'_>, monitor: &RenderMonitor) -> Result<()>;
}

/// Reads the pixel size of the first video stream of an image or video.
pub trait MediaProbe {
    fn dimensions(&self, path: &Path) -> Result<FrameSize>;
}

/// Generates title cards and stitches clips together.
pub trait Assembler {
    fn title_card(&self, job: &TitleCardJob<'_>, monitor: &RenderMonitor) -> Result<()>;

    fn concat(&self, job: &ConcatJob<'_>, monitor: &RenderMonitor) -> Result<()>;
}

impl<T: Backend + ?Sized> Backend for &T {
    fn execute(&self, job: &EncodeJob<'_>, monitor: &RenderMonitor) -> Result<()> {
        (**self).execute(job, monitor)
    }
}

impl<T: MediaProbe + ?Sized> MediaProbe for &T {
    fn dimensions(&self, path: &Path) -> Result<FrameSize> {
        (**self).dimensions(path)
    }
}

impl<T: Assembler + ?Sized> Assembler for &T {
    fn title_card(&self, job: &TitleCardJob<'_>, monitor: &RenderMonitor) -> Result<()> {
        (**self).title_card(job, monitor)
    }

    fn concat(&self, job: &ConcatJob<'_>, monitor: &RenderMonitor) -> Result<()> {
        (**self).concat(job, monitor)
    }
}

/// Runs encodes and guarantees that a failed render leaves no file behind.
pub struct Renderer<B> {
    backend: B,
}

impl<B: Backend> Renderer<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Encodes `graph` into `destination`, overwriting any existing file.
    pub fn render(
        &self,
        graph: &FilterGraph,
        inputs: &RenderInputs,
        settings: &OutputSettings,
        destination: &Path,
        monitor: &RenderMonitor,
    ) -> Result<PathBuf> {
        if graph.input_count() != inputs.count() {
            return Err(CompositeError::graph(format!(
                "graph reads {} inputs but {} were supplied",
                graph.input_count(),
                inputs.count()
            )));
        }
        settings.validate()?;
        if monitor.is_cancelled() {
            return Err(CompositeError::Cancelled);
        }
        ensure_parent_dir(destination)?;

        let job = EncodeJob {
            graph,
            inputs,
            settings,
            destination,
        };
        let guard = OutputGuard::new(destination);
        guard.finish(self.backend.execute(&job, monitor))?;
        log::info!("Rendered {}", destination.display());
        Ok(destination.to_path_buf())
    }
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Size and modification time of a file.
type Fingerprint = (u64, Option<SystemTime>);

fn fingerprint(path: &Path) -> Option<Fingerprint> {
    fs::metadata(path).ok().map(|m| (m.len(), m.modified().ok()))
}

/// Remembers what was at a destination before a backend ran, so a failure
/// removes only what the backend wrote.
pub(crate) struct OutputGuard<'a> {
    destination: &'a Path,
    before: Option<Fingerprint>,
}

impl<'a> OutputGuard<'a> {
    pub(crate) fn new(destination: &'a Path) -> Self {
        Self {
            destination,
            before: fingerprint(destination),
        }
    }

    /// Passes `outcome` through, turning "success without a file" into an
    /// encode error and discarding partial output on any failure.
    pub(crate) fn finish(&self, outcome: Result<()>) -> Result<()> {
        let outcome = outcome.and_then(|()| {
            if self.destination.is_file() {
                Ok(())
            } else {
                Err(CompositeError::Encode {
                    code: Some(0),
                    diagnostics: format!(
                        "backend reported success but {} is missing",
                        self.destination.display()
                    ),
                })
            }
        });
        if outcome.is_err() {
            self.discard();
        }
        outcome
    }

    fn discard(&self) {
        let Some(after) = fingerprint(self.destination) else {
            return;
        };
        if self.before == Some(after) {
            log::debug!(
                "Leaving untouched existing file {}",
                self.destination.display()
            );
            return;
        }
        match fs::remove_file(self.destination) {
            Ok(()) => log::warn!("Removed partial output {}", self.destination.display()),
            Err(e) => log::error!(
                "Failed to remove partial output {}: {e}",
                self.destination.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter_graph::build;
    use crate::geometry::{FitMode, Rect, resolve};
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    /// Writes some bytes, then behaves as configured.
    struct ScriptedBackend {
        fail_with: Option<i32>,
        write_output: bool,
        calls: Cell<usize>,
    }

    impl ScriptedBackend {
        fn new(fail_with: Option<i32>, write_output: bool) -> Self {
            Self {
                fail_with,
                write_output,
                calls: Cell::new(0),
            }
        }
    }

    impl Backend for ScriptedBackend {
        fn execute(&self, job: &EncodeJob<'_>, monitor: &RenderMonitor) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.write_output {
                fs::write(job.destination, b"partial")?;
            }
            monitor.report(50.0);
            match self.fail_with {
                Some(code) => Err(CompositeError::Encode {
                    code: Some(code),
                    diagnostics: "Error while filtering".into(),
                }),
                None => Ok(()),
            }
        }
    }

    fn fixture(border: bool) -> (FilterGraph, RenderInputs) {
        let rect = Rect::new(0, 0, 100, 100);
        let t = resolve(200, 100, &rect, FitMode::Cover).unwrap();
        let border_path = border.then(|| PathBuf::from("border.png"));
        let graph = build(
            &t,
            None,
            &rect,
            border_path.as_deref(),
            FrameSize::new(100, 100),
            30,
        )
        .unwrap();
        let inputs = RenderInputs {
            template_video: PathBuf::from("template.mp4"),
            photo: PathBuf::from("photo.jpg"),
            border: border_path,
        };
        (graph, inputs)
    }

    #[test]
    fn success_returns_destination_and_reports_progress() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested").join("out.mp4");
        let (graph, inputs) = fixture(false);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let monitor = RenderMonitor::new().on_progress(move |p| sink.borrow_mut().push(p));

        let renderer = Renderer::new(ScriptedBackend::new(None, true));
        let out = renderer
            .render(&graph, &inputs, &OutputSettings::default(), &dest, &monitor)
            .unwrap();
        assert_eq!(out, dest);
        assert!(dest.is_file());
        assert_eq!(*seen.borrow(), vec![50.0]);
    }

    #[test]
    fn failure_removes_partial_output() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.mp4");
        let (graph, inputs) = fixture(true);

        let renderer = Renderer::new(ScriptedBackend::new(Some(1), true));
        let err = renderer
            .render(&graph, &inputs, &OutputSettings::default(), &dest, &RenderMonitor::new())
            .unwrap_err();
        match err {
            CompositeError::Encode { code, diagnostics } => {
                assert_eq!(code, Some(1));
                assert!(diagnostics.contains("filtering"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!dest.exists());
    }

    #[test]
    fn retry_after_failure_starts_clean() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.mp4");
        let (graph, inputs) = fixture(false);
        let settings = OutputSettings::default();
        let monitor = RenderMonitor::new();

        let failing = Renderer::new(ScriptedBackend::new(Some(183), true));
        assert!(failing.render(&graph, &inputs, &settings, &dest, &monitor).is_err());

        let working = Renderer::new(ScriptedBackend::new(None, true));
        working.render(&graph, &inputs, &settings, &dest, &monitor).unwrap();
        working.render(&graph, &inputs, &settings, &dest, &monitor).unwrap();
        assert_eq!(working.backend().calls.get(), 2);
        assert_eq!(fs::read(&dest).unwrap(), b"partial");
    }

    #[test]
    fn missing_output_after_success_is_an_encode_error() {
        let dir = TempDir::new().unwrap();
        let (graph, inputs) = fixture(false);
        let renderer = Renderer::new(ScriptedBackend::new(None, false));
        let err = renderer
            .render(
                &graph,
                &inputs,
                &OutputSettings::default(),
                &dir.path().join("out.mp4"),
                &RenderMonitor::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CompositeError::Encode { .. }));
    }

    #[test]
    fn input_mismatch_is_rejected_before_the_backend_runs() {
        let dir = TempDir::new().unwrap();
        let (graph, mut inputs) = fixture(false);
        inputs.border = Some(PathBuf::from("border.png"));
        let renderer = Renderer::new(ScriptedBackend::new(None, true));
        let err = renderer
            .render(
                &graph,
                &inputs,
                &OutputSettings::default(),
                &dir.path().join("out.mp4"),
                &RenderMonitor::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CompositeError::GraphBuild(_)));
        assert_eq!(renderer.backend().calls.get(), 0);
    }

    #[test]
    fn cancelled_before_start_never_invokes_backend() {
        let dir = TempDir::new().unwrap();
        let (graph, inputs) = fixture(false);
        let cancel = CancelToken::new();
        cancel.cancel();
        let monitor = RenderMonitor::new().with_cancel(cancel);
        let renderer = Renderer::new(ScriptedBackend::new(None, true));
        let err = renderer
            .render(
                &graph,
                &inputs,
                &OutputSettings::default(),
                &dir.path().join("out.mp4"),
                &monitor,
            )
            .unwrap_err();
        assert!(matches!(err, CompositeError::Cancelled));
        assert_eq!(renderer.backend().calls.get(), 0);
    }

    #[test]
    fn existing_file_survives_a_backend_that_never_wrote() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.mp4");
        fs::write(&dest, b"last week's render").unwrap();
        let (graph, inputs) = fixture(false);

        let renderer = Renderer::new(ScriptedBackend::new(Some(1), false));
        let err = renderer
            .render(&graph, &inputs, &OutputSettings::default(), &dest, &RenderMonitor::new())
            .unwrap_err();
        assert!(matches!(err, CompositeError::Encode { .. }));
        assert_eq!(fs::read(&dest).unwrap(), b"last week's render");
    }

    #[test]
    fn existing_file_overwritten_by_a_failed_encode_is_removed() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.mp4");
        fs::write(&dest, b"last week's render").unwrap();
        let (graph, inputs) = fixture(false);

        let renderer = Renderer::new(ScriptedBackend::new(Some(1), true));
        assert!(
            renderer
                .render(&graph, &inputs, &OutputSettings::default(), &dest, &RenderMonitor::new())
                .is_err()
        );
        assert!(!dest.exists());
    }

    #[test]
    fn stages_report_into_their_slice_of_the_range() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let monitor = RenderMonitor::new().on_progress(move |p| sink.borrow_mut().push(p));

        let main = monitor.stage(10.0, 90.0);
        main.report(0.0);
        main.report(50.0);
        main.report(150.0);
        main.stage(50.0, 100.0).report(50.0);
        monitor.stage(90.0, 100.0).report(100.0);

        assert_eq!(*seen.borrow(), vec![10.0, 50.0, 90.0, 70.0, 100.0]);
    }

    #[test]
    fn stages_share_cancellation() {
        let cancel = CancelToken::new();
        let monitor = RenderMonitor::new().with_cancel(cancel.clone());
        let stage = monitor.stage(0.0, 50.0);
        assert!(!stage.is_cancelled());
        cancel.cancel();
        assert!(stage.is_cancelled());
    }

    /// Executable shell script standing in for ffmpeg.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ffmpeg");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn cancelling_a_running_encode_kills_ffmpeg_and_removes_output() {
        use crate::ffmpeg_wrapper::FfmpegBackend;
        use std::thread;
        use std::time::{Duration, Instant};

        let dir = TempDir::new().unwrap();
        // Writes to the output path (the last argument), then hangs.
        let ffmpeg = fake_ffmpeg(
            dir.path(),
            r#"for arg; do out="$arg"; done
printf partial > "$out"
exec sleep 30"#,
        );
        let dest = dir.path().join("out.mp4");
        let (graph, inputs) = fixture(false);

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            trigger.cancel();
        });

        let renderer = Renderer::new(FfmpegBackend::with_binaries(&ffmpeg, "ffprobe"));
        let monitor = RenderMonitor::new().with_cancel(cancel);
        let started = Instant::now();
        let err = renderer
            .render(&graph, &inputs, &OutputSettings::default(), &dest, &monitor)
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, CompositeError::Cancelled), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!dest.exists());
    }
}
