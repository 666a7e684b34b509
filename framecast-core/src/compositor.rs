use std::path::{Path, PathBuf};

use crate::error::{CompositeError, Result};
use crate::filter_graph::{self, FilterGraph};
use crate::geometry::{self, FrameSize, Transform};
use crate::render::{Assembler, Backend, MediaProbe, RenderInputs, RenderMonitor, Renderer};
use crate::sequence::{Bookends, Sequencer};
use crate::template::TemplateDescriptor;

/// One render: a validated template, the user's photo and where to write.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub template: TemplateDescriptor,
    pub photo: PathBuf,
    pub destination: PathBuf,
}

impl RenderRequest {
    pub fn new(
        template: TemplateDescriptor,
        photo: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> Self {
        Self {
            template,
            photo: photo.as_ref().to_path_buf(),
            destination: destination.as_ref().to_path_buf(),
        }
    }
}

/// Everything decided before the backend is asked to encode.
#[derive(Debug, Clone)]
pub struct RenderPlan {
    pub frame: FrameSize,
    pub image: FrameSize,
    pub transform: Transform,
    pub graph: FilterGraph,
    pub inputs: RenderInputs,
}

/// Runs the full pipeline: probe, geometry, filter graph, encode.
pub struct Compositor<B> {
    renderer: Renderer<B>,
}

impl<B: Backend + MediaProbe> Compositor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            renderer: Renderer::new(backend),
        }
    }

    /// Probes the inputs and builds the filter graph without encoding.
    pub fn plan(&self, request: &RenderRequest) -> Result<RenderPlan> {
        let template = &request.template;
        let probe = self.renderer.backend();

        log::info!("Analyzing template video...");
        let frame = probe
            .dimensions(&template.template_video)
            .map_err(|e| match e {
                CompositeError::InvalidImage(message) => {
                    CompositeError::validation("template_video", message)
                }
                other => other,
            })?;
        template.check_frame(frame)?;

        if !request.photo.is_file() {
            return Err(CompositeError::invalid_image(format!(
                "{} not found",
                request.photo.display()
            )));
        }
        let image = probe.dimensions(&request.photo)?;
        log::info!(
            "Template {frame}, photo {image}, placeholder {}x{} at {},{} ({})",
            template.placeholder.w,
            template.placeholder.h,
            template.placeholder.x,
            template.placeholder.y,
            template.fit
        );

        let transform = geometry::resolve(
            image.width,
            image.height,
            &template.placeholder,
            template.fit,
        )?;
        let graph = filter_graph::build(
            &transform,
            template.active_key(),
            &template.placeholder,
            template.border_image.as_deref(),
            frame,
            template.output.fps,
        )?;

        Ok(RenderPlan {
            frame,
            image,
            transform,
            graph,
            inputs: RenderInputs {
                template_video: template.template_video.clone(),
                photo: request.photo.clone(),
                border: template.border_image.clone(),
            },
        })
    }

    /// Renders `request`, blocking until the backend exits.
    pub fn render(&self, request: &RenderRequest, monitor: &RenderMonitor) -> Result<PathBuf> {
        let plan = self.plan(request)?;
        let output = &request.template.output;
        log::info!(
            "Encoding at {} fps, crf {}, preset {}",
            output.fps,
            output.crf,
            output.preset
        );
        self.renderer.render(
            &plan.graph,
            &plan.inputs,
            output,
            &request.destination,
            monitor,
        )
    }
}

impl<B: Backend + MediaProbe + Assembler> Compositor<B> {
    /// Renders `request` between an intro and an outro card and joins the
    /// three clips into the request's destination.
    ///
    /// Intermediate clips live in a scratch directory that is removed on
    /// every exit path.
    pub fn render_with_bookends(
        &self,
        request: &RenderRequest,
        bookends: &Bookends,
        monitor: &RenderMonitor,
    ) -> Result<PathBuf> {
        let plan = self.plan(request)?;
        let settings = &request.template.output;
        settings.validate()?;
        if monitor.is_cancelled() {
            return Err(CompositeError::Cancelled);
        }

        let work = tempfile::Builder::new().prefix("framecast-").tempdir()?;
        log::debug!("Scratch directory {}", work.path().display());
        let sequencer = Sequencer::new(self.renderer.backend(), work.path(), plan.frame, settings);

        let intro = sequencer.title_card(&bookends.intro(), &monitor.stage(0.0, 10.0))?;
        let main = work.path().join("main.mp4");
        log::info!(
            "Encoding at {} fps, crf {}, preset {}",
            settings.fps,
            settings.crf,
            settings.preset
        );
        self.renderer.render(
            &plan.graph,
            &plan.inputs,
            settings,
            &main,
            &monitor.stage(10.0, 85.0),
        )?;
        let outro = sequencer.title_card(&bookends.outro(), &monitor.stage(85.0, 92.0))?;

        sequencer.concat(
            &[intro, main, outro],
            &request.destination,
            &monitor.stage(92.0, 100.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{CancelToken, ConcatJob, EncodeJob, TitleCardJob};
    use crate::template::{DEFAULT_TEMPLATE_VIDEO, DESCRIPTOR_FILE};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    /// Backend that answers probes from a table and records submitted graphs.
    #[derive(Default)]
    struct MockBackend {
        sizes: HashMap<PathBuf, FrameSize>,
        submitted: RefCell<Vec<String>>,
        cards: RefCell<Vec<PathBuf>>,
        /// Parts named by each concat list, and whether each existed.
        joined: RefCell<Vec<(PathBuf, bool)>>,
        fail_concat: bool,
    }

    impl MockBackend {
        fn with_size(mut self, path: &Path, size: FrameSize) -> Self {
            self.sizes.insert(path.to_path_buf(), size);
            self
        }
    }

    impl MediaProbe for MockBackend {
        fn dimensions(&self, path: &Path) -> Result<FrameSize> {
            self.sizes
                .get(path)
                .copied()
                .ok_or_else(|| {
                    CompositeError::invalid_image(format!("unreadable {}", path.display()))
                })
        }
    }

    impl Backend for MockBackend {
        fn execute(&self, job: &EncodeJob<'_>, _monitor: &RenderMonitor) -> Result<()> {
            self.submitted
                .borrow_mut()
                .push(job.graph.to_filter_complex());
            fs::write(job.destination, b"video")?;
            Ok(())
        }
    }

    impl Assembler for MockBackend {
        fn title_card(&self, job: &TitleCardJob<'_>, _monitor: &RenderMonitor) -> Result<()> {
            self.cards.borrow_mut().push(job.destination.to_path_buf());
            fs::write(job.destination, b"card")?;
            Ok(())
        }

        fn concat(&self, job: &ConcatJob<'_>, _monitor: &RenderMonitor) -> Result<()> {
            let list = fs::read_to_string(job.list)?;
            for line in list.lines() {
                let part = line
                    .strip_prefix("file '")
                    .and_then(|rest| rest.strip_suffix('\''))
                    .map(PathBuf::from)
                    .unwrap();
                let present = part.is_file();
                self.joined.borrow_mut().push((part, present));
            }
            fs::write(job.destination, b"joined")?;
            if self.fail_concat {
                return Err(CompositeError::Encode {
                    code: Some(1),
                    diagnostics: "concat failed".into(),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        template: TemplateDescriptor,
        photo: PathBuf,
    }

    fn fixture(extra: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(DEFAULT_TEMPLATE_VIDEO), b"video").unwrap();
        fs::write(dir.path().join("border.png"), b"png").unwrap();
        fs::write(
            dir.path().join(DESCRIPTOR_FILE),
            format!(
                r#"{{ "placeholder": {{ "x": 50, "y": 90, "w": 960, "h": 890 }},
                      "border_png": "border.png" {extra} }}"#
            ),
        )
        .unwrap();
        let photo = dir.path().join("photo.jpg");
        fs::write(&photo, b"jpeg").unwrap();
        let template = TemplateDescriptor::load(dir.path()).unwrap();
        Fixture {
            dir,
            template,
            photo,
        }
    }

    fn backend(f: &Fixture, frame: FrameSize, image: FrameSize) -> MockBackend {
        MockBackend::default()
            .with_size(&f.template.template_video, frame)
            .with_size(&f.photo, image)
    }

    #[test]
    fn renders_cover_scenario_end_to_end() {
        let f = fixture(r#", "chroma": { "hex": "3ec954", "similarity": 0.23, "blend": 0.03 }"#);
        let compositor = Compositor::new(backend(
            &f,
            FrameSize::new(1080, 1920),
            FrameSize::new(1000, 500),
        ));
        let dest = f.dir.path().join("out").join("result.mp4");
        let request = RenderRequest::new(f.template.clone(), &f.photo, &dest);

        let out = compositor.render(&request, &RenderMonitor::new()).unwrap();
        assert_eq!(out, dest);
        assert!(dest.is_file());

        let submitted = compositor.renderer.backend().submitted.borrow();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].starts_with(
            "[1:v]scale=1780:890,crop=960:890:410:0,format=rgba,colorkey=0x3ec954:0.23:0.03[photo]"
        ));
        assert!(submitted[0].contains("[comp][2:v]overlay=0:0[framed]"));
    }

    #[test]
    fn plan_for_contain_centers_vertically() {
        let f = fixture(r#", "fit": "contain""#);
        let compositor = Compositor::new(backend(
            &f,
            FrameSize::new(1080, 1920),
            FrameSize::new(1000, 500),
        ));
        let request = RenderRequest::new(f.template.clone(), &f.photo, f.dir.path().join("o.mp4"));
        let plan = compositor.plan(&request).unwrap();
        assert_eq!(plan.transform.scaled, FrameSize::new(960, 480));
        assert_eq!(plan.transform.offset_y, 205);
        assert_eq!(plan.inputs.count(), 3);
    }

    #[test]
    fn placeholder_outside_template_frame_is_rejected() {
        let f = fixture("");
        let compositor = Compositor::new(backend(
            &f,
            FrameSize::new(640, 480),
            FrameSize::new(1000, 500),
        ));
        let request = RenderRequest::new(f.template.clone(), &f.photo, f.dir.path().join("o.mp4"));
        let err = compositor.render(&request, &RenderMonitor::new()).unwrap_err();
        assert_eq!(err.field(), Some("placeholder"));
        assert!(compositor.renderer.backend().submitted.borrow().is_empty());
    }

    #[test]
    fn degenerate_or_missing_photo_never_reaches_the_backend() {
        let f = fixture("");
        let compositor = Compositor::new(backend(
            &f,
            FrameSize::new(1080, 1920),
            FrameSize::new(0, 500),
        ));
        let request = RenderRequest::new(f.template.clone(), &f.photo, f.dir.path().join("o.mp4"));
        let err = compositor.render(&request, &RenderMonitor::new()).unwrap_err();
        assert!(matches!(err, CompositeError::InvalidImage(_)));

        let missing = RenderRequest::new(
            f.template.clone(),
            f.dir.path().join("nope.jpg"),
            f.dir.path().join("o.mp4"),
        );
        let err = compositor.render(&missing, &RenderMonitor::new()).unwrap_err();
        assert!(matches!(err, CompositeError::InvalidImage(_)));
        assert!(compositor.renderer.backend().submitted.borrow().is_empty());
    }

    #[test]
    fn unreadable_template_video_is_a_validation_error() {
        let f = fixture("");
        let compositor = Compositor::new(
            MockBackend::default().with_size(&f.photo, FrameSize::new(10, 10)),
        );
        let request = RenderRequest::new(f.template.clone(), &f.photo, f.dir.path().join("o.mp4"));
        let err = compositor.plan(&request).unwrap_err();
        assert_eq!(err.field(), Some("template_video"));
    }

    #[test]
    fn bookends_wrap_the_main_render_and_clean_up() {
        let f = fixture("");
        let compositor = Compositor::new(backend(
            &f,
            FrameSize::new(1080, 1920),
            FrameSize::new(1000, 500),
        ));
        let dest = f.dir.path().join("out").join("final.mp4");
        let request = RenderRequest::new(f.template.clone(), &f.photo, &dest);
        let bookends = Bookends::new("Ana").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let monitor = RenderMonitor::new().on_progress(move |p| sink.borrow_mut().push(p));

        let out = compositor
            .render_with_bookends(&request, &bookends, &monitor)
            .unwrap();
        assert_eq!(out, dest);
        assert_eq!(fs::read(&dest).unwrap(), b"joined");

        let mock = compositor.renderer.backend();
        assert_eq!(mock.submitted.borrow().len(), 1);
        let cards = mock.cards.borrow();
        assert_eq!(cards.len(), 2);
        assert!(cards[0].ends_with("intro.mp4"));
        assert!(cards[1].ends_with("outro.mp4"));

        let joined = mock.joined.borrow();
        let names: Vec<_> = joined
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["intro.mp4", "main.mp4", "outro.mp4"]);
        assert!(joined.iter().all(|(_, present)| *present));
        assert!(joined.iter().all(|(p, _)| !p.exists()));
        assert!(!joined[0].0.parent().unwrap().exists());
        assert_eq!(seen.borrow().last(), Some(&100.0));
    }

    #[test]
    fn failed_concat_removes_destination_and_parts() {
        let f = fixture("");
        let mut mock = backend(&f, FrameSize::new(1080, 1920), FrameSize::new(1000, 500));
        mock.fail_concat = true;
        let compositor = Compositor::new(mock);
        let dest = f.dir.path().join("final.mp4");
        let request = RenderRequest::new(f.template.clone(), &f.photo, &dest);

        let err = compositor
            .render_with_bookends(&request, &Bookends::new("Ana").unwrap(), &RenderMonitor::new())
            .unwrap_err();
        assert!(matches!(err, CompositeError::Encode { .. }));
        assert!(!dest.exists());
        let joined = compositor.renderer.backend().joined.borrow();
        assert_eq!(joined.len(), 3);
        assert!(joined.iter().all(|(p, _)| !p.exists()));
    }

    #[test]
    fn cancelled_bookend_render_does_no_work() {
        let f = fixture("");
        let compositor = Compositor::new(backend(
            &f,
            FrameSize::new(1080, 1920),
            FrameSize::new(1000, 500),
        ));
        let dest = f.dir.path().join("final.mp4");
        let request = RenderRequest::new(f.template.clone(), &f.photo, &dest);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = compositor
            .render_with_bookends(
                &request,
                &Bookends::new("Ana").unwrap(),
                &RenderMonitor::new().with_cancel(cancel),
            )
            .unwrap_err();
        assert!(matches!(err, CompositeError::Cancelled));
        let mock = compositor.renderer.backend();
        assert!(mock.cards.borrow().is_empty());
        assert!(mock.submitted.borrow().is_empty());
        assert!(!dest.exists());
    }
}
