use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{CompositeError, Result};
use crate::filter_graph::AUDIO_LABEL;
use crate::geometry::FrameSize;
use crate::render::{
    Assembler, Backend, ConcatJob, EncodeJob, MediaProbe, RenderMonitor, TitleCardJob,
};

/// Lines of backend stderr kept for error reports
const DIAGNOSTIC_TAIL: usize = 40;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration: (\d{2}):(\d{2}):(\d{2})\.(\d{2})").unwrap());
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d{2}):(\d{2}):(\d{2})\.(\d{2})").unwrap());
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:ffmpeg|ffprobe) version (\S+)").unwrap());

#[derive(Debug, Clone)]
struct Input {
    /// Options placed before `-i`
    options: Vec<&'static str>,
    path: PathBuf,
}

/// FFmpeg command builder with fluent interface
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    program: PathBuf,
    inputs: Vec<Input>,
    output: PathBuf,
    filter_complex: Option<String>,
    maps: Vec<String>,
    video_codec: Option<String>,
    audio_codec: Option<String>,
    quality: Option<u8>,
    preset: Option<String>,
    frame_rate: Option<u32>,
    shortest: bool,
    stream_copy: bool,
    overwrite: bool,
}

impl FfmpegCommand {
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            inputs: Vec::new(),
            output: output.as_ref().to_path_buf(),
            filter_complex: None,
            maps: Vec::new(),
            video_codec: None,
            audio_codec: None,
            quality: None,
            preset: None,
            frame_rate: None,
            shortest: false,
            stream_copy: false,
            overwrite: false,
        }
    }

    /// Use a specific ffmpeg binary
    pub fn program(mut self, program: impl AsRef<Path>) -> Self {
        self.program = program.as_ref().to_path_buf();
        self
    }

    /// Add an input file
    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.inputs.push(Input {
            options: Vec::new(),
            path: path.as_ref().to_path_buf(),
        });
        self
    }

    /// Add a still image input repeated for as long as the graph needs it
    pub fn looped_input(mut self, path: impl AsRef<Path>) -> Self {
        self.inputs.push(Input {
            options: vec!["-loop", "1"],
            path: path.as_ref().to_path_buf(),
        });
        self
    }

    /// Add a concat demuxer list whose entries are absolute paths
    pub fn concat_input(mut self, list: impl AsRef<Path>) -> Self {
        self.inputs.push(Input {
            options: vec!["-f", "concat", "-safe", "0"],
            path: list.as_ref().to_path_buf(),
        });
        self
    }

    /// Set the filter graph
    pub fn filter_complex(mut self, graph: impl Into<String>) -> Self {
        self.filter_complex = Some(graph.into());
        self
    }

    /// Map a stream or graph label to the output
    pub fn map(mut self, spec: impl Into<String>) -> Self {
        self.maps.push(spec.into());
        self
    }

    /// Set video codec
    pub fn video_codec(mut self, codec: &str) -> Self {
        self.video_codec = Some(codec.to_string());
        self
    }

    /// Set audio codec
    pub fn audio_codec(mut self, codec: &str) -> Self {
        self.audio_codec = Some(codec.to_string());
        self
    }

    /// Set quality (CRF value, 0-51 for x264/x265)
    pub fn quality(mut self, crf: u8) -> Self {
        self.quality = Some(crf);
        self
    }

    /// Set encoding preset (ultrafast ... placebo)
    pub fn preset(mut self, preset: &str) -> Self {
        self.preset = Some(preset.to_string());
        self
    }

    /// Set output frame rate
    pub fn frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = Some(fps);
        self
    }

    /// Stop when the shortest output stream ends
    pub fn shortest(mut self) -> Self {
        self.shortest = true;
        self
    }

    /// Copy streams instead of re-encoding
    pub fn stream_copy(mut self) -> Self {
        self.stream_copy = true;
        self
    }

    /// Enable overwrite without asking
    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    /// Argument list, without the program name
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();

        if self.overwrite {
            args.push("-y".into());
        }

        for input in &self.inputs {
            args.extend(input.options.iter().copied().map(OsString::from));
            args.push("-i".into());
            args.push(input.path.clone().into_os_string());
        }

        if let Some(ref graph) = self.filter_complex {
            args.push("-filter_complex".into());
            args.push(graph.into());
        }

        for map in &self.maps {
            args.push("-map".into());
            args.push(map.into());
        }

        if self.shortest {
            args.push("-shortest".into());
        }

        if let Some(fps) = self.frame_rate {
            args.push("-r".into());
            args.push(fps.to_string().into());
        }

        if let Some(ref codec) = self.video_codec {
            args.push("-c:v".into());
            args.push(codec.into());
        }

        if let Some(crf) = self.quality {
            args.push("-crf".into());
            args.push(crf.to_string().into());
        }

        if let Some(ref preset) = self.preset {
            args.push("-preset".into());
            args.push(preset.into());
        }

        if let Some(ref codec) = self.audio_codec {
            args.push("-c:a".into());
            args.push(codec.into());
        }

        if self.stream_copy {
            args.push("-c".into());
            args.push("copy".into());
        }

        args.push(self.output.clone().into_os_string());
        args
    }

    /// Build the FFmpeg command
    pub fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args());
        cmd
    }

    /// Execute the FFmpeg command, reporting progress and honouring
    /// cancellation from `monitor`.
    pub fn execute(&self, monitor: &RenderMonitor) -> Result<()> {
        let mut cmd = self.build();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        log::info!("Executing FFmpeg command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| spawn_error(&self.program, e))?;

        let stderr = child.stderr.take().ok_or_else(|| {
            CompositeError::BackendUnavailable("failed to capture ffmpeg stderr".into())
        })?;

        let (tx, rx) = mpsc::channel();

        // Read stderr on its own thread so a full pipe never stalls ffmpeg
        let reader_thread = thread::spawn(move || {
            let mut total_duration: Option<f64> = None;
            let mut tail = VecDeque::with_capacity(DIAGNOSTIC_TAIL);

            let read = for_each_line(BufReader::new(stderr), |line| {
                if line.trim().is_empty() {
                    return;
                }
                log::trace!("ffmpeg: {line}");

                if total_duration.is_none() {
                    total_duration = parse_timestamp(&DURATION_RE, line);
                }

                if let Some(current) = parse_timestamp(&TIME_RE, line)
                    && let Some(duration) = total_duration.filter(|d| *d > 0.0)
                {
                    let _ = tx.send((current / duration * 100.0).min(100.0));
                }

                if tail.len() == DIAGNOSTIC_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            });
            if let Err(e) = read {
                log::debug!("Stopped reading ffmpeg output: {e}");
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let status = loop {
            while let Ok(progress) = rx.try_recv() {
                monitor.report(progress);
            }

            if monitor.is_cancelled() {
                log::warn!("Render cancelled, stopping ffmpeg");
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader_thread.join();
                return Err(CompositeError::Cancelled);
            }

            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let diagnostics = reader_thread
            .join()
            .unwrap_or_else(|_| String::from("failed to collect ffmpeg output"));
        while let Ok(progress) = rx.try_recv() {
            monitor.report(progress);
        }

        if !status.success() {
            log::error!("FFmpeg failed with output:\n{}", diagnostics);
            return Err(CompositeError::Encode {
                code: status.code(),
                diagnostics,
            });
        }

        monitor.report(100.0);
        Ok(())
    }
}

/// Calls `f` with every line of `reader`. ffmpeg ends progress updates with a
/// bare `\r`, so `\r` and `\n` both terminate a line.
fn for_each_line(mut reader: impl BufRead, mut f: impl FnMut(&str)) -> io::Result<()> {
    let mut line = Vec::new();
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        let consumed = buf.len();
        for &byte in buf {
            if byte == b'\r' || byte == b'\n' {
                if !line.is_empty() {
                    f(&String::from_utf8_lossy(&line));
                    line.clear();
                }
            } else {
                line.push(byte);
            }
        }
        reader.consume(consumed);
    }
    if !line.is_empty() {
        f(&String::from_utf8_lossy(&line));
    }
    Ok(())
}

fn parse_timestamp(re: &Regex, line: &str) -> Option<f64> {
    let caps = re.captures(line)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    let centis: f64 = caps[4].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds + centis / 100.0)
}

fn spawn_error(program: &Path, e: std::io::Error) -> CompositeError {
    if e.kind() == ErrorKind::NotFound {
        CompositeError::BackendUnavailable(format!("{} not found on PATH", program.display()))
    } else {
        CompositeError::BackendUnavailable(format!("failed to start {}: {e}", program.display()))
    }
}

/// The ffmpeg/ffprobe command-line tools as the media backend.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl FfmpegBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binaries(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Verifies both tools run and returns the ffmpeg version.
    pub fn check(&self) -> Result<String> {
        let version = tool_version(&self.ffmpeg)?;
        tool_version(&self.ffprobe)?;
        Ok(version)
    }

    /// Command line for `job`.
    pub fn command(&self, job: &EncodeJob<'_>) -> FfmpegCommand {
        let mut cmd = FfmpegCommand::new(job.destination)
            .program(&self.ffmpeg)
            .overwrite()
            .input(&job.inputs.template_video)
            .looped_input(&job.inputs.photo);

        if let Some(ref border) = job.inputs.border {
            cmd = cmd.input(border);
        }

        cmd.filter_complex(job.graph.to_filter_complex())
            .map(format!("[{}]", job.graph.output_label()))
            .map("0:a?")
            .shortest()
            .frame_rate(job.settings.fps)
            .video_codec("libx264")
            .quality(job.settings.crf)
            .preset(job.settings.preset.as_str())
            .audio_codec("aac")
    }
}

impl FfmpegBackend {
    /// Command line for a generated clip.
    pub fn title_card_command(&self, job: &TitleCardJob<'_>) -> FfmpegCommand {
        FfmpegCommand::new(job.destination)
            .program(&self.ffmpeg)
            .overwrite()
            .filter_complex(job.graph.to_filter_complex())
            .map(format!("[{}]", job.graph.output_label()))
            .map(format!("[{}]", AUDIO_LABEL))
            .shortest()
            .frame_rate(job.settings.fps)
            .video_codec("libx264")
            .quality(job.settings.crf)
            .preset(job.settings.preset.as_str())
            .audio_codec("aac")
    }

    /// Command line joining the clips of a concat list.
    pub fn concat_command(&self, job: &ConcatJob<'_>) -> FfmpegCommand {
        FfmpegCommand::new(job.destination)
            .program(&self.ffmpeg)
            .overwrite()
            .concat_input(job.list)
            .stream_copy()
    }
}

impl Backend for FfmpegBackend {
    fn execute(&self, job: &EncodeJob<'_>, monitor: &RenderMonitor) -> Result<()> {
        self.command(job).execute(monitor)
    }
}

impl Assembler for FfmpegBackend {
    fn title_card(&self, job: &TitleCardJob<'_>, monitor: &RenderMonitor) -> Result<()> {
        self.title_card_command(job).execute(monitor)
    }

    fn concat(&self, job: &ConcatJob<'_>, monitor: &RenderMonitor) -> Result<()> {
        self.concat_command(job).execute(monitor)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

impl MediaProbe for FfmpegBackend {
    fn dimensions(&self, path: &Path) -> Result<FrameSize> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "json",
            ])
            .arg(path)
            .output()
            .map_err(|e| spawn_error(&self.ffprobe, e))?;

        if !output.status.success() {
            return Err(CompositeError::invalid_image(format!(
                "ffprobe could not read {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let size = parse_probe_output(&output.stdout).ok_or_else(|| {
            CompositeError::invalid_image(format!("no video stream size in {}", path.display()))
        })?;
        log::debug!("Probed {}: {size}", path.display());
        Ok(size)
    }
}

fn parse_probe_output(stdout: &[u8]) -> Option<FrameSize> {
    let probe: ProbeOutput = serde_json::from_slice(stdout).ok()?;
    let stream = probe.streams.into_iter().next()?;
    Some(FrameSize::new(stream.width?, stream.height?))
}

fn tool_version(program: &Path) -> Result<String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| spawn_error(program, e))?;
    if !output.status.success() {
        return Err(CompositeError::BackendUnavailable(format!(
            "{} -version exited with {:?}",
            program.display(),
            output.status.code()
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(VERSION_RE
        .captures(&text)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "unknown".to_string()))
}

/// Check that ffmpeg and ffprobe are available and return the ffmpeg version
pub fn check_ffmpeg() -> Result<String> {
    FfmpegBackend::new().check()
}
