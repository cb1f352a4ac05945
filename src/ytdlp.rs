use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::progress::{Aborted, ProgressEvent, ProgressReporter};
use crate::tool_manager::ToolPaths;

/// Container every download ends up in.
pub const TARGET_CONTAINER: &str = "mp4";

/// Marker prefixed to every progress line we ask yt-dlp to print.
const PROGRESS_MARKER: &str = "[vidgrab]";

/// Keep this many stderr lines for the failure message.
const STDERR_TAIL_LINES: usize = 50;

/// Post-processing steps run by yt-dlp after the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessor {
    /// Re-encode into the given container.
    ConvertVideo(String),
    EmbedThumbnail,
}

impl PostProcessor {
    fn args(&self) -> Vec<String> {
        match self {
            PostProcessor::ConvertVideo(format) => {
                vec!["--recode-video".to_string(), format.clone()]
            }
            PostProcessor::EmbedThumbnail => vec!["--embed-thumbnail".to_string()],
        }
    }
}

/// Every option vidgrab passes to yt-dlp.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOptions {
    /// Output path template, e.g. `/videos/%(title)s.%(ext)s`.
    pub output_template: String,
    /// yt-dlp format selector.
    pub format: String,
    pub merge_output_format: String,
    pub ffmpeg_location: Option<PathBuf>,
    pub cookie_file: Option<PathBuf>,
    pub post_processors: Vec<PostProcessor>,
    pub verbose: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output_template: "%(title)s.%(ext)s".to_string(),
            format: format_selector(None),
            merge_output_format: TARGET_CONTAINER.to_string(),
            ffmpeg_location: None,
            cookie_file: None,
            post_processors: vec![
                PostProcessor::ConvertVideo(TARGET_CONTAINER.to_string()),
                PostProcessor::EmbedThumbnail,
            ],
            verbose: false,
        }
    }
}

impl DownloadOptions {
    /// Options for saving into `destination` with videos no taller than `max_height`.
    pub fn for_destination(destination: &Path, max_height: u32) -> Self {
        Self {
            output_template: destination
                .join("%(title)s.%(ext)s")
                .to_string_lossy()
                .to_string(),
            format: format_selector(Some(max_height)),
            ..Self::default()
        }
    }

    pub fn with_ffmpeg_location(mut self, path: Option<PathBuf>) -> Self {
        self.ffmpeg_location = path;
        self
    }

    pub fn with_cookie_file(mut self, path: Option<PathBuf>) -> Self {
        self.cookie_file = path;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Full yt-dlp argument list, URL last.
    pub fn to_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            format!(
                "download:{PROGRESS_MARKER} %(progress.status)s %(progress.downloaded_bytes)s \
                 %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.speed)s"
            ),
            "-o".to_string(),
            self.output_template.clone(),
            "-f".to_string(),
            self.format.clone(),
            "--merge-output-format".to_string(),
            self.merge_output_format.clone(),
        ];

        if let Some(ref ffmpeg) = self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().to_string());
        }

        if let Some(ref cookies) = self.cookie_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }

        for pp in &self.post_processors {
            args.extend(pp.args());
        }

        if self.verbose {
            args.push("--verbose".to_string());
        }

        args.push(url.to_string());
        args
    }
}

/// H.264 video + AAC audio muxed into mp4, falling back to the best mp4.
pub fn format_selector(max_height: Option<u32>) -> String {
    let height = max_height
        .map(|h| format!("[height<={h}]"))
        .unwrap_or_default();
    format!(
        "bestvideo[vcodec=h264]{height}[ext=mp4]+bestaudio[acodec=aac][ext=m4a]/best[ext={TARGET_CONTAINER}]"
    )
}

/// One download to execute.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub options: DownloadOptions,
}

/// Why a run ended without success.
#[derive(Debug, Error)]
pub enum RunError {
    /// The reporter asked the tool to stop.
    #[error(transparent)]
    Aborted(#[from] Aborted),

    #[error("yt-dlp is not installed")]
    ToolMissing,

    #[error("failed to start yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{0}")]
    Tool(String),

    #[error("i/o error while running yt-dlp: {0}")]
    Io(#[source] std::io::Error),
}

/// Executes a download job, feeding progress to the reporter.
///
/// Implementations must stop promptly once `reporter.on_event` returns
/// `Err(Aborted)` or the reporter's cancel token fires.
pub trait MediaRunner: Send + Sync + 'static {
    fn run(
        &self,
        job: DownloadJob,
        reporter: ProgressReporter,
    ) -> impl Future<Output = Result<(), RunError>> + Send;
}

/// Runs yt-dlp as a child process.
#[derive(Debug, Clone)]
pub struct YtDlpRunner {
    tools: ToolPaths,
}

impl YtDlpRunner {
    pub fn new(tools: ToolPaths) -> Self {
        Self { tools }
    }
}

impl MediaRunner for YtDlpRunner {
    async fn run(&self, job: DownloadJob, reporter: ProgressReporter) -> Result<(), RunError> {
        let program = self.tools.yt_dlp.clone().ok_or(RunError::ToolMissing)?;
        let args = job.options.to_args(&job.url);
        log::info!("Running {} {:?}", program.display(), args);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref path) = self.tools.search_path {
            cmd.env("PATH", path);
        }

        let mut child = cmd.spawn().map_err(RunError::Spawn)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Tool("failed to capture yt-dlp stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunError::Tool("failed to capture yt-dlp stderr".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

        while stdout_open || stderr_open {
            tokio::select! {
                _ = reporter.cancel_token().cancelled() => {
                    log::info!("Stop requested, killing yt-dlp");
                    let _ = child.kill().await;
                    return Err(Aborted.into());
                }
                line = stdout_reader.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(l)) => match parse_progress_line(&l) {
                            Some(event) => {
                                if let Err(abort) = reporter.on_event(&event) {
                                    log::info!("Progress callback aborted the transfer");
                                    let _ = child.kill().await;
                                    return Err(abort.into());
                                }
                            }
                            None => log::debug!("yt-dlp: {}", l),
                        },
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            log::error!("Error reading yt-dlp stdout: {}", e);
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(l)) => {
                            log::debug!("yt-dlp stderr: {}", l);
                            if stderr_tail.len() == STDERR_TAIL_LINES {
                                stderr_tail.pop_front();
                            }
                            stderr_tail.push_back(l);
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            log::error!("Error reading yt-dlp stderr: {}", e);
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        // Streams can close before the process exits (post-processing, or a
        // child that closed its fds). Stop must still reach it.
        let status = tokio::select! {
            _ = reporter.cancel_token().cancelled() => {
                log::info!("Stop requested after output closed, killing yt-dlp");
                let _ = child.kill().await;
                return Err(Aborted.into());
            }
            status = child.wait() => status.map_err(RunError::Io)?,
        };
        if !status.success() {
            let lines: Vec<String> = stderr_tail.into_iter().collect();
            return Err(RunError::Tool(failure_message(&lines, status.code())));
        }
        Ok(())
    }
}

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[vidgrab\]\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)")
            .expect("progress regex is valid")
    })
}

/// Parse a line printed through our `--progress-template`.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let caps = progress_re().captures(line.trim())?;
    let field = |i: usize| caps.get(i).map(|m| m.as_str()).and_then(parse_number);

    match caps.get(1)?.as_str() {
        "downloading" => Some(ProgressEvent::Downloading {
            downloaded_bytes: field(2).map(|v| v as u64).unwrap_or(0),
            total_bytes: field(3).map(|v| v as u64),
            total_bytes_estimate: field(4).map(|v| v as u64),
            speed: field(5),
        }),
        "finished" => Some(ProgressEvent::Finished),
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<f64> {
    match s {
        "NA" | "None" | "N/A" => None,
        _ => s.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0),
    }
}

/// Message for the failure dialog: the last `ERROR:` line, else the last stderr line.
fn failure_message(stderr: &[String], code: Option<i32>) -> String {
    let line = stderr
        .iter()
        .rev()
        .find(|l| l.contains("ERROR:"))
        .or_else(|| stderr.iter().rev().find(|l| !l.trim().is_empty()));

    match line {
        Some(l) => {
            let l = l.trim();
            let l = l.strip_prefix("ERROR:").map(str::trim).unwrap_or(l);
            if l.chars().count() > 300 {
                format!("{}…", l.chars().take(300).collect::<String>())
            } else {
                l.to_string()
            }
        }
        None => match code {
            Some(c) => format!("yt-dlp exited with status {c}"),
            None => "yt-dlp was terminated".to_string(),
        },
    }
}
