//! Tool Manager
//!
//! Detects, installs and resolves the external tools vidgrab drives
//! (yt-dlp, ffmpeg, ffprobe, AtomicParsley). The install directory on disk is
//! the only record of what is installed; nothing is cached between calls.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::installer::{ArchiveInstaller, Fetch, InstallError};
use crate::models::Tool;

/// What `ensure` had to do for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    /// Executable already at its canonical path.
    AlreadyInstalled,
    /// Present but not recognised as installed; trusted and registered.
    Registered,
    /// Present yt-dlp; a self-update was attempted.
    SelfUpdated,
    /// Downloaded and placed.
    Installed,
}

impl EnsureOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            EnsureOutcome::AlreadyInstalled => "already_installed",
            EnsureOutcome::Registered => "registered",
            EnsureOutcome::SelfUpdated => "self_updated",
            EnsureOutcome::Installed => "installed",
        }
    }
}

/// Filesystem view of one tool, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallState {
    pub present: bool,
    pub path: PathBuf,
}

/// Result of checking one tool during startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolReport {
    pub tool: Tool,
    pub path: PathBuf,
    pub outcome: Option<EnsureOutcome>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ToolReport {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Directories registered for tool lookup. Append-only; duplicates tolerated.
#[derive(Debug, Clone, Default)]
pub struct SearchPath {
    dirs: Arc<Mutex<Vec<PathBuf>>>,
}

impl SearchPath {
    pub fn push(&self, dir: &Path) {
        if let Ok(mut dirs) = self.dirs.lock() {
            dirs.push(dir.to_path_buf());
        }
    }

    pub fn dirs(&self) -> Vec<PathBuf> {
        self.dirs.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// `PATH` value for child processes: the system path followed by registered dirs.
    pub fn compose(&self) -> Option<OsString> {
        let mut all: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        all.extend(self.dirs());
        std::env::join_paths(all).ok()
    }
}

/// Executables handed to whatever runs the tools.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub yt_dlp: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
    pub atomic_parsley: Option<PathBuf>,
    /// `PATH` for child processes, so yt-dlp finds ffprobe and AtomicParsley.
    pub search_path: Option<OsString>,
}

impl ToolPaths {
    pub fn get(&self, tool: Tool) -> Option<&Path> {
        match tool {
            Tool::YtDlp => self.yt_dlp.as_deref(),
            Tool::Ffmpeg => self.ffmpeg.as_deref(),
            Tool::Ffprobe => self.ffprobe.as_deref(),
            Tool::AtomicParsley => self.atomic_parsley.as_deref(),
        }
    }

    fn set(&mut self, tool: Tool, path: Option<PathBuf>) {
        match tool {
            Tool::YtDlp => self.yt_dlp = path,
            Tool::Ffmpeg => self.ffmpeg = path,
            Tool::Ffprobe => self.ffprobe = path,
            Tool::AtomicParsley => self.atomic_parsley = path,
        }
    }
}

/// Tool Store configuration.
#[derive(Debug, Clone)]
pub struct ToolManagerConfig {
    /// Directory holding the installed binaries.
    pub install_dir: PathBuf,
    /// How long a yt-dlp self-update may take before it is abandoned.
    pub self_update_timeout: Duration,
}

impl ToolManagerConfig {
    pub fn new(install_dir: PathBuf) -> Self {
        Self {
            install_dir,
            self_update_timeout: Duration::from_secs(120),
        }
    }
}

/// Directory-backed registry of the four external tools.
pub struct ToolManager<F> {
    config: ToolManagerConfig,
    installer: ArchiveInstaller<F>,
    search_path: SearchPath,
}

impl<F: Fetch> ToolManager<F> {
    pub fn new(config: ToolManagerConfig, fetcher: F) -> Self {
        let installer = ArchiveInstaller::new(fetcher, config.install_dir.clone());
        Self {
            config,
            installer,
            search_path: SearchPath::default(),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.config.install_dir
    }

    /// Canonical location of a tool: install directory + tool name.
    pub fn tool_path(&self, tool: Tool) -> PathBuf {
        self.config.install_dir.join(tool.as_str())
    }

    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    pub fn state(&self, tool: Tool) -> InstallState {
        let path = self.tool_path(tool);
        InstallState {
            present: path.exists(),
            path,
        }
    }

    pub fn is_present(&self, tool: Tool) -> bool {
        self.tool_path(tool).exists()
    }

    /// A regular file at the canonical path that an executable lookup over the
    /// install directory resolves to.
    pub fn is_installed(&self, tool: Tool) -> bool {
        let path = self.tool_path(tool);
        if !path.is_file() {
            return false;
        }
        match which::which_in(tool.as_str(), Some(&self.config.install_dir), &self.config.install_dir)
        {
            Ok(found) => same_file(&found, &path),
            Err(_) => false,
        }
    }

    /// Make sure a tool is usable, installing it if nothing is at its canonical path.
    pub async fn ensure(&self, tool: Tool) -> Result<EnsureOutcome, InstallError> {
        let path = self.tool_path(tool);

        if self.is_installed(tool) {
            log::debug!("{} already installed at {}", tool, path.display());
            // Child processes still need the install dir to find it.
            self.search_path.push(&self.config.install_dir);
            return Ok(EnsureOutcome::AlreadyInstalled);
        }

        if path.exists() {
            self.search_path.push(&self.config.install_dir);
            if tool == Tool::YtDlp {
                self.self_update(tool).await;
                return Ok(EnsureOutcome::SelfUpdated);
            }
            log::info!("Using existing {} at {}", tool, path.display());
            return Ok(EnsureOutcome::Registered);
        }

        let spec = tool.spec();
        self.installer
            .fetch_and_place(spec.source_url, spec.archive, spec.member, &path)
            .await?;
        self.search_path.push(&self.config.install_dir);
        Ok(EnsureOutcome::Installed)
    }

    /// Check every tool in order. A failure never stops the remaining checks.
    pub async fn ensure_all(&self) -> Vec<ToolReport> {
        let mut reports = Vec::with_capacity(Tool::ALL.len());
        for tool in Tool::ALL {
            log::info!("Checking {}...", tool);
            let result = self.ensure(tool).await;
            let report = match result {
                Ok(outcome) => {
                    log::info!("{} OK ({})", tool, outcome.as_str());
                    ToolReport {
                        tool,
                        path: self.tool_path(tool),
                        outcome: Some(outcome),
                        error: None,
                        checked_at: Utc::now(),
                    }
                }
                Err(e) => {
                    log::error!("{} install failed: {}", tool, e);
                    ToolReport {
                        tool,
                        path: self.tool_path(tool),
                        outcome: None,
                        error: Some(e.to_string()),
                        checked_at: Utc::now(),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    /// Run the tool's own updater (`-U`). Best-effort: failures are only logged.
    ///
    /// Returns whether the updater exited successfully.
    pub async fn self_update(&self, tool: Tool) -> bool {
        let path = self.tool_path(tool);
        if tool != Tool::YtDlp || !path.exists() {
            return false;
        }

        let mut cmd = Command::new(&path);
        cmd.arg("-U")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.config.self_update_timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                log::info!("{} self-update: {}", tool, stdout.lines().last().unwrap_or("done"));
                true
            }
            Ok(Ok(output)) => {
                log::warn!(
                    "{} self-update exited with {}: {}",
                    tool,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Ok(Err(e)) => {
                log::warn!("Failed to run {} self-update: {}", tool, e);
                false
            }
            Err(_) => {
                log::warn!("{} self-update timed out", tool);
                false
            }
        }
    }

    /// Resolve each tool: canonical path if present, else the system `PATH`.
    pub fn resolved_paths(&self) -> ToolPaths {
        let mut paths = ToolPaths {
            search_path: self.search_path.compose(),
            ..ToolPaths::default()
        };
        for tool in Tool::ALL {
            let canonical = self.tool_path(tool);
            let resolved = if canonical.exists() {
                Some(canonical)
            } else {
                which::which(tool.as_str()).ok()
            };
            paths.set(tool, resolved);
        }
        paths
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
