//! Download Manager
//!
//! Owns the lifecycle of the single download session: validation, option
//! setup, handing the transfer to the background runtime, cooperative stop,
//! and exactly one terminal notification per session.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{
    UiEvent, UiSender, MESSAGE_MISSING_INPUT, MESSAGE_SUCCESS, STATUS_CANCELLED, STATUS_STARTING,
};
use crate::models::{quality_height, Outcome, SessionPhase};
use crate::progress::{ProgressReporter, ToolLease};
use crate::tool_manager::ToolPaths;
use crate::url_utils::clean_input_url;
use crate::ytdlp::{DownloadJob, DownloadOptions, MediaRunner, RunError};

/// What the form submits when the user presses start.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: String,
    pub quality: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("{0}")]
    Validation(String),

    #[error("a download is already in progress")]
    Busy,
}

/// Per-install settings applied to every session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub ffmpeg_location: Option<PathBuf>,
    /// Passed to the tool only if the file exists when the session starts.
    pub cookie_file: Option<PathBuf>,
    /// Ask yt-dlp for debug output; it lands in the log at debug level.
    pub verbose: bool,
}

impl SessionConfig {
    pub fn from_tools(tools: &ToolPaths, cookie_file: Option<PathBuf>) -> Self {
        Self {
            ffmpeg_location: tools.ffmpeg.clone(),
            cookie_file,
            verbose: false,
        }
    }
}

/// Read-only view of the session for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub session_id: Option<Uuid>,
    pub outcome: Option<Outcome>,
}

/// Returned by `start`; resolves once the session reaches a terminal state.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    done: watch::Receiver<Option<Outcome>>,
}

impl SessionHandle {
    pub async fn wait(&mut self) -> Outcome {
        loop {
            if let Some(outcome) = self.done.borrow_and_update().clone() {
                return outcome;
            }
            if self.done.changed().await.is_err() {
                return self.done.borrow().clone().unwrap_or(Outcome::Cancelled);
            }
        }
    }
}

enum SessionState {
    Idle,
    Preparing {
        id: Uuid,
    },
    Running {
        id: Uuid,
        cancel: CancellationToken,
        lease: Arc<ToolLease>,
        transfer: AbortHandle,
        done: watch::Sender<Option<Outcome>>,
    },
    Finished {
        id: Uuid,
        outcome: Outcome,
    },
}

impl SessionState {
    fn active_id(&self) -> Option<Uuid> {
        match self {
            SessionState::Preparing { id } | SessionState::Running { id, .. } => Some(*id),
            SessionState::Idle | SessionState::Finished { .. } => None,
        }
    }
}

struct Inner<R> {
    runtime: Handle,
    runner: Arc<R>,
    ui: UiSender,
    config: SessionConfig,
    state: Mutex<SessionState>,
}

/// Single-flight download session controller.
pub struct SessionController<R: MediaRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: MediaRunner> Clone for SessionController<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: MediaRunner> SessionController<R> {
    pub fn new(runtime: Handle, runner: R, ui: UiSender, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                runner: Arc::new(runner),
                ui,
                config,
                state: Mutex::new(SessionState::Idle),
            }),
        }
    }

    /// Start a download in the background. Never waits for the transfer.
    pub fn start(&self, request: DownloadRequest) -> Result<SessionHandle, StartError> {
        let (url, destination, height) = match validate(&request) {
            Ok(v) => v,
            Err(message) => {
                log::warn!("Rejected download request: {}", message);
                self.inner.ui.post(UiEvent::ErrorDialog {
                    message: message.clone(),
                });
                return Err(StartError::Validation(message));
            }
        };

        let mut state = self.inner.lock_state();
        if let Some(active) = state.active_id() {
            log::warn!("Download {} is already active", active);
            return Err(StartError::Busy);
        }

        let id = Uuid::new_v4();
        *state = SessionState::Preparing { id };
        let ui = &self.inner.ui;
        ui.post(UiEvent::Phase {
            id,
            phase: SessionPhase::Preparing,
        });
        ui.progress(0.0);
        ui.status(STATUS_STARTING);
        ui.controls(false, true);

        let cookie_file = self
            .inner
            .config
            .cookie_file
            .clone()
            .filter(|p| p.is_file());
        let options = DownloadOptions::for_destination(&destination, height)
            .with_ffmpeg_location(self.inner.config.ffmpeg_location.clone())
            .with_cookie_file(cookie_file)
            .with_verbose(self.inner.config.verbose);
        log::info!("Starting download {} of {} into {}", id, url, destination.display());

        let lease = Arc::new(ToolLease::new());
        let cancel = CancellationToken::new();
        let reporter = ProgressReporter::new(cancel.clone(), &lease, ui.clone());
        let job = DownloadJob { url, options };

        let runner = Arc::clone(&self.inner.runner);
        let transfer = self
            .inner
            .runtime
            .spawn(async move { runner.run(job, reporter).await });

        let (done_tx, done_rx) = watch::channel(None);
        *state = SessionState::Running {
            id,
            cancel,
            lease,
            transfer: transfer.abort_handle(),
            done: done_tx,
        };
        ui.post(UiEvent::Phase {
            id,
            phase: SessionPhase::Running,
        });

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let outcome = match transfer.await {
                Ok(Ok(())) => Outcome::Succeeded,
                Ok(Err(RunError::Aborted(_))) => Outcome::Cancelled,
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(e) if e.is_cancelled() => Outcome::Cancelled,
                Err(e) => {
                    log::error!("Download task for {} panicked: {}", id, e);
                    Outcome::Failed("the download task crashed unexpectedly".to_string())
                }
            };
            inner.finish(id, outcome);
        });

        Ok(SessionHandle { id, done: done_rx })
    }

    /// Stop the active session. Returns whether there was one to stop.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.finish_active(Outcome::Cancelled);
        if !stopped {
            log::debug!("Stop requested with no active download");
        }
        stopped
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.lock_state();
        match &*state {
            SessionState::Idle => SessionSnapshot {
                phase: SessionPhase::Idle,
                session_id: None,
                outcome: None,
            },
            SessionState::Preparing { id } => SessionSnapshot {
                phase: SessionPhase::Preparing,
                session_id: Some(*id),
                outcome: None,
            },
            SessionState::Running { id, .. } => SessionSnapshot {
                phase: SessionPhase::Running,
                session_id: Some(*id),
                outcome: None,
            },
            SessionState::Finished { id, outcome } => SessionSnapshot {
                phase: outcome.phase(),
                session_id: Some(*id),
                outcome: Some(outcome.clone()),
            },
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock_state().active_id().is_some()
    }
}

impl<R> Inner<R> {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the outcome of session `id` if it is still the active one.
    fn finish(&self, id: Uuid, outcome: Outcome) -> bool {
        let mut state = self.lock_state();
        if state.active_id() != Some(id) {
            log::debug!("Session {} already finished, ignoring {:?}", id, outcome);
            return false;
        }
        self.transition(&mut state, outcome);
        true
    }

    fn finish_active(&self, outcome: Outcome) -> bool {
        let mut state = self.lock_state();
        if state.active_id().is_none() {
            return false;
        }
        self.transition(&mut state, outcome);
        true
    }

    /// Move the active session to `Finished` and run the shared cleanup.
    /// Called with the state lock held so the terminal posts stay ordered.
    fn transition(&self, state: &mut SessionState, outcome: Outcome) {
        let Some(id) = state.active_id() else {
            return;
        };
        let previous = std::mem::replace(
            state,
            SessionState::Finished {
                id,
                outcome: outcome.clone(),
            },
        );

        let mut done = None;
        if let SessionState::Running {
            cancel,
            lease,
            transfer,
            done: done_tx,
            ..
        } = previous
        {
            cancel.cancel();
            lease.revoke();
            drop(lease);
            transfer.abort();
            done = Some(done_tx);
        }

        log::info!("Download {} finished: {:?}", id, outcome);
        self.ui.post(UiEvent::Phase {
            id,
            phase: outcome.phase(),
        });
        match &outcome {
            Outcome::Succeeded => self.ui.post(UiEvent::InfoDialog {
                message: MESSAGE_SUCCESS.to_string(),
            }),
            Outcome::Failed(message) => self.ui.post(UiEvent::ErrorDialog {
                message: format!("Download failed: {message}"),
            }),
            Outcome::Cancelled => self.ui.status(STATUS_CANCELLED),
        }
        self.ui.controls(true, false);
        self.ui.post(UiEvent::ProgressHidden);

        if let Some(done) = done {
            let _ = done.send(Some(outcome));
        }
    }
}

fn validate(request: &DownloadRequest) -> Result<(String, PathBuf, u32), String> {
    let url = clean_input_url(&request.url);
    let destination = request.destination.trim();
    if url.is_empty() || destination.is_empty() {
        return Err(MESSAGE_MISSING_INPUT.to_string());
    }
    let height = quality_height(&request.quality)
        .ok_or_else(|| format!("Unknown quality: {:?}", request.quality.trim()))?;
    Ok((url, PathBuf::from(destination), height))
}
