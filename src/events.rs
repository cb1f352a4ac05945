use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{ProgressSnapshot, SessionPhase};

/// Status text shown when a session is stopped by the user.
pub const STATUS_CANCELLED: &str = "Download cancelled";
pub const STATUS_STARTING: &str = "Starting download...";
pub const STATUS_FINISHED: &str = "Download complete!";
pub const MESSAGE_SUCCESS: &str = "The video was downloaded successfully!";
pub const MESSAGE_MISSING_INPUT: &str = "Please enter a URL and a save folder";

/// Backend -> UI updates. Posted without waiting; the UI applies them in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum UiEvent {
    /// Session moved to a new lifecycle phase.
    Phase { id: Uuid, phase: SessionPhase },
    /// Progress bar value, 0..=100.
    Progress { percent: f64 },
    Status { text: String },
    /// Enablement of the start and stop affordances.
    Controls { start_enabled: bool, stop_enabled: bool },
    /// Hide the progress bar.
    ProgressHidden,
    InfoDialog { message: String },
    ErrorDialog { message: String },
}

/// Fire-and-forget sender for `UiEvent`s.
#[derive(Debug, Clone)]
pub struct UiSender {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never blocks. A closed UI is not an error for the sender.
    pub fn post(&self, event: UiEvent) {
        if let Err(e) = self.tx.send(event) {
            log::debug!("UI gone, dropping event: {:?}", e.0);
        }
    }

    pub fn progress(&self, percent: f64) {
        self.post(UiEvent::Progress { percent });
    }

    pub fn status(&self, text: impl Into<String>) {
        self.post(UiEvent::Status { text: text.into() });
    }

    pub fn controls(&self, start_enabled: bool, stop_enabled: bool) {
        self.post(UiEvent::Controls {
            start_enabled,
            stop_enabled,
        });
    }
}

/// The state the form reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationState {
    pub save_folder: String,
    pub url: String,
    pub quality: String,
    pub progress: ProgressSnapshot,
    pub progress_visible: bool,
    pub start_enabled: bool,
    pub stop_enabled: bool,
    pub phase: SessionPhase,
    /// Dialogs shown so far, oldest first.
    pub dialogs: Vec<UiEvent>,
}

impl PresentationState {
    pub fn new(save_folder: impl Into<String>, url: impl Into<String>, quality: impl Into<String>) -> Self {
        Self {
            save_folder: save_folder.into(),
            url: url.into(),
            quality: quality.into(),
            progress: ProgressSnapshot::default(),
            progress_visible: false,
            start_enabled: true,
            stop_enabled: false,
            phase: SessionPhase::Idle,
            dialogs: Vec::new(),
        }
    }

    pub fn apply(&mut self, event: &UiEvent) {
        match event {
            UiEvent::Phase { phase, .. } => {
                self.phase = *phase;
                match phase {
                    SessionPhase::Preparing => {
                        self.progress = ProgressSnapshot::default();
                        self.progress_visible = true;
                    }
                    SessionPhase::Succeeded | SessionPhase::Failed | SessionPhase::Cancelled => {
                        self.progress.terminal = true;
                    }
                    SessionPhase::Idle | SessionPhase::Running => {}
                }
            }
            UiEvent::Progress { percent } => {
                self.progress.percent = percent.clamp(0.0, 100.0);
            }
            UiEvent::Status { text } => self.progress.status = text.clone(),
            UiEvent::Controls {
                start_enabled,
                stop_enabled,
            } => {
                self.start_enabled = *start_enabled;
                self.stop_enabled = *stop_enabled;
            }
            UiEvent::ProgressHidden => self.progress_visible = false,
            UiEvent::InfoDialog { .. } | UiEvent::ErrorDialog { .. } => {
                self.dialogs.push(event.clone())
            }
        }
    }
}
