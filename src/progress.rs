//! Progress Reporter
//!
//! Turns raw transfer events from the video-fetch tool into percent/status
//! updates for the UI, and is the point where a pending stop interrupts an
//! in-flight transfer.

use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::{UiSender, STATUS_FINISHED};

/// Raw progress event emitted by the tool while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        total_bytes_estimate: Option<u64>,
        /// Bytes per second.
        speed: Option<f64>,
    },
    Finished,
}

/// Returned by the reporter to tell the tool to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("download cancelled")]
pub struct Aborted;

/// Liveness token owned by a running session. The reporter only holds a weak
/// reference, so once the controller revokes or drops its lease the reporter
/// stops posting and tells the tool to abort.
#[derive(Debug)]
pub struct ToolLease {
    /// Held by the reporter while it checks liveness and posts.
    live: Mutex<bool>,
}

impl Default for ToolLease {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolLease {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(true),
        }
    }

    /// Mark the lease dead. Waits for an in-flight `on_event` to finish
    /// posting, so nothing from the reporter lands after this returns.
    pub fn revoke(&self) {
        *self.live.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }
}

/// Reporter handed to the tool for the lifetime of one session.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    cancel: CancellationToken,
    lease: Weak<ToolLease>,
    ui: UiSender,
}

impl ProgressReporter {
    pub fn new(cancel: CancellationToken, lease: &Arc<ToolLease>, ui: UiSender) -> Self {
        Self {
            cancel,
            lease: Arc::downgrade(lease),
            ui,
        }
    }

    /// Whether the session this reporter belongs to still wants progress.
    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && self.lease.strong_count() > 0
    }

    /// Token cancelled when the session is stopped.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Handle one event. `Err(Aborted)` means the tool must stop now.
    pub fn on_event(&self, event: &ProgressEvent) -> Result<(), Aborted> {
        let lease = self.lease.upgrade().ok_or(Aborted)?;
        let live = lease.live.lock().unwrap_or_else(|e| e.into_inner());
        if !*live || self.cancel.is_cancelled() {
            return Err(Aborted);
        }

        match event {
            ProgressEvent::Downloading {
                downloaded_bytes,
                total_bytes,
                total_bytes_estimate,
                speed,
            } => {
                let total = total_bytes
                    .filter(|t| *t > 0)
                    .or(*total_bytes_estimate)
                    .unwrap_or(0);
                if let Some(percent) = percent_of(*downloaded_bytes, total) {
                    let text = format!(
                        "Downloading: {:.1}%, speed: {}",
                        percent,
                        format_speed(*speed)
                    );
                    self.ui.progress(percent);
                    self.ui.status(text);
                }
            }
            ProgressEvent::Finished => {
                self.ui.progress(100.0);
                self.ui.status(STATUS_FINISHED);
            }
        }
        Ok(())
    }
}

/// `downloaded / total * 100`, or nothing when the total is unknown.
pub fn percent_of(downloaded: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(downloaded as f64 / total as f64 * 100.0)
}

/// Transfer rate in MB/s with one decimal, or a placeholder when unknown.
pub fn format_speed(bytes_per_sec: Option<f64>) -> String {
    match bytes_per_sec {
        Some(s) if s.is_finite() && s > 0.0 => format!("{:.1} MB/s", s / 1024.0 / 1024.0),
        _ => "computing...".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UiEvent;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn reporter() -> (
        ProgressReporter,
        Arc<ToolLease>,
        UnboundedReceiver<UiEvent>,
    ) {
        let (ui, rx) = UiSender::channel();
        let lease = Arc::new(ToolLease::new());
        let reporter = ProgressReporter::new(CancellationToken::new(), &lease, ui);
        (reporter, lease, rx)
    }

    fn downloading(downloaded: u64, total: Option<u64>, speed: Option<f64>) -> ProgressEvent {
        ProgressEvent::Downloading {
            downloaded_bytes: downloaded,
            total_bytes: total,
            total_bytes_estimate: None,
            speed,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_half_way_is_fifty_percent() {
        let (r, _lease, mut rx) = reporter();
        r.on_event(&downloading(500_000, Some(1_000_000), Some(1_572_864.0)))
            .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                UiEvent::Progress { percent: 50.0 },
                UiEvent::Status {
                    text: "Downloading: 50.0%, speed: 1.5 MB/s".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_unknown_total_posts_nothing() {
        let (r, _lease, mut rx) = reporter();
        r.on_event(&downloading(500, None, None)).unwrap();
        r.on_event(&downloading(500, Some(0), None)).unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_estimate_used_when_total_missing() {
        let (r, _lease, mut rx) = reporter();
        r.on_event(&ProgressEvent::Downloading {
            downloaded_bytes: 250,
            total_bytes: None,
            total_bytes_estimate: Some(1000),
            speed: None,
        })
        .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                UiEvent::Progress { percent: 25.0 },
                UiEvent::Status {
                    text: "Downloading: 25.0%, speed: computing...".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_finished_posts_full_bar() {
        let (r, _lease, mut rx) = reporter();
        r.on_event(&ProgressEvent::Finished).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                UiEvent::Progress { percent: 100.0 },
                UiEvent::Status {
                    text: STATUS_FINISHED.to_string()
                },
            ]
        );
    }

    #[test]
    fn test_cancelled_token_aborts_without_posting() {
        let (r, _lease, mut rx) = reporter();
        r.cancel_token().cancel();
        assert_eq!(r.on_event(&downloading(1, Some(2), None)), Err(Aborted));
        assert_eq!(r.on_event(&ProgressEvent::Finished), Err(Aborted));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_dropped_lease_aborts() {
        let (r, lease, mut rx) = reporter();
        drop(lease);
        assert_eq!(r.on_event(&downloading(1, Some(2), None)), Err(Aborted));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_revoked_lease_aborts() {
        let (r, lease, mut rx) = reporter();
        r.on_event(&downloading(1, Some(2), None)).unwrap();
        assert!(!drain(&mut rx).is_empty());

        lease.revoke();
        assert!(r.is_live());
        assert_eq!(r.on_event(&ProgressEvent::Finished), Err(Aborted));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_percent_is_monotonic_for_increasing_bytes() {
        let total = 7_340_033u64;
        let mut last = -1.0;
        for downloaded in (0..=total).step_by(65_537) {
            let p = percent_of(downloaded, total).unwrap();
            assert!(p >= last, "{p} < {last}");
            last = p;
        }
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(Some(3.0 * 1024.0 * 1024.0)), "3.0 MB/s");
        assert_eq!(format_speed(Some(512.0 * 1024.0)), "0.5 MB/s");
        assert_eq!(format_speed(Some(0.0)), "computing...");
        assert_eq!(format_speed(None), "computing...");
        assert_eq!(format_speed(Some(f64::NAN)), "computing...");
    }
}
