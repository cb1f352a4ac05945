use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::runtime::Handle;

pub mod cookies;
pub mod db;
pub mod download_manager;
pub mod events;
pub mod installer;
pub mod logging;
pub mod models;
pub mod progress;
pub mod settings;
pub mod tool_manager;
pub mod url_utils;
pub mod ytdlp;

use cookies::CookieStore;
use db::{AppDirs, Db};
use download_manager::{SessionConfig, SessionController};
use events::UiSender;
use installer::HttpFetcher;
use settings::{SettingsManager, UserSettings};
use tool_manager::{ToolManager, ToolManagerConfig, ToolPaths, ToolReport};
use ytdlp::YtDlpRunner;

/// Everything the front end needs, opened once at startup.
pub struct App {
    dirs: AppDirs,
    db: Db,
    settings: UserSettings,
}

impl App {
    /// Open state rooted at `data` instead of the per-user location.
    pub fn open_at(data: PathBuf) -> Result<Self> {
        Self::from_dirs(AppDirs::create(data)?)
    }

    /// Open state in directories that already exist.
    pub fn from_dirs(dirs: AppDirs) -> Result<Self> {
        let db = Db::open(&dirs)?;
        let settings = SettingsManager::new(db.conn())
            .get_user_settings()
            .context("load user settings")?;
        log::info!("State directory: {}", dirs.data.display());
        Ok(Self { dirs, db, settings })
    }

    pub fn dirs(&self) -> &AppDirs {
        &self.dirs
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn user_settings(&self) -> &UserSettings {
        &self.settings
    }

    pub fn settings(&self) -> SettingsManager<'_> {
        SettingsManager::new(self.db.conn())
    }

    pub fn cookies(&self) -> CookieStore {
        CookieStore::new(self.dirs.cookie_path())
    }

    /// Tool Store over the per-user tools directory, using the configured network settings.
    pub fn tool_manager(&self) -> Result<ToolManager<HttpFetcher>> {
        let network = &self.settings.network;
        let fetcher = HttpFetcher::new(
            network.connect_timeout(),
            network.request_timeout(),
            &network.user_agent,
        )?;
        let config = ToolManagerConfig {
            self_update_timeout: self.settings.updates.self_update_timeout(),
            ..ToolManagerConfig::new(self.dirs.tools.clone())
        };
        Ok(ToolManager::new(config, fetcher))
    }

    /// Run every tool check and remember the results.
    pub async fn check_tools(&mut self, tools: &ToolManager<HttpFetcher>) -> Vec<ToolReport> {
        let reports = tools.ensure_all().await;
        for report in &reports {
            if let Err(e) = self.db.record_tool_check(report) {
                log::warn!("Failed to record check for {}: {:#}", report.tool, e);
            }
        }
        reports
    }

    /// Controller wired to yt-dlp and the cookie file.
    pub fn session_controller(
        &self,
        runtime: Handle,
        tools: ToolPaths,
        ui: UiSender,
        verbose: bool,
    ) -> SessionController<YtDlpRunner> {
        let config = SessionConfig {
            verbose,
            ..SessionConfig::from_tools(&tools, Some(self.dirs.cookie_path()))
        };
        SessionController::new(runtime, YtDlpRunner::new(tools), ui, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tool;

    #[test]
    fn test_open_at_lays_out_state() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open_at(dir.path().to_path_buf()).unwrap();

        assert!(app.dirs().tools.is_dir());
        assert!(app.db().path().ends_with("vidgrab.sqlite3"));
        assert_eq!(app.cookies().path(), dir.path().join("cookies.txt"));
        assert_eq!(app.user_settings(), &UserSettings::default());

        let tm = app.tool_manager().unwrap();
        assert_eq!(tm.tool_path(Tool::YtDlp), dir.path().join("tools").join("yt-dlp"));
    }

    #[test]
    fn test_settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let app = App::open_at(dir.path().to_path_buf()).unwrap();
            app.settings().save_last_quality("720p (HD)").unwrap();
        }
        let app = App::open_at(dir.path().to_path_buf()).unwrap();
        assert_eq!(app.settings().preferred_quality().unwrap(), "720p (HD)");
    }
}
