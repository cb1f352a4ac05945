//! Settings Manager
//!
//! Handles persistence and retrieval of user preferences using SQLite.
//! Settings are stored as JSON values keyed by setting name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::models::{default_quality, quality_height};

/// User settings structure with all configurable options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub updates: UpdateSettings,
}

/// General application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Default download folder path.
    #[serde(default = "default_download_folder")]
    pub download_folder: PathBuf,

    /// Quality label preselected in the form.
    #[serde(default = "default_quality_label")]
    pub default_quality: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            download_folder: default_download_folder(),
            default_quality: default_quality_label(),
        }
    }
}

/// Settings for tool archive downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-request limit; tool archives can be large.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl NetworkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSettings {
    /// Give up on `yt-dlp -U` after this long.
    #[serde(default = "default_self_update_timeout")]
    pub self_update_timeout_secs: u64,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            self_update_timeout_secs: default_self_update_timeout(),
        }
    }
}

impl UpdateSettings {
    pub fn self_update_timeout(&self) -> Duration {
        Duration::from_secs(self.self_update_timeout_secs)
    }
}

// Default value functions
fn default_download_folder() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("~/Downloads"))
}

fn default_quality_label() -> String {
    default_quality().to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    600
}

fn default_user_agent() -> String {
    format!("vidgrab/{}", env!("CARGO_PKG_VERSION"))
}

fn default_self_update_timeout() -> u64 {
    120
}

/// Settings keys used in the database.
pub mod keys {
    pub const USER_SETTINGS: &str = "user_settings";
    pub const LAST_DESTINATION: &str = "last_destination";
    pub const LAST_QUALITY: &str = "last_quality";
}

/// Settings manager for reading and writing settings to the database.
pub struct SettingsManager<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get a setting value by key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let result: Option<String> = self
            .conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query settings")?;

        match result {
            Some(json) => {
                let value: T =
                    serde_json::from_str(&json).context("Failed to deserialize setting")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value by key.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).context("Failed to serialize setting")?;

        self.conn
            .execute(
                "INSERT INTO settings (key, value_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
                params![key, json],
            )
            .context("Failed to save setting")?;

        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(())
    }

    /// Get the user settings, returning defaults if not set.
    pub fn get_user_settings(&self) -> Result<UserSettings> {
        self.get::<UserSettings>(keys::USER_SETTINGS)
            .map(|opt| opt.unwrap_or_default())
    }

    pub fn save_user_settings(&self, settings: &UserSettings) -> Result<()> {
        self.set(keys::USER_SETTINGS, settings)
    }

    pub fn get_last_destination(&self) -> Result<Option<PathBuf>> {
        self.get::<PathBuf>(keys::LAST_DESTINATION)
    }

    pub fn save_last_destination(&self, path: &Path) -> Result<()> {
        self.set(keys::LAST_DESTINATION, &path)
    }

    /// Last quality label used, ignoring stored values that no longer parse.
    pub fn get_last_quality(&self) -> Result<Option<String>> {
        Ok(self
            .get::<String>(keys::LAST_QUALITY)?
            .filter(|q| quality_height(q).is_some()))
    }

    pub fn save_last_quality(&self, label: &str) -> Result<()> {
        self.set(keys::LAST_QUALITY, &label)
    }

    /// Folder to prefill: last used, else the configured default.
    pub fn preferred_destination(&self) -> Result<PathBuf> {
        match self.get_last_destination()? {
            Some(p) => Ok(p),
            None => Ok(self.get_user_settings()?.general.download_folder),
        }
    }

    /// Quality to prefill: last used, else the configured default.
    pub fn preferred_quality(&self) -> Result<String> {
        match self.get_last_quality()? {
            Some(q) => Ok(q),
            None => Ok(self.get_user_settings()?.general.default_quality),
        }
    }
}
