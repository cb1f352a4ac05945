use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Netscape-format cookie file handed to yt-dlp with `--cookies`.
#[derive(Debug, Clone)]
pub struct CookieStore {
    path: PathBuf,
}

impl CookieStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents. A missing file reads as empty.
    pub fn load(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => {
                Err(e).with_context(|| format!("read cookie file: {}", self.path.display()))
            }
        }
    }

    /// Replace the contents. The file is readable and writable by the owner only.
    pub fn save(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create cookie dir: {}", parent.display()))?;
        }
        fs::write(&self.path, text)
            .with_context(|| format!("write cookie file: {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut perms = fs::metadata(&self.path)
                .context("Failed to get cookie file metadata")?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)
                .context("Failed to set cookie file permissions")?;
        }

        log::info!("Saved cookies to {}", self.path.display());
        Ok(())
    }

    /// Copy cookies exported by a browser extension into the store.
    pub fn import(&self, source: &Path) -> Result<()> {
        let text = fs::read_to_string(source)
            .with_context(|| format!("read cookies from {}", source.display()))?;
        self.save(&text)
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("remove cookie file: {}", self.path.display()))
            }
        }
    }

    /// The path, if there is a file to pass to the downloader.
    pub fn existing_path(&self) -> Option<PathBuf> {
        self.path.is_file().then(|| self.path.clone())
    }
}
