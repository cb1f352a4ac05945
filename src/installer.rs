//! Archive Installer
//!
//! Fetches a tool payload into the install directory, unpacks it when it is a
//! zip, and moves the expected binary to its canonical path.

use std::fs::File;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use zip::ZipArchive;

use crate::models::ArchiveKind;

/// Errors raised while provisioning a tool.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to fetch {url}: {message}")]
    Transport { url: String, message: String },

    #[error("archive {path} is unreadable: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("archive does not contain expected member `{member}`")]
    MissingMember { member: String },

    #[error("{action} {path}: {source}")]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("install worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl InstallError {
    fn fs(action: &'static str, path: &Path, source: io::Error) -> Self {
        InstallError::Filesystem {
            action,
            path: path.to_path_buf(),
            source,
        }
    }

    fn transport(url: &str, message: impl ToString) -> Self {
        InstallError::Transport {
            url: url.to_string(),
            message: message.to_string(),
        }
    }
}

/// Streams a URL to a local file. Returns the number of bytes written.
pub trait Fetch: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, InstallError>> + Send;
}

/// HTTP transport backed by reqwest. No retry, no resumption, no integrity check.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| InstallError::transport("<client>", e))?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, InstallError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| InstallError::transport(url, e))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| InstallError::fs("create", dest, e))?;

        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| InstallError::transport(url, e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| InstallError::fs("write", dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| InstallError::fs("flush", dest, e))?;

        log::debug!("Fetched {} bytes from {} into {}", written, url, dest.display());
        Ok(written)
    }
}

/// Places fetched tool payloads into a single install directory.
#[derive(Debug, Clone)]
pub struct ArchiveInstaller<F> {
    fetcher: F,
    install_dir: PathBuf,
}

impl<F: Fetch> ArchiveInstaller<F> {
    pub fn new(fetcher: F, install_dir: PathBuf) -> Self {
        Self {
            fetcher,
            install_dir,
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Fetch `url`, unpack if needed, and place `member` at `destination` with mode 0755.
    ///
    /// The temporary download is always removed. On a missing member the
    /// destination is left absent.
    pub async fn fetch_and_place(
        &self,
        url: &str,
        archive: ArchiveKind,
        member: &str,
        destination: &Path,
    ) -> Result<(), InstallError> {
        tokio::fs::create_dir_all(&self.install_dir)
            .await
            .map_err(|e| InstallError::fs("create", &self.install_dir, e))?;

        let temp_path = self.temp_path(member, archive);
        let result = self
            .fetch_and_place_inner(url, archive, member, destination, &temp_path)
            .await;
        remove_file_quiet(&temp_path);
        result
    }

    async fn fetch_and_place_inner(
        &self,
        url: &str,
        archive: ArchiveKind,
        member: &str,
        destination: &Path,
        temp_path: &Path,
    ) -> Result<(), InstallError> {
        log::info!("Downloading {} from {}", member, url);
        self.fetcher.fetch(url, temp_path).await?;

        match archive {
            ArchiveKind::None => {
                tokio::fs::rename(temp_path, destination)
                    .await
                    .map_err(|e| InstallError::fs("rename", destination, e))?;
            }
            ArchiveKind::Zip => {
                let archive_path = temp_path.to_path_buf();
                let staging = self.install_dir.join(format!(".{member}.extract"));
                let member = member.to_string();
                let destination = destination.to_path_buf();
                // Decompression is blocking work; keep it off the runtime workers.
                tokio::task::spawn_blocking(move || {
                    unpack_member(&archive_path, &staging, &member, &destination)
                })
                .await??;
            }
        }

        mark_executable(destination)?;
        log::info!("Installed {} at {}", member, destination.display());
        Ok(())
    }

    fn temp_path(&self, member: &str, archive: ArchiveKind) -> PathBuf {
        match archive {
            ArchiveKind::Zip => self.install_dir.join(format!("{member}.zip")),
            ArchiveKind::None => self.install_dir.join(format!("{member}.download")),
        }
    }
}

/// Extract `member` through `staging`, which is removed whatever the outcome.
fn unpack_member(
    archive_path: &Path,
    staging: &Path,
    member: &str,
    destination: &Path,
) -> Result<(), InstallError> {
    let placed = extract_member(archive_path, staging, member, destination);
    if let Err(e) = std::fs::remove_dir_all(staging) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove staging dir {}: {}", staging.display(), e);
        }
    }
    placed
}

/// Unpack every entry of `archive_path` into `staging`, then move the
/// top-level `member` to `destination`.
fn extract_member(
    archive_path: &Path,
    staging: &Path,
    member: &str,
    destination: &Path,
) -> Result<(), InstallError> {
    extract_zip(archive_path, staging)?;

    let extracted = staging.join(member);
    if !extracted.is_file() {
        log::error!("Archive {} has no `{}` entry", archive_path.display(), member);
        return Err(InstallError::MissingMember {
            member: member.to_string(),
        });
    }

    std::fs::rename(&extracted, destination)
        .map_err(|e| InstallError::fs("rename", destination, e))
}

fn extract_zip(archive_path: &Path, destination: &Path) -> Result<(), InstallError> {
    let archive_err = |source| InstallError::Archive {
        path: archive_path.to_path_buf(),
        source,
    };

    let file = File::open(archive_path).map_err(|e| InstallError::fs("open", archive_path, e))?;
    let mut archive = ZipArchive::new(file).map_err(archive_err)?;

    std::fs::create_dir_all(destination)
        .map_err(|e| InstallError::fs("create", destination, e))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(archive_err)?;
        let outpath = match entry.enclosed_name() {
            Some(path) => destination.join(path),
            None => {
                log::warn!("Skipping unsafe archive entry {}", entry.name());
                continue;
            }
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .map_err(|e| InstallError::fs("create", &outpath, e))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent).map_err(|e| InstallError::fs("create", parent, e))?;
        }
        let mut outfile =
            File::create(&outpath).map_err(|e| InstallError::fs("create", &outpath, e))?;
        io::copy(&mut entry, &mut outfile).map_err(|e| InstallError::fs("write", &outpath, e))?;
    }

    Ok(())
}

fn mark_executable(path: &Path) -> Result<(), InstallError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| InstallError::fs("chmod", path, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn remove_file_quiet(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Serves a fixed payload for every URL and counts requests.
    #[derive(Clone, Default)]
    pub(crate) struct FakeFetcher {
        pub payload: Arc<Vec<u8>>,
        pub calls: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl FakeFetcher {
        pub fn serving(payload: Vec<u8>) -> Self {
            Self {
                payload: Arc::new(payload),
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetch for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, InstallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(InstallError::transport(url, "connection refused"));
            }
            std::fs::write(dest, self.payload.as_slice())
                .map_err(|e| InstallError::fs("write", dest, e))?;
            Ok(self.payload.len() as u64)
        }
    }

    pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_zip_member_is_placed_and_executable() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::serving(zip_bytes(&[("ffmpeg", b"binary"), ("LICENSE", b"x")]));
        let installer = ArchiveInstaller::new(fetcher.clone(), dir.path().to_path_buf());
        let dest = dir.path().join("ffmpeg");

        installer
            .fetch_and_place("https://example.com/ffmpeg.zip", ArchiveKind::Zip, "ffmpeg", &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"binary");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        assert!(!dir.path().join("ffmpeg.zip").exists());
        assert_eq!(leftovers(dir.path()), vec!["ffmpeg".to_string()]);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_member_leaves_destination_absent() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::serving(zip_bytes(&[("nested/ffprobe", b"binary")]));
        let installer = ArchiveInstaller::new(fetcher, dir.path().to_path_buf());
        let dest = dir.path().join("ffprobe");

        let err = installer
            .fetch_and_place("https://example.com/ffprobe.zip", ArchiveKind::Zip, "ffprobe", &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::MissingMember { ref member } if member == "ffprobe"));
        assert!(!dest.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_zip_is_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::serving(b"definitely not a zip".to_vec());
        let installer = ArchiveInstaller::new(fetcher, dir.path().to_path_buf());
        let dest = dir.path().join("AtomicParsley");

        let err = installer
            .fetch_and_place("https://example.com/ap.zip", ArchiveKind::Zip, "AtomicParsley", &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::Archive { .. }));
        assert!(!dest.exists());
        assert!(!dir.path().join("AtomicParsley.zip").exists());
    }

    #[tokio::test]
    async fn test_plain_payload_is_moved_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::serving(b"#!/bin/sh\necho yt-dlp\n".to_vec());
        let installer = ArchiveInstaller::new(fetcher, dir.path().to_path_buf());
        let dest = dir.path().join("yt-dlp");

        installer
            .fetch_and_place("https://example.com/yt-dlp", ArchiveKind::None, "yt-dlp", &dest)
            .await
            .unwrap();

        assert!(dest.is_file());
        assert!(!dir.path().join("yt-dlp.download").exists());
    }

    #[tokio::test]
    async fn test_transport_error_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let installer = ArchiveInstaller::new(FakeFetcher::failing(), dir.path().to_path_buf());
        let dest = dir.path().join("ffmpeg");

        let err = installer
            .fetch_and_place("https://example.com/ffmpeg.zip", ArchiveKind::Zip, "ffmpeg", &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::Transport { .. }));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_http_fetcher_streams_body_to_disk() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = vec![7u8; 64 * 1024];
        let served = body.clone();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                served.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(&served).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("payload.download");
        let fetcher =
            HttpFetcher::new(Duration::from_secs(5), Duration::from_secs(10), "vidgrab-test")
                .unwrap();

        let written = fetcher
            .fetch(&format!("http://{addr}/payload"), &dest)
            .await
            .unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_http_fetcher_rejects_error_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let fetcher =
            HttpFetcher::new(Duration::from_secs(5), Duration::from_secs(10), "vidgrab-test")
                .unwrap();

        let err = fetcher
            .fetch(&format!("http://{addr}/missing"), &dir.path().join("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::Transport { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_zip_install_on_single_threaded_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![7u8; 4 * 1024 * 1024];
        let fetcher = FakeFetcher::serving(zip_bytes(&[("ffprobe", payload.as_slice())]));
        let installer = ArchiveInstaller::new(fetcher, dir.path().to_path_buf());
        let dest = dir.path().join("ffprobe");

        installer
            .fetch_and_place("https://example.com/ffprobe.zip", ArchiveKind::Zip, "ffprobe", &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::metadata(&dest).unwrap().len(), payload.len() as u64);
        assert_eq!(leftovers(dir.path()), vec!["ffprobe".to_string()]);
    }

    #[tokio::test]
    async fn test_crashed_worker_is_reported() {
        let join_err = tokio::task::spawn_blocking(|| {
            if true {
                panic!("extraction crashed");
            }
        })
        .await
        .unwrap_err();

        let err = InstallError::from(join_err);
        assert!(matches!(err, InstallError::Worker(_)));
        assert!(err.to_string().starts_with("install worker failed"));
    }
}
