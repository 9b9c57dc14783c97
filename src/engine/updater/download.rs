//! HTTP Download Manager
//!
//! Streams patch archives to disk with progress tracking. Each attempt
//! writes its own `<dest>.<attempt>.partial` file, which is only renamed to
//! its final name once the transfer completed and the caller still wants
//! the result. A cancelled attempt removes its own file and nothing else.

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use std::fs::{self, File};
use std::io::{self, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Download result with metadata
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub bytes_downloaded: u64,
}

/// Snapshot of a transfer in flight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub downloaded: u64,
    /// Expected size, from `Content-Length` or the published size
    pub total: Option<u64>,
}

impl Progress {
    /// Completed fraction in `[0.0, 1.0]`, `0.0` while the size is unknown
    pub fn fraction(&self) -> f32 {
        match self.total {
            Some(total) if total > 0 => (self.downloaded as f64 / total as f64).clamp(0.0, 1.0) as f32,
            _ => 0.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No downloadable resource published")]
    NoResource,

    #[error("Download cancelled")]
    Cancelled,
}

/// Download settings
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub system_proxy: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            user_agent: "Hotpatch-Updater".to_string(),
            system_proxy: true,
        }
    }
}

/// Download manager for patch archives
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    /// Create a downloader with the given transport settings
    pub fn new(options: &DownloadOptions) -> Result<Self, DownloadError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout);
        if !options.system_proxy {
            builder = builder.no_proxy();
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Download `url` to `dest`.
    ///
    /// `attempt` tags the partial file, so overlapping attempts on the same
    /// destination never share one. `on_progress` is called after every received chunk and once more
    /// before the partial file is promoted. Returning `ControlFlow::Break`
    /// stops the transfer with `DownloadError::Cancelled`. Whatever the
    /// failure, no partial file is left behind.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        attempt: u64,
        expected_size: Option<u64>,
        mut on_progress: F,
    ) -> Result<DownloadResult, DownloadError>
    where
        F: FnMut(Progress) -> ControlFlow<()>,
    {
        let partial_path = partial_path(dest, attempt);
        if let Some(parent) = partial_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let result = self
            .fetch_to(url, &partial_path, expected_size, &mut on_progress)
            .await;

        let downloaded = match result {
            Ok(downloaded) => downloaded,
            Err(e) => {
                let _ = fs::remove_file(&partial_path);
                return Err(e);
            }
        };

        // Final check before promotion
        let last = Progress {
            downloaded,
            total: Some(downloaded),
        };
        if on_progress(last).is_break() {
            let _ = fs::remove_file(&partial_path);
            return Err(DownloadError::Cancelled);
        }

        fs::rename(&partial_path, dest)?;

        Ok(DownloadResult {
            path: dest.to_path_buf(),
            bytes_downloaded: downloaded,
        })
    }

    async fn fetch_to<F>(
        &self,
        url: &str,
        partial_path: &Path,
        expected_size: Option<u64>,
        on_progress: &mut F,
    ) -> Result<u64, DownloadError>
    where
        F: FnMut(Progress) -> ControlFlow<()>,
    {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(DownloadError::InvalidResponse(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .or(expected_size);

        let mut file = File::create(partial_path)?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;

            if on_progress(Progress { downloaded, total }).is_break() {
                return Err(DownloadError::Cancelled);
            }
        }

        file.flush()?;
        file.sync_all()?;
        debug!(url, bytes = downloaded, "transfer complete");

        Ok(downloaded)
    }
}

fn partial_path(dest: &Path, attempt: u64) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(format!(".{}.partial", attempt));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let p = Progress {
            downloaded: 50,
            total: Some(200),
        };
        assert_eq!(p.fraction(), 0.25);

        let unknown = Progress {
            downloaded: 50,
            total: None,
        };
        assert_eq!(unknown.fraction(), 0.0);

        let overshoot = Progress {
            downloaded: 300,
            total: Some(200),
        };
        assert_eq!(overshoot.fraction(), 1.0);
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/tmp/patch_5.zip"), 7),
            PathBuf::from("/tmp/patch_5.zip.7.partial")
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("patch.zip");
        let downloader = Downloader::new(&DownloadOptions {
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            system_proxy: false,
            ..DownloadOptions::default()
        })
        .unwrap();

        let result = downloader
            .download("http://127.0.0.1:9/patch.zip", &dest, 1, None, |_| ControlFlow::Continue(()))
            .await;

        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest, 1).exists());
    }

    #[tokio::test]
    async fn test_cancelled_attempt_keeps_other_partial() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("patch.zip");
        let newer = partial_path(&dest, 2);
        fs::write(&newer, b"newer attempt in flight").unwrap();

        let downloader = Downloader::new(&DownloadOptions {
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            system_proxy: false,
            ..DownloadOptions::default()
        })
        .unwrap();
        let result = downloader
            .download("http://127.0.0.1:9/patch.zip", &dest, 1, None, |_| ControlFlow::Break(()))
            .await;

        assert!(result.is_err());
        assert!(!partial_path(&dest, 1).exists());
        assert_eq!(fs::read(&newer).unwrap(), b"newer attempt in flight");
    }
}
