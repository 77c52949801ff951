use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{FetchError, FetchedContent};
use crate::util::{validate_url, HostPolicy, RetryPolicy};

/// Wall-clock limit for one downloader run.
pub const VIDEO_TIMEOUT: Duration = Duration::from_secs(300);

const TOOL_NAME: &str = "yt-dlp";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Maximum video height to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoResolution {
    P360,
    P480,
    #[default]
    P720,
    P1080,
    Best,
}

impl VideoResolution {
    /// yt-dlp format selector for this resolution.
    pub fn format_selector(&self) -> String {
        match self.height() {
            Some(h) => format!(
                "bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/best[height<={h}]"
            ),
            None => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best".to_string(),
        }
    }

    fn height(&self) -> Option<u32> {
        match self {
            VideoResolution::P360 => Some(360),
            VideoResolution::P480 => Some(480),
            VideoResolution::P720 => Some(720),
            VideoResolution::P1080 => Some(1080),
            VideoResolution::Best => None,
        }
    }
}

impl fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.height() {
            Some(h) => write!(f, "{h}"),
            None => f.write_str("best"),
        }
    }
}

impl FromStr for VideoResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_end_matches(['p', 'P']) {
            "360" => Ok(VideoResolution::P360),
            "480" => Ok(VideoResolution::P480),
            "720" => Ok(VideoResolution::P720),
            "1080" => Ok(VideoResolution::P1080),
            "best" | "Best" | "BEST" => Ok(VideoResolution::Best),
            other => Err(format!(
                "unsupported video resolution '{other}' (expected 360, 480, 720, 1080 or best)"
            )),
        }
    }
}

// Accepts both `video_resolution = 720` and `video_resolution = "720p"`
impl<'de> Deserialize<'de> for VideoResolution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u32),
            Text(String),
        }

        let text = match Repr::deserialize(deserializer)? {
            Repr::Number(n) => n.to_string(),
            Repr::Text(s) => s,
        };
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Downloads videos with the external `yt-dlp` tool into a staging directory.
pub struct VideoFetcher {
    binary: Option<PathBuf>,
    staging_dir: PathBuf,
    policy: RetryPolicy,
}

impl VideoFetcher {
    /// `binary` overrides the `PATH` lookup of `yt-dlp`.
    pub fn new(binary: Option<PathBuf>, staging_dir: PathBuf, policy: RetryPolicy) -> Self {
        Self {
            binary,
            staging_dir,
            policy,
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf, FetchError> {
        if let Some(path) = &self.binary {
            return Ok(path.clone());
        }
        which::which(TOOL_NAME)
            .map_err(|_| FetchError::Tool(format!("{TOOL_NAME} not found in PATH")))
    }

    pub async fn fetch(
        &self,
        url: &str,
        resolution: VideoResolution,
    ) -> Result<FetchedContent, FetchError> {
        validate_url(url, HostPolicy::Any).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let binary = self.resolve_binary()?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let mut retry_count = 0;
        loop {
            let stem = format!(
                "video-{}-{}",
                std::process::id(),
                STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
            );
            match self.run_once(&binary, url, resolution, &stem).await {
                Ok(path) => {
                    let extension = path
                        .extension()
                        .map(|e| e.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "mp4".to_string());
                    return Ok(FetchedContent::Staged { path, extension });
                }
                Err(e) => {
                    remove_staged(&self.staging_dir, &stem).await;
                    if e.is_retryable() && self.policy.can_retry(retry_count) {
                        let delay = self.policy.delay_for(retry_count);
                        tracing::debug!(error = %e, retry = retry_count + 1, "Retrying video download");
                        tokio::time::sleep(delay).await;
                        retry_count += 1;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn run_once(
        &self,
        binary: &Path,
        url: &str,
        resolution: VideoResolution,
        stem: &str,
    ) -> Result<PathBuf, FetchError> {
        let template = self.staging_dir.join(format!("{stem}.%(ext)s"));
        let mut command = tokio::process::Command::new(binary);
        command
            .arg("-f")
            .arg(resolution.format_selector())
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--no-playlist")
            .arg("--no-progress")
            .arg("-o")
            .arg(&template)
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::debug!(url = %url, resolution = %resolution, "Starting video download");
        let output = tokio::time::timeout(VIDEO_TIMEOUT, command.output())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(|e| FetchError::Tool(format!("failed to run {}: {e}", binary.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(FetchError::Tool(format!(
                "{TOOL_NAME} exited with {}: {}",
                output.status,
                last_line.trim()
            )));
        }

        find_staged(&self.staging_dir, stem).await?.ok_or_else(|| {
            FetchError::Tool(format!("{TOOL_NAME} reported success but produced no file"))
        })
    }
}

/// The finished file for `stem`, skipping partial downloads.
async fn find_staged(dir: &Path, stem: &str) -> Result<Option<PathBuf>, FetchError> {
    let prefix = format!("{stem}.");
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) || name.ends_with(".part") || name.ends_with(".ytdl") {
            continue;
        }
        if name.ends_with(".mp4") {
            return Ok(Some(entry.path()));
        }
        found.get_or_insert(entry.path());
    }
    Ok(found)
}

async fn remove_staged(dir: &Path, stem: &str) {
    let prefix = format!("{stem}.");
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                tracing::debug!(path = %entry.path().display(), error = %e, "Failed to remove partial video");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_selector() {
        assert_eq!(
            VideoResolution::P720.format_selector(),
            "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[height<=720]"
        );
        assert_eq!(
            VideoResolution::Best.format_selector(),
            "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best"
        );
    }

    #[test]
    fn test_resolution_parsing() {
        assert_eq!("1080".parse::<VideoResolution>(), Ok(VideoResolution::P1080));
        assert_eq!("480p".parse::<VideoResolution>(), Ok(VideoResolution::P480));
        assert_eq!("best".parse::<VideoResolution>(), Ok(VideoResolution::Best));
        assert!("4k".parse::<VideoResolution>().is_err());
    }

    #[test]
    fn test_resolution_deserializes_number_or_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            r: VideoResolution,
        }
        let w: Wrapper = toml::from_str("r = 360").unwrap();
        assert_eq!(w.r, VideoResolution::P360);
        let w: Wrapper = toml::from_str("r = \"best\"").unwrap();
        assert_eq!(w.r, VideoResolution::Best);
    }

    #[tokio::test]
    async fn test_missing_tool_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = VideoFetcher::new(
            Some(dir.path().join("no-such-binary")),
            dir.path().join("staging"),
            RetryPolicy::default(),
        );
        let result = fetcher
            .fetch("https://video.example.com/watch?v=1", VideoResolution::P720)
            .await;
        assert!(matches!(result, Err(FetchError::Tool(_))));
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-yt-dlp");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_download_is_staged() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            "#!/bin/sh\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n  shift\ndone\nfile=$(echo \"$out\" | sed 's/%(ext)s/mp4/')\necho video > \"$file\"\n",
        );
        let staging = dir.path().join("staging");
        let fetcher = VideoFetcher::new(Some(tool), staging.clone(), RetryPolicy::default());

        let result = fetcher
            .fetch("https://video.example.com/watch?v=1", VideoResolution::P480)
            .await
            .unwrap();
        match result {
            FetchedContent::Staged { path, extension } => {
                assert_eq!(extension, "mp4");
                assert!(path.starts_with(&staging));
                assert_eq!(std::fs::read_to_string(path).unwrap(), "video\n");
            }
            other => panic!("expected staged content, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_failure_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            dir.path(),
            "#!/bin/sh\necho 'ERROR: Video unavailable' >&2\nexit 1\n",
        );
        let fetcher =
            VideoFetcher::new(Some(tool), dir.path().join("staging"), RetryPolicy::default());

        let err = fetcher
            .fetch("https://video.example.com/watch?v=2", VideoResolution::P720)
            .await
            .unwrap_err();
        match err {
            FetchError::Tool(msg) => assert!(msg.contains("Video unavailable")),
            other => panic!("expected tool error, got {other:?}"),
        }
    }
}
