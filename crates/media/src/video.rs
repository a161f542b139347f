//! Video link resolution.
//!
//! The upstream video platform does not always expose a combined
//! audio+video stream, so the default [`SplitStreamStrategy`] locates the
//! best video-only and audio-only streams, downloads both concurrently and
//! muxes them into one MP4. Every stage sits behind a trait so the whole
//! strategy can be replaced without touching the resolver or orchestrator.

use async_trait::async_trait;
use gemcord_core::error::MediaError;
use gemcord_core::media::{MediaBlob, Provenance, mime_from_filename, normalize_mime};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::fetch::Fetcher;

/// Turns a video page link into one media blob.
#[async_trait]
pub trait VideoLinkStrategy: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<MediaBlob, MediaError>;
}

/// Direct stream URLs behind a video page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLocation {
    /// Separate video-only and audio-only streams
    Split { video: String, audio: String },
    /// A single stream that already carries both
    Combined(String),
}

#[async_trait]
pub trait StreamLocator: Send + Sync {
    async fn locate(&self, url: &str) -> Result<StreamLocation, MediaError>;
}

#[async_trait]
pub trait Muxer: Send + Sync {
    /// Combine a video-only and an audio-only stream into one MP4.
    async fn mux(&self, video: &[u8], audio: &[u8]) -> Result<Vec<u8>, MediaError>;
}

/// Download-both-then-mux strategy.
pub struct SplitStreamStrategy {
    locator: Arc<dyn StreamLocator>,
    fetcher: Arc<dyn Fetcher>,
    muxer: Arc<dyn Muxer>,
}

impl SplitStreamStrategy {
    pub fn new(
        locator: Arc<dyn StreamLocator>,
        fetcher: Arc<dyn Fetcher>,
        muxer: Arc<dyn Muxer>,
    ) -> Self {
        Self {
            locator,
            fetcher,
            muxer,
        }
    }
}

#[async_trait]
impl VideoLinkStrategy for SplitStreamStrategy {
    async fn resolve(&self, url: &str) -> Result<MediaBlob, MediaError> {
        let (data, mime_type) = match self.locator.locate(url).await? {
            StreamLocation::Combined(stream) => {
                debug!(url = %url, "Downloading combined stream");
                let fetched = self.fetcher.fetch(&stream).await?;
                let mime_type = combined_mime(&stream, fetched.content_type.as_deref());
                (fetched.data, mime_type)
            }
            StreamLocation::Split { video, audio } => {
                debug!(url = %url, "Downloading split video and audio streams");
                // Either failure drops the other download.
                let (video, audio) =
                    futures::try_join!(self.fetcher.fetch(&video), self.fetcher.fetch(&audio))?;
                (self.muxer.mux(&video.data, &audio.data).await?, "video/mp4".to_string())
            }
        };

        if data.is_empty() {
            return Err(MediaError::Download {
                source_ref: url.to_string(),
                reason: "resolved stream was empty".into(),
            });
        }

        Ok(MediaBlob::new(data, mime_type, Provenance::ResolvedLink, url))
    }
}

/// Container type of a combined stream: the server's `video/*` content type,
/// else the stream URL's extension, else MP4.
fn combined_mime(stream_url: &str, content_type: Option<&str>) -> String {
    if let Some(mime) = content_type
        .map(normalize_mime)
        .filter(|m| m.starts_with("video/"))
    {
        return mime;
    }
    let path = stream_url.split(['?', '#']).next().unwrap_or_default();
    mime_from_filename(path)
        .filter(|m| m.starts_with("video/"))
        .unwrap_or("video/mp4")
        .to_string()
}

/// Locates streams by asking `yt-dlp -g` for the best video and audio formats.
pub struct YtDlpLocator {
    program: String,
}

impl YtDlpLocator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Parse `yt-dlp -g` output: one stream URL per line, video first.
pub fn parse_stream_urls(stdout: &str) -> Option<StreamLocation> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next()?.to_string();
    match lines.next() {
        Some(second) => Some(StreamLocation::Split {
            video: first,
            audio: second.to_string(),
        }),
        None => Some(StreamLocation::Combined(first)),
    }
}

#[async_trait]
impl StreamLocator for YtDlpLocator {
    async fn locate(&self, url: &str) -> Result<StreamLocation, MediaError> {
        let output = Command::new(&self.program)
            .args(["-g", "-f", "bestvideo[ext=mp4]+bestaudio/best", "--no-playlist", url])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MediaError::Download {
                source_ref: url.to_string(),
                reason: format!("failed to run {}: {e}", self.program),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(url = %url, stderr = %stderr.trim(), "Stream lookup failed");
            return Err(MediaError::Download {
                source_ref: url.to_string(),
                reason: stderr.trim().to_string(),
            });
        }

        parse_stream_urls(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            MediaError::Download {
                source_ref: url.to_string(),
                reason: "no streams found".into(),
            }
        })
    }
}

/// Muxes with ffmpeg inside a temporary directory that is removed on drop.
pub struct FfmpegMuxer {
    program: String,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn mux_error(reason: impl std::fmt::Display) -> MediaError {
        MediaError::Download {
            source_ref: "ffmpeg".into(),
            reason: format!("mux failed: {reason}"),
        }
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, video: &[u8], audio: &[u8]) -> Result<Vec<u8>, MediaError> {
        let dir = tempfile::tempdir().map_err(Self::mux_error)?;
        let video_path = dir.path().join("video");
        let audio_path = dir.path().join("audio");
        let out_path = dir.path().join("out.mp4");

        tokio::fs::write(&video_path, video).await.map_err(Self::mux_error)?;
        tokio::fs::write(&audio_path, audio).await.map_err(Self::mux_error)?;

        let output = Command::new(&self.program)
            .arg("-y")
            .arg("-i")
            .arg(&video_path)
            .arg("-i")
            .arg(&audio_path)
            .args(["-c:v", "copy", "-c:a", "aac", "-map", "0:v:0", "-map", "1:a:0", "-shortest"])
            .arg(&out_path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(Self::mux_error)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::mux_error(stderr.lines().last().unwrap_or("ffmpeg exited with an error")));
        }

        tokio::fs::read(&out_path).await.map_err(Self::mux_error)
    }
}
