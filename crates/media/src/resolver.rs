//! The media resolver: references in, typed blobs out.

use futures::future::try_join_all;
use gemcord_config::MediaConfig;
use gemcord_core::error::MediaError;
use gemcord_core::media::{self, MediaBlob, MediaRef, Provenance};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::fetch::{Fetcher, HttpFetcher};
use crate::video::{FfmpegMuxer, SplitStreamStrategy, VideoLinkStrategy, YtDlpLocator};

/// Limits applied to every resolved reference.
#[derive(Debug, Clone)]
pub struct MediaPolicy {
    pub max_bytes: u64,
    pub extra_mime_types: Vec<String>,
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            extra_mime_types: Vec::new(),
        }
    }
}

/// Converts media references into normalized blobs.
///
/// Resolution is all-or-nothing: a failed or cancelled call never yields a
/// partial list, and in-flight downloads are dropped with their buffers.
pub struct MediaResolver {
    fetcher: Arc<dyn Fetcher>,
    video: Arc<dyn VideoLinkStrategy>,
    policy: MediaPolicy,
}

impl MediaResolver {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        video: Arc<dyn VideoLinkStrategy>,
        policy: MediaPolicy,
    ) -> Self {
        Self {
            fetcher,
            video,
            policy,
        }
    }

    /// Build the production resolver: HTTP downloads, `yt-dlp` + `ffmpeg` for video links.
    pub fn from_config(config: &MediaConfig) -> Self {
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(
            Duration::from_secs(config.download_timeout_secs),
            config.max_bytes,
        ));
        let video = SplitStreamStrategy::new(
            Arc::new(YtDlpLocator::new(&config.yt_dlp_path)),
            fetcher.clone(),
            Arc::new(FfmpegMuxer::new(&config.ffmpeg_path)),
        );
        Self::new(
            fetcher,
            Arc::new(video),
            MediaPolicy {
                max_bytes: config.max_bytes,
                extra_mime_types: config.extra_mime_types.clone(),
            },
        )
    }

    /// Resolve one reference.
    pub async fn resolve(
        &self,
        reference: &MediaRef,
        cancel: &CancellationToken,
    ) -> Result<Vec<MediaBlob>, MediaError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MediaError::Cancelled),
            result = self.resolve_one(reference) => result.map(|blob| vec![blob]),
        }
    }

    /// Resolve every reference concurrently, failing atomically.
    pub async fn resolve_all(
        &self,
        references: &[MediaRef],
        cancel: &CancellationToken,
    ) -> Result<Vec<MediaBlob>, MediaError> {
        if references.is_empty() {
            return Ok(Vec::new());
        }

        let all = try_join_all(references.iter().map(|r| self.resolve_one(r)));
        let blobs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MediaError::Cancelled),
            result = all => result?,
        };

        info!(
            count = blobs.len(),
            total_bytes = blobs.iter().map(MediaBlob::len).sum::<usize>(),
            "Resolved media"
        );
        Ok(blobs)
    }

    async fn resolve_one(&self, reference: &MediaRef) -> Result<MediaBlob, MediaError> {
        match reference {
            MediaRef::Attachment {
                url,
                filename,
                mime_type,
                size_bytes,
            } => {
                let source = reference.describe().to_string();

                if size_bytes.is_some_and(|size| size > self.policy.max_bytes) {
                    return Err(MediaError::Download {
                        source_ref: source,
                        reason: format!("larger than {} bytes", self.policy.max_bytes),
                    });
                }

                // Reject known-bad types before spending a download on them.
                let declared = mime_type
                    .clone()
                    .or_else(|| filename.as_deref().and_then(media::mime_from_filename).map(String::from));
                if let Some(declared) = &declared {
                    self.check_supported(&source, declared)?;
                }

                debug!(source = %source, "Fetching attachment");
                let fetched = self.fetcher.fetch(url).await?;
                let mime = declared
                    .or(fetched.content_type)
                    .unwrap_or_else(|| "application/octet-stream".into());
                self.check_supported(&source, &mime)?;

                Ok(MediaBlob::new(fetched.data, mime, Provenance::Attachment, source))
            }
            MediaRef::VideoLink { url } => {
                debug!(url = %url, "Resolving video link");
                let blob = self.video.resolve(url).await?;
                if blob.len() as u64 > self.policy.max_bytes {
                    return Err(MediaError::Download {
                        source_ref: url.clone(),
                        reason: format!("larger than {} bytes", self.policy.max_bytes),
                    });
                }
                Ok(blob)
            }
        }
    }

    fn check_supported(&self, source: &str, mime: &str) -> Result<(), MediaError> {
        if media::is_supported_mime(mime, &self.policy.extra_mime_types) {
            Ok(())
        } else {
            Err(MediaError::UnsupportedFormat {
                source_ref: source.to_string(),
                mime_type: media::normalize_mime(mime),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::Fetched;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubFetcher {
        files: HashMap<String, (Vec<u8>, Option<String>)>,
        hang: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<Fetched, MediaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            match self.files.get(url) {
                Some((data, content_type)) => Ok(Fetched {
                    data: data.clone(),
                    content_type: content_type.clone(),
                }),
                None => Err(MediaError::Download {
                    source_ref: url.to_string(),
                    reason: "HTTP 404".into(),
                }),
            }
        }
    }

    struct StubVideo;

    #[async_trait]
    impl VideoLinkStrategy for StubVideo {
        async fn resolve(&self, url: &str) -> Result<MediaBlob, MediaError> {
            Ok(MediaBlob::new(vec![7u8; 8], "video/mp4", Provenance::ResolvedLink, url))
        }
    }

    fn resolver(fetcher: StubFetcher) -> (MediaResolver, Arc<StubFetcher>) {
        let fetcher = Arc::new(fetcher);
        let resolver = MediaResolver::new(fetcher.clone(), Arc::new(StubVideo), MediaPolicy::default());
        (resolver, fetcher)
    }

    fn attachment(url: &str, filename: &str, mime: Option<&str>) -> MediaRef {
        MediaRef::Attachment {
            url: url.into(),
            filename: Some(filename.into()),
            mime_type: mime.map(String::from),
            size_bytes: None,
        }
    }

    #[tokio::test]
    async fn attachment_uses_declared_mime() {
        let mut stub = StubFetcher::default();
        stub.files.insert("u1".into(), (vec![1, 2, 3], Some("text/html".into())));
        let (resolver, _) = resolver(stub);

        let blobs = resolver
            .resolve(&attachment("u1", "cat.png", Some("image/png")), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].mime_type(), "image/png");
        assert_eq!(blobs[0].provenance(), Provenance::Attachment);
        assert_eq!(blobs[0].source(), "cat.png");
    }

    #[tokio::test]
    async fn falls_back_to_server_content_type() {
        let mut stub = StubFetcher::default();
        stub.files.insert("u1".into(), (b"%PDF".to_vec(), Some("application/pdf".into())));
        let (resolver, _) = resolver(stub);

        let reference = MediaRef::Attachment {
            url: "u1".into(),
            filename: Some("report".into()),
            mime_type: None,
            size_bytes: None,
        };
        let blobs = resolver.resolve(&reference, &CancellationToken::new()).await.unwrap();
        assert_eq!(blobs[0].mime_type(), "application/pdf");
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected_before_download() {
        let (resolver, fetcher) = resolver(StubFetcher::default());
        let err = resolver
            .resolve(
                &attachment("u1", "setup.exe", Some("application/x-msdownload")),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MediaError::UnsupportedFormat {
                source_ref: "setup.exe".into(),
                mime_type: "application/x-msdownload".into(),
            }
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_attachment_is_rejected() {
        let (resolver, fetcher) = resolver(StubFetcher::default());
        let reference = MediaRef::Attachment {
            url: "u1".into(),
            filename: Some("big.mp4".into()),
            mime_type: Some("video/mp4".into()),
            size_bytes: Some(1 << 40),
        };
        let err = resolver.resolve(&reference, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MediaError::Download { .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolve_all_is_atomic() {
        let mut stub = StubFetcher::default();
        stub.files.insert("ok".into(), (vec![1], None));
        let (resolver, _) = resolver(stub);

        let refs = vec![
            attachment("ok", "a.png", Some("image/png")),
            attachment("missing", "b.png", Some("image/png")),
        ];
        let err = resolver.resolve_all(&refs, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MediaError::Download { ref source_ref, .. } if source_ref == "missing"));
    }

    #[tokio::test]
    async fn resolve_all_keeps_reference_order() {
        let mut stub = StubFetcher::default();
        stub.files.insert("a".into(), (vec![1], None));
        let (resolver, _) = resolver(stub);

        let refs = vec![
            MediaRef::VideoLink {
                url: "https://youtu.be/x".into(),
            },
            attachment("a", "a.png", Some("image/png")),
        ];
        let blobs = resolver.resolve_all(&refs, &CancellationToken::new()).await.unwrap();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].mime_type(), "video/mp4");
        assert_eq!(blobs[1].mime_type(), "image/png");
    }

    #[tokio::test]
    async fn cancellation_abandons_hanging_download() {
        let stub = StubFetcher {
            hang: true,
            ..StubFetcher::default()
        };
        let (resolver, _) = resolver(stub);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = resolver
            .resolve_all(&[attachment("u1", "a.png", Some("image/png"))], &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::Cancelled);
    }

    #[tokio::test]
    async fn empty_reference_list_resolves_immediately() {
        let (resolver, fetcher) = resolver(StubFetcher::default());
        let blobs = resolver.resolve_all(&[], &CancellationToken::new()).await.unwrap();
        assert!(blobs.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
