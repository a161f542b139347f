//! Media references and normalized media blobs.
//!
//! A [`MediaRef`] is what arrives with an inbound message (an attachment or a
//! video link). The media resolver turns references into [`MediaBlob`]s, which
//! are typed byte payloads ready to be sent to the model.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BLOB_ID: AtomicU64 = AtomicU64::new(1);

/// A reference to media that still has to be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaRef {
    /// A file attached to the chat message.
    Attachment {
        /// Download URL (or local path) of the attachment
        url: String,

        /// Original filename
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,

        /// MIME type declared by the platform
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,

        /// File size in bytes, when the platform reports it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    },

    /// A link to a video-sharing page embedded in the message text.
    VideoLink { url: String },
}

impl MediaRef {
    /// Human-readable identifier used in logs and error messages.
    pub fn describe(&self) -> &str {
        match self {
            MediaRef::Attachment { filename: Some(name), .. } => name,
            MediaRef::Attachment { url, .. } => url,
            MediaRef::VideoLink { url } => url,
        }
    }
}

/// Where a blob came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Read directly from a chat attachment
    Attachment,
    /// Produced by resolving a link (download + mux)
    ResolvedLink,
    /// Generated by the model itself (e.g. an image in the answer)
    Generated,
}

/// A typed binary payload.
///
/// The bytes are reference-counted so that re-sending history to the model
/// on every round-trip does not copy the payload.
#[derive(Clone)]
pub struct MediaBlob {
    /// Process-unique; clones share it
    id: u64,
    data: Arc<[u8]>,
    mime_type: String,
    provenance: Provenance,
    source: String,
}

impl MediaBlob {
    pub fn new(
        data: impl Into<Arc<[u8]>>,
        mime_type: impl Into<String>,
        provenance: Provenance,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: NEXT_BLOB_ID.fetch_add(1, Ordering::Relaxed),
            data: data.into(),
            mime_type: normalize_mime(&mime_type.into()),
            provenance,
            source: source.into(),
        }
    }

    /// Identifies this blob and its clones, e.g. to cache an upload.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// The reference this blob was resolved from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A file extension matching the MIME type, for platforms that need a filename.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "audio/wav" => "wav",
            "audio/mpeg" | "audio/mp3" => "mp3",
            "video/mp4" => "mp4",
            "application/pdf" => "pdf",
            "text/plain" => "txt",
            _ => "bin",
        }
    }
}

impl PartialEq for MediaBlob {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.mime_type == other.mime_type
            && self.provenance == other.provenance
            && self.source == other.source
    }
}

impl Eq for MediaBlob {}

impl std::fmt::Debug for MediaBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBlob")
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .field("provenance", &self.provenance)
            .field("source", &self.source)
            .finish()
    }
}

/// MIME types the model API documents as accepted input.
pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    // Images
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/heic",
    "image/heif",
    // Audio
    "audio/wav",
    "audio/mp3",
    "audio/mpeg",
    "audio/aiff",
    "audio/aac",
    "audio/ogg",
    "audio/flac",
    // Video
    "video/mp4",
    "video/mpeg",
    "video/mov",
    "video/quicktime",
    "video/avi",
    "video/x-flv",
    "video/mpg",
    "video/webm",
    "video/wmv",
    "video/3gpp",
    // Documents
    "application/pdf",
    "application/json",
    "application/rtf",
    "application/x-javascript",
    "text/plain",
    "text/html",
    "text/css",
    "text/csv",
    "text/markdown",
    "text/xml",
    "text/rtf",
    "text/javascript",
    "text/x-python",
    "text/x-typescript",
];

/// Lowercase a MIME type and drop any parameters (`; charset=...`).
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether the model accepts this MIME type, consulting `extra` as well.
pub fn is_supported_mime(mime: &str, extra: &[String]) -> bool {
    let mime = normalize_mime(mime);
    SUPPORTED_MIME_TYPES.contains(&mime.as_str()) || extra.iter().any(|m| normalize_mime(m) == mime)
}

/// Best-effort MIME guess from a filename extension.
pub fn mime_from_filename(filename: &str) -> Option<&'static str> {
    let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "py" => "text/x-python",
        "html" => "text/html",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_parameters_are_ignored() {
        assert!(is_supported_mime("text/plain; charset=utf-8", &[]));
        assert!(is_supported_mime("IMAGE/PNG", &[]));
        assert!(!is_supported_mime("application/x-msdownload", &[]));
    }

    #[test]
    fn extra_mime_types_extend_the_set() {
        let extra = vec!["application/zip".to_string()];
        assert!(is_supported_mime("application/zip", &extra));
        assert!(!is_supported_mime("application/zip", &[]));
    }

    #[test]
    fn blob_debug_hides_bytes() {
        let blob = MediaBlob::new(vec![1u8, 2, 3], "image/png", Provenance::Attachment, "a.png");
        let dbg = format!("{blob:?}");
        assert!(dbg.contains("len: 3"));
        assert!(!dbg.contains("[1, 2, 3]"));
        assert_eq!(blob.extension(), "png");
    }

    #[test]
    fn clones_share_an_id() {
        let a = MediaBlob::new(vec![1u8], "image/png", Provenance::Attachment, "a.png");
        let b = MediaBlob::new(vec![1u8], "image/png", Provenance::Attachment, "a.png");
        assert_eq!(a.clone().id(), a.id());
        assert_ne!(a.id(), b.id());
        assert_eq!(a, b);
    }

    #[test]
    fn describe_prefers_filename() {
        let r = MediaRef::Attachment {
            url: "https://cdn/x".into(),
            filename: Some("cat.jpg".into()),
            mime_type: None,
            size_bytes: None,
        };
        assert_eq!(r.describe(), "cat.jpg");
        assert_eq!(mime_from_filename("cat.JPG"), Some("image/jpeg"));
        assert_eq!(mime_from_filename("noext"), None);
    }
}
