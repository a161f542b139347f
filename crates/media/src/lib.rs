//! # gemcord Media
//!
//! Turns attachment and video-link references into [`MediaBlob`]s the model
//! API accepts. Downloads run concurrently, fail atomically and can be
//! abandoned through a cancellation token.
//!
//! [`MediaBlob`]: gemcord_core::MediaBlob

pub mod fetch;
pub mod links;
pub mod resolver;
pub mod video;

pub use fetch::{Fetched, Fetcher, HttpFetcher};
pub use links::{extract_video_links, is_video_link, repair_link};
pub use resolver::{MediaPolicy, MediaResolver};
pub use video::{
    FfmpegMuxer, Muxer, SplitStreamStrategy, StreamLocation, StreamLocator, VideoLinkStrategy,
    YtDlpLocator,
};
