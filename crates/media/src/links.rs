//! Video link detection in message text.

use regex::Regex;
use std::sync::LazyLock;

static VIDEO_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:https?://)?(?:youtu\.be/|(?:www\.|m\.)?youtube\.com/(?:watch|v|embed)(?:\.php)?(?:\?\S*?v=|/))([a-zA-Z0-9_-]+)\S*",
    )
    .expect("video link pattern is valid")
});

/// Prefix a bare link with `https://`.
pub fn repair_link(link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else {
        format!("https://{link}")
    }
}

/// Whether `url` points at a supported video-sharing page.
pub fn is_video_link(url: &str) -> bool {
    VIDEO_LINK.is_match(url)
}

/// Split video links out of `text`.
///
/// Returns the text with every link removed (surrounding whitespace
/// collapsed) and the repaired links in order of appearance.
pub fn extract_video_links(text: &str) -> (String, Vec<String>) {
    let links: Vec<String> = VIDEO_LINK
        .find_iter(text)
        .map(|m| repair_link(m.as_str()))
        .collect();

    if links.is_empty() {
        return (text.to_string(), links);
    }

    let stripped = VIDEO_LINK.replace_all(text, "");
    let cleaned = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    (cleaned, links)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_and_strips_watch_links() {
        let (text, links) =
            extract_video_links("summarize https://www.youtube.com/watch?v=dQw4w9WgXcQ please");
        assert_eq!(text, "summarize please");
        assert_eq!(links, vec!["https://www.youtube.com/watch?v=dQw4w9WgXcQ"]);
    }

    #[test]
    fn repairs_bare_short_links() {
        let (text, links) = extract_video_links("youtu.be/abc_DEF-123 and m.youtube.com/embed/xyz");
        assert_eq!(text, "and");
        assert_eq!(
            links,
            vec!["https://youtu.be/abc_DEF-123", "https://m.youtube.com/embed/xyz"]
        );
    }

    #[test]
    fn leaves_other_text_alone() {
        let (text, links) = extract_video_links("What is 12*7?  see https://example.com");
        assert_eq!(text, "What is 12*7?  see https://example.com");
        assert!(links.is_empty());
        assert!(!is_video_link("https://example.com/watch?v=1"));
    }

    #[test]
    fn watch_link_with_extra_params() {
        assert!(is_video_link("https://youtube.com/watch?feature=share&v=abc123"));
        assert_eq!(repair_link("http://youtu.be/x"), "http://youtu.be/x");
    }
}
