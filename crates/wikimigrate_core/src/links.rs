use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::Url;
use serde::Serialize;

use crate::model::{Link, LinkKind, SourceSpace};

static IMAGE: OnceLock<Regex> = OnceLock::new();
static ANCHOR: OnceLock<Regex> = OnceLock::new();
static WIKI_REF: OnceLock<Regex> = OnceLock::new();
static CODE_BLOCK: OnceLock<Regex> = OnceLock::new();
static MD_URL: OnceLock<Regex> = OnceLock::new();
static DOWNLOAD_SUFFIX: OnceLock<Regex> = OnceLock::new();
static TICKET_NUMBER: OnceLock<Regex> = OnceLock::new();

/// `[[...]]` values with these prefixes reference media or snippets, not pages.
pub const NON_PAGE_REF_PREFIXES: [&str; 4] = ["image:", "url:", "file:", "snippet:"];

/// Decides whether a URL points into one of the exported source spaces.
#[derive(Debug, Clone, Default)]
pub struct SpaceMatcher {
    keys: HashSet<String>,
}

impl SpaceMatcher {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = keys
            .into_iter()
            .map(|key| key.as_ref().trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        Self { keys }
    }

    /// Space ids and wiki names both identify a space in URLs.
    pub fn from_spaces(spaces: &[SourceSpace]) -> Self {
        Self::new(
            spaces
                .iter()
                .flat_map(|space| [space.id.as_str(), space.wiki_name.as_str()]),
        )
    }

    pub fn matches(&self, url: &str) -> bool {
        path_segments(url).iter().any(|segment| self.keys.contains(segment))
    }
}

/// Sub-classification of a kept anchor, derived from its href.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorTarget {
    Document,
    Ticket,
    WikiPage,
    Other,
}

impl AnchorTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Ticket => "ticket",
            Self::WikiPage => "wiki_page",
            Self::Other => "other",
        }
    }
}

/// Scan one page body. Ordinals restart at 1 for every page and follow the scan
/// order images, anchors, wiki refs, code blocks, markdown URLs.
pub fn extract(page_id: &str, body: &str, spaces: &SpaceMatcher) -> Vec<Link> {
    let mut found: Vec<(LinkKind, String, String)> = Vec::new();

    for caps in image_pattern().captures_iter(body) {
        let src = &caps[1];
        if spaces.matches(src) {
            found.push((LinkKind::Image, strip_download_suffix(src), String::new()));
        }
    }

    for caps in anchor_pattern().captures_iter(body) {
        let href = &caps[1];
        if spaces.matches(href) {
            found.push((LinkKind::Anchor, href.to_string(), caps[2].to_string()));
        }
    }

    for caps in wiki_ref_pattern().captures_iter(body) {
        found.push((LinkKind::WikiRef, caps[1].to_string(), String::new()));
    }

    for caps in regex(&CODE_BLOCK, r"(?s)<pre>(.*?)</pre>").captures_iter(body) {
        found.push((LinkKind::Code, caps[1].to_string(), String::new()));
    }

    for caps in md_url_pattern().captures_iter(body) {
        let text = &caps[1];
        if text.starts_with('[') {
            continue;
        }
        found.push((LinkKind::MdUrl, caps[2].to_string(), text.to_string()));
    }

    found
        .into_iter()
        .enumerate()
        .map(|(position, (kind, raw_value, display_text))| Link {
            page_id: page_id.to_string(),
            ordinal: u32::try_from(position + 1).unwrap_or(u32::MAX),
            kind,
            raw_value,
            display_text,
        })
        .collect()
}

pub fn classify_anchor(value: &str) -> AnchorTarget {
    if value.contains("/documents/") {
        AnchorTarget::Document
    } else if value.contains("/tickets/") || value.contains("ticket=") {
        AnchorTarget::Ticket
    } else if value.contains("/wiki/") {
        AnchorTarget::WikiPage
    } else {
        AnchorTarget::Other
    }
}

/// Drop a trailing `/download...` part so both link forms name the same resource.
pub fn strip_download_suffix(value: &str) -> String {
    regex(&DOWNLOAD_SUFFIX, r"/download(?:[/?].*)?$")
        .replace(value, "")
        .into_owned()
}

/// Resource id of an attachment link: last path segment after the download suffix.
pub fn attachment_id(value: &str) -> Option<String> {
    let stripped = strip_download_suffix(value);
    path_segments(&stripped).pop()
}

pub fn ticket_number(value: &str) -> Option<u64> {
    regex(&TICKET_NUMBER, r"(?:/tickets/|ticket=)(\d+)")
        .captures(value)
        .and_then(|caps| caps[1].parse().ok())
}

/// Page title addressed by a `/wiki/...` URL.
pub fn wiki_link_title(value: &str) -> Option<String> {
    path_segments(value)
        .pop()
        .map(|segment| segment.replace('_', " ").trim().to_string())
        .filter(|title| !title.is_empty())
}

/// Page title addressed by a `[[...]]` reference, or `None` for media/snippet refs.
pub fn wiki_ref_title(value: &str) -> Option<String> {
    let lowered = value.trim_start().to_ascii_lowercase();
    if NON_PAGE_REF_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return None;
    }
    let target = value.split('|').next().unwrap_or_default();
    let title = target.replace('_', " ").trim().to_string();
    if title.is_empty() { None } else { Some(title) }
}

pub fn image_pattern() -> &'static Regex {
    regex(&IMAGE, r#"<img\b[^>]*?\ssrc="([^"]*)"[^>]*>"#)
}

pub fn anchor_pattern() -> &'static Regex {
    regex(&ANCHOR, r#"(?s)<a\b[^>]*?\shref="([^"]*)"[^>]*>(.*?)</a>"#)
}

pub fn wiki_ref_pattern() -> &'static Regex {
    regex(&WIKI_REF, r"\[\[(.*?)\]\]")
}

pub fn md_url_pattern() -> &'static Regex {
    regex(&MD_URL, r"\[(.*?)\]\((.*?)\)")
}

/// Link counts per kind, with anchors further split by their target.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkSummary {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub anchors_by_target: BTreeMap<String, usize>,
}

pub fn summarize(links: &[Link]) -> LinkSummary {
    let mut summary = LinkSummary {
        total: links.len(),
        ..LinkSummary::default()
    };
    for link in links {
        *summary
            .by_kind
            .entry(link.kind.as_str().to_string())
            .or_default() += 1;
        if link.kind == LinkKind::Anchor {
            *summary
                .anchors_by_target
                .entry(classify_anchor(&link.raw_value).as_str().to_string())
                .or_default() += 1;
        }
    }
    summary
}

/// Non-empty path segments, percent-decoded.
fn path_segments(value: &str) -> Vec<String> {
    let decode = |segment: &str| percent_decode_str(segment).decode_utf8_lossy().into_owned();
    if let Ok(url) = Url::parse(value)
        && let Some(segments) = url.path_segments()
    {
        return segments
            .filter(|segment| !segment.is_empty())
            .map(decode)
            .collect();
    }
    let path = value.split(['?', '#']).next().unwrap_or_default();
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(decode)
        .collect()
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PageFormat;
    use crate::normalize::normalize;

    fn spaces() -> SpaceMatcher {
        SpaceMatcher::new(["S1", "team-wiki"])
    }

    #[test]
    fn space_matcher_checks_whole_path_segments() {
        let matcher = spaces();
        assert!(matcher.matches("https://app.example.com/spaces/S1/documents/DOC1"));
        assert!(matcher.matches("/team-wiki/wiki/Home"));
        assert!(!matcher.matches("https://app.example.com/spaces/S12/documents/DOC1"));
        assert!(!matcher.matches("https://elsewhere.example.com/image.png"));
    }

    #[test]
    fn image_link_keeps_attachment_reference() {
        let body = r#"<p><img alt="" src="https://app.example.com/spaces/S1/documents/DOC1/download/DOC1" /></p>"#;
        let links = extract("P1", body, &spaces());
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].kind, LinkKind::Image);
        assert!(links[0].raw_value.ends_with("DOC1"));
        assert_eq!(
            links[0].raw_value,
            "https://app.example.com/spaces/S1/documents/DOC1"
        );
    }

    #[test]
    fn foreign_images_and_anchors_are_ignored() {
        let body = r#"<img src="https://cdn.example.org/x.png"/><a href="https://example.org/">out</a>"#;
        assert!(extract("P1", body, &spaces()).is_empty());
    }

    #[test]
    fn ordinals_follow_kind_order_not_position() {
        let body = concat!(
            "[docs](https://example.org/docs) ",
            "<pre>let x = 1;</pre>",
            "[[Old Page]]",
            r#"<a href="https://app.example.com/spaces/S1/wiki/Other_Page">see</a>"#,
            r#"<img src="https://app.example.com/spaces/S1/documents/D2/download?filename=a.png"/>"#,
        );
        let links = extract("P1", body, &spaces());
        let kinds = links.iter().map(|link| link.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                LinkKind::Image,
                LinkKind::Anchor,
                LinkKind::WikiRef,
                LinkKind::Code,
                LinkKind::MdUrl
            ]
        );
        assert_eq!(
            links.iter().map(|link| link.ordinal).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(links[1].display_text, "see");
        assert_eq!(links[2].raw_value, "Old Page");
        assert_eq!(links[4].raw_value, "https://example.org/docs");
        assert_eq!(links[4].display_text, "docs");
    }

    #[test]
    fn markdown_url_inside_wiki_ref_is_skipped() {
        let links = extract("P1", "[[Page]](trailing)", &spaces());
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].kind, LinkKind::WikiRef);
    }

    #[test]
    fn extraction_is_deterministic() {
        let body = r#"<a href="/S1/tickets/12">#12</a> [[A]] [[B]]"#;
        assert_eq!(extract("P", body, &spaces()), extract("P", body, &spaces()));
    }

    #[test]
    fn anchors_are_classified_by_href() {
        assert_eq!(
            classify_anchor("https://x/spaces/S1/documents/D1/download/D1"),
            AnchorTarget::Document
        );
        assert_eq!(classify_anchor("https://x/spaces/S1/tickets/42"), AnchorTarget::Ticket);
        assert_eq!(
            classify_anchor("https://x/spaces/S1/tickets/report?ticket=42"),
            AnchorTarget::Ticket
        );
        assert_eq!(classify_anchor("https://x/spaces/S1/wiki/Home"), AnchorTarget::WikiPage);
        assert_eq!(classify_anchor("https://x/spaces/S1/milestones"), AnchorTarget::Other);
    }

    #[test]
    fn both_download_forms_share_an_attachment_id() {
        let direct = attachment_id("https://x/spaces/S1/documents/DOC1/download/DOC1");
        let query = attachment_id("https://x/spaces/S1/documents/DOC1/download?filename=a.png");
        let bare = attachment_id("https://x/spaces/S1/documents/DOC1");
        assert_eq!(direct.as_deref(), Some("DOC1"));
        assert_eq!(direct, query);
        assert_eq!(direct, bare);
    }

    #[test]
    fn ticket_numbers_and_titles_are_parsed() {
        assert_eq!(ticket_number("https://x/spaces/S1/tickets/42-fix"), Some(42));
        assert_eq!(ticket_number("https://x/report?ticket=7"), Some(7));
        assert_eq!(ticket_number("https://x/tickets/new"), None);
        assert_eq!(
            wiki_link_title("https://x/spaces/S1/wiki/Release_Notes").as_deref(),
            Some("Release Notes")
        );
    }

    #[test]
    fn escaped_titles_are_decoded() {
        assert_eq!(
            wiki_link_title("https://app.example.com/spaces/S1/wiki/Übersicht_Seite").as_deref(),
            Some("Übersicht Seite")
        );
        assert_eq!(
            wiki_link_title("https://x/spaces/S1/wiki/Release%20Notes").as_deref(),
            Some("Release Notes")
        );
        assert!(SpaceMatcher::new(["team space"]).matches("https://x/spaces/team%20space/wiki/A"));
    }

    #[test]
    fn anchors_survive_normalization() {
        let raw = concat!(
            r#"<p><a href="https://app.example.com/spaces/S1/wiki/Setup_Guide">"#,
            r#"<strong>Setup</strong></a> and "#,
            r#"<a href="https://app.example.com/spaces/S1/tickets/3"><em>#3</em></a></p>"#
        );
        let before = extract("A", raw, &spaces());
        let normalized = normalize(raw, PageFormat::Html);
        assert!(normalized.warning.is_none());
        let after = extract("A", &normalized.body, &spaces());
        assert_eq!(after.len(), 2);
        assert_eq!(after, before);
    }

    #[test]
    fn multi_line_anchor_is_extracted() {
        let body = "<a href=\"https://x/spaces/S1/wiki/Home\">\n  <b>Home</b>\n</a>";
        let links = extract("A", body, &spaces());
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].display_text, "\n  <b>Home</b>\n");
    }

    #[test]
    fn wiki_ref_titles_skip_media_prefixes() {
        assert_eq!(wiki_ref_title("Old_Page|shown").as_deref(), Some("Old Page"));
        assert_eq!(wiki_ref_title("image:logo.png"), None);
        assert_eq!(wiki_ref_title("url:https://x"), None);
        assert_eq!(wiki_ref_title("file:D1"), None);
        assert_eq!(wiki_ref_title("snippet:42"), None);
        assert_eq!(wiki_ref_title(" | "), None);
    }

    #[test]
    fn summary_counts_kinds_and_anchor_targets() {
        let body = r#"<a href="/S1/tickets/1">t</a><a href="/S1/wiki/Home">w</a>[[X]]"#;
        let summary = summarize(&extract("P", body, &spaces()));
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_kind.get("anchor"), Some(&2));
        assert_eq!(summary.anchors_by_target.get("ticket"), Some(&1));
        assert_eq!(summary.anchors_by_target.get("wiki_page"), Some(&1));
    }
}
