use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Markup dialect of a source wiki page body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFormat {
    Plain,
    Html,
}

impl PageFormat {
    /// Source exports encode the format as an integer; only `3` is HTML.
    pub fn from_wiki_format(code: i64) -> Self {
        if code == 3 { Self::Html } else { Self::Plain }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Html => "html",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plain" => Some(Self::Plain),
            "html" => Some(Self::Html),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub body: String,
    pub format: PageFormat,
    pub created_at: DateTime<Utc>,
    pub author_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Image,
    Anchor,
    WikiRef,
    Code,
    MdUrl,
}

impl LinkKind {
    pub const ALL: [LinkKind; 5] = [
        LinkKind::Image,
        LinkKind::Anchor,
        LinkKind::WikiRef,
        LinkKind::Code,
        LinkKind::MdUrl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Anchor => "anchor",
            Self::WikiRef => "wiki_ref",
            Self::Code => "code",
            Self::MdUrl => "md_url",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

/// One link-bearing construct found in a page body. `ordinal` is 1-based per page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub page_id: String,
    pub ordinal: u32,
    pub kind: LinkKind,
    pub raw_value: String,
    pub display_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageMapping {
    pub source_page_id: String,
    pub target_page_id: String,
    pub target_title: String,
    pub offset_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub source_id: String,
    pub canonical_filename: String,
    pub content_type: String,
    pub name: String,
    pub download_url: String,
    pub filesize: Option<i64>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Image,
    Document,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Document => "document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(Self::Image),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Ok,
    Failed,
}

impl UploadOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRecord {
    pub asset: AssetKind,
    pub source_page_id: String,
    pub target_page_id: String,
    pub source_link_value: String,
    pub source_attachment_id: Option<String>,
    pub target_attachment_id: Option<String>,
    pub filename: Option<String>,
    pub outcome: UploadOutcome,
    pub detail: Option<String>,
}

impl UploadRecord {
    pub fn is_ok(&self) -> bool {
        self.outcome == UploadOutcome::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSpace {
    pub id: String,
    pub name: String,
    pub wiki_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceUser {
    pub id: String,
    pub login: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceTicket {
    pub id: String,
    pub number: u64,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketKey {
    pub ticket_number: u64,
    pub issue_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishFailure {
    pub source_page_id: String,
    pub title: String,
    pub error: String,
}

/// Parse the timestamp formats seen in source exports into UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S %z")
                .ok()
                .map(|parsed| parsed.with_timezone(&Utc))
        })
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Human form used in page banners and tree listings: `YYYY-MM-DD HH:MM:SS`.
pub fn display_timestamp(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiki_format_three_is_html() {
        assert_eq!(PageFormat::from_wiki_format(3), PageFormat::Html);
        assert_eq!(PageFormat::from_wiki_format(1), PageFormat::Plain);
        assert_eq!(PageFormat::from_wiki_format(2), PageFormat::Plain);
    }

    #[test]
    fn parse_timestamp_accepts_export_formats() {
        let rfc = parse_timestamp("2015-03-11T10:36:38.000Z").expect("rfc3339");
        let offset = parse_timestamp("2015-03-11T12:36:38+02:00").expect("offset");
        let spaced = parse_timestamp("2015-03-11 10:36:38").expect("spaced");
        assert_eq!(rfc, offset);
        assert_eq!(rfc, spaced);
        assert_eq!(display_timestamp(&rfc), "2015-03-11 10:36:38");
        assert_eq!(format_timestamp(&rfc), "2015-03-11T10:36:38Z");
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn link_kind_names_round_trip() {
        for kind in LinkKind::ALL {
            assert_eq!(LinkKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LinkKind::parse("markdown"), None);
    }
}
