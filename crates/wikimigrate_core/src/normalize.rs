use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesText, Event};
use regex::{Captures, Regex};

use crate::model::PageFormat;

const INDENT_WIDTH: usize = 2;

const INLINE_TAGS: [&[u8]; 20] = [
    b"a", b"abbr", b"b", b"br", b"cite", b"code", b"del", b"em", b"i", b"img", b"kbd", b"q",
    b"s", b"small", b"strong", b"sub", b"sup", b"tt", b"u", b"wbr",
];

static LINE_BREAK: OnceLock<Regex> = OnceLock::new();
static STRIKE_OPEN: OnceLock<Regex> = OnceLock::new();
static STRIPPED_TAGS: OnceLock<Regex> = OnceLock::new();
static HEADING_OPEN: OnceLock<Regex> = OnceLock::new();
static VOID_MEDIA_TAG: OnceLock<Regex> = OnceLock::new();
static LIST_ITEM_OPEN: OnceLock<Regex> = OnceLock::new();
static WBR_TAG: OnceLock<Regex> = OnceLock::new();
static BR_TAG: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub body: String,
    /// Set when the pretty-printer rejected the repaired markup; `body` is then the
    /// repaired but un-indented text.
    pub warning: Option<String>,
}

pub fn normalize(raw_body: &str, format: PageFormat) -> Normalized {
    match format {
        PageFormat::Plain => Normalized {
            body: normalize_plain(raw_body),
            warning: None,
        },
        PageFormat::Html => {
            let repaired = repair_html(raw_body);
            match pretty_print(&repaired) {
                Ok(body) => Normalized {
                    body,
                    warning: None,
                },
                Err(error) => Normalized {
                    body: repaired,
                    warning: Some(format!("{error:#}")),
                },
            }
        }
    }
}

pub fn normalize_plain(text: &str) -> String {
    let escaped = escape_html(text);
    line_break_pattern()
        .replace_all(&escaped, "<br/>")
        .into_owned()
}

pub fn escape_html(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#39;"),
            other => output.push(other),
        }
    }
    output
}

/// Ordered tag repairs that make source HTML acceptable to the target's storage format.
pub fn repair_html(html: &str) -> String {
    let mut output = html.replace("<package>", "&lt;package&gt;");

    output = regex(&STRIKE_OPEN, r"<strike\b[^>]*>")
        .replace_all(&output, "<del>")
        .into_owned();
    output = output.replace("</strike>", "</del>");

    output = regex(&STRIPPED_TAGS, r"</?(?:span|font|colgroup)\b[^>]*>")
        .replace_all(&output, "")
        .into_owned();

    output = regex(&HEADING_OPEN, r"<(h[1-6])\b[^>]*>")
        .replace_all(&output, "<$1>")
        .into_owned();

    output = regex(&VOID_MEDIA_TAG, r"<(?:col|img)\b[^>]*>")
        .replace_all(&output, |caps: &Captures<'_>| self_close(&caps[0]))
        .into_owned();

    output = regex(&LIST_ITEM_OPEN, r"<li\b[^>]*>")
        .replace_all(&output, "<li>")
        .into_owned();

    output = regex(&WBR_TAG, r"<wbr\b[^>]*>")
        .replace_all(&output, "<wbr/>")
        .into_owned();
    regex(&BR_TAG, r"<br\b[^>]*>")
        .replace_all(&output, "<br/>")
        .into_owned()
}

/// Re-indent markup one block element per line. Inline elements and `<pre>` blocks are
/// copied through byte for byte. Fails on mismatched or unclosed tags.
pub fn pretty_print(markup: &str) -> Result<String> {
    let mut reader = Reader::from_str(markup);
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', INDENT_WIDTH);
    let mut depth = 0usize;

    loop {
        let event_start = offset(reader.buffer_position())?;
        let event = reader
            .read_event()
            .with_context(|| format!("markup error at byte {}", reader.buffer_position()))?;
        match event {
            Event::Eof => break,
            Event::Start(start) if keeps_layout(start.local_name().as_ref()) => {
                let preformatted = start.local_name().as_ref() == b"pre";
                reader.read_to_end(start.name()).with_context(|| {
                    format!(
                        "element <{}> at byte {event_start} is not closed",
                        String::from_utf8_lossy(start.name().as_ref())
                    )
                })?;
                let end = offset(reader.buffer_position())?;
                write_verbatim(&mut writer, &markup[event_start..end], preformatted)?;
            }
            Event::Empty(empty) if keeps_layout(empty.local_name().as_ref()) => {
                let end = offset(reader.buffer_position())?;
                write_verbatim(&mut writer, &markup[event_start..end], false)?;
            }
            Event::Start(start) => {
                depth += 1;
                writer
                    .write_event(Event::Start(start))
                    .context("failed to write start tag")?;
            }
            Event::End(end) => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    anyhow::anyhow!(
                        "unexpected closing tag </{}>",
                        String::from_utf8_lossy(end.name().as_ref())
                    )
                })?;
                writer
                    .write_event(Event::End(end))
                    .context("failed to write end tag")?;
            }
            Event::Text(text)
                if text.contains(&b'\n') && text.iter().all(u8::is_ascii_whitespace) => {}
            other => writer
                .write_event(other)
                .context("failed to write markup event")?,
        }
    }

    if depth > 0 {
        bail!("{depth} element(s) left unclosed");
    }
    String::from_utf8(writer.into_inner()).context("pretty-printed markup is not valid UTF-8")
}

/// Elements whose source layout is kept: inline markup stays on its line, `<pre>` keeps
/// its whitespace.
fn keeps_layout(name: &[u8]) -> bool {
    INLINE_TAGS.contains(&name) || name == b"pre"
}

/// Raw markup is written as already-escaped text, which the writer never indents.
/// Preformatted blocks still start on their own line.
fn write_verbatim(writer: &mut Writer<Vec<u8>>, raw: &str, own_line: bool) -> Result<()> {
    if own_line && !writer.get_ref().is_empty() {
        writer.write_indent().context("failed to write indent")?;
    }
    writer
        .write_event(Event::Text(BytesText::from_escaped(raw)))
        .context("failed to write inline markup")
}

fn offset<T>(position: T) -> Result<usize>
where
    usize: TryFrom<T>,
    <usize as TryFrom<T>>::Error: std::error::Error + Send + Sync + 'static,
{
    usize::try_from(position).context("markup offset does not fit into usize")
}

fn self_close(tag: &str) -> String {
    if tag.ends_with("/>") {
        return tag.to_string();
    }
    let inner = tag[..tag.len() - 1].trim_end();
    format!("{inner}/>")
}

fn line_break_pattern() -> &'static Regex {
    regex(&LINE_BREAK, r"\n\r?|\r\n?")
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}
