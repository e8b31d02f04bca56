use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::{Result, bail};
use regex::Regex;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use tracing::{info, warn};

use crate::ledger::Ledger;
use crate::links::{
    AnchorTarget, anchor_pattern, attachment_id, classify_anchor, image_pattern,
    strip_download_suffix, ticket_number, wiki_link_title, wiki_ref_title,
};
use crate::mapping::IdMapper;
use crate::model::{AssetKind, Link, LinkKind, UploadRecord};
use crate::target::TargetApi;

const VIEW_FILE_MACRO_ID: &str = "67cbeb86-e40d-4216-ada2-d20e7e019ccb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RewritePass {
    Images,
    Pages,
    MdPages,
    MdUrls,
    Documents,
    Tickets,
}

impl RewritePass {
    pub const ALL: [RewritePass; 6] = [
        RewritePass::Images,
        RewritePass::Pages,
        RewritePass::MdPages,
        RewritePass::MdUrls,
        RewritePass::Documents,
        RewritePass::Tickets,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Pages => "pages",
            Self::MdPages => "md-pages",
            Self::MdUrls => "md-urls",
            Self::Documents => "documents",
            Self::Tickets => "tickets",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|pass| pass.as_str() == value)
    }

    /// Whether `link` is rewritten by this pass.
    pub fn handles(self, link: &Link) -> bool {
        match self {
            Self::Images => link.kind == LinkKind::Image,
            Self::Pages => {
                link.kind == LinkKind::Anchor
                    && classify_anchor(&link.raw_value) == AnchorTarget::WikiPage
            }
            Self::MdPages => link.kind == LinkKind::WikiRef,
            Self::MdUrls => link.kind == LinkKind::MdUrl,
            Self::Documents => {
                link.kind == LinkKind::Anchor
                    && classify_anchor(&link.raw_value) == AnchorTarget::Document
            }
            Self::Tickets => {
                link.kind == LinkKind::Anchor
                    && classify_anchor(&link.raw_value) == AnchorTarget::Ticket
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum LinkOutcome {
    Ok,
    Nok(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkResult {
    pub ordinal: u32,
    pub raw_value: String,
    pub outcome: LinkOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub content: String,
    pub results: Vec<LinkResult>,
}

impl Substitution {
    pub fn ok_count(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome == LinkOutcome::Ok)
            .count()
    }
}

/// Everything a pass needs to decide a replacement, loaded once per pass.
#[derive(Debug, Clone, Default)]
pub struct RewriteContext {
    pub mapper: IdMapper,
    uploads: HashMap<(AssetKind, String, String), UploadRecord>,
    documents_by_id: HashMap<(String, String), UploadRecord>,
    ticket_keys: HashMap<u64, String>,
    known_tickets: HashSet<u64>,
}

impl RewriteContext {
    pub fn load(ledger: &Ledger) -> Result<Self> {
        let mut context = Self {
            mapper: IdMapper::load(ledger)?,
            ..Self::default()
        };
        for record in ledger.uploads()? {
            context.add_upload(record);
        }
        for key in ledger.ticket_keys()? {
            context.ticket_keys.insert(key.ticket_number, key.issue_key);
        }
        context.known_tickets = ledger
            .tickets()?
            .into_iter()
            .map(|ticket| ticket.number)
            .collect();
        Ok(context)
    }

    pub fn add_upload(&mut self, record: UploadRecord) {
        if record.is_ok()
            && record.asset == AssetKind::Document
            && let Some(source_id) = record.source_attachment_id.clone()
        {
            self.documents_by_id
                .entry((record.source_page_id.clone(), source_id))
                .or_insert_with(|| record.clone());
        }
        self.uploads.insert(
            (
                record.asset,
                record.source_page_id.clone(),
                record.source_link_value.clone(),
            ),
            record,
        );
    }

    pub fn add_ticket(&mut self, number: u64, issue_key: Option<&str>) {
        self.known_tickets.insert(number);
        if let Some(key) = issue_key {
            self.ticket_keys.insert(number, key.to_string());
        }
    }

    fn upload(&self, asset: AssetKind, link: &Link) -> Option<&UploadRecord> {
        self.uploads
            .get(&(asset, link.page_id.clone(), link.raw_value.clone()))
    }

    /// Uploaded document on the same source page carrying the same source document id.
    fn document_by_id(&self, page_id: &str, document_id: &str) -> Option<&UploadRecord> {
        self.documents_by_id
            .get(&(page_id.to_string(), document_id.to_string()))
    }

    /// Target page addressed by a link, as (target id, target title).
    fn linked_page(&self, title: &str) -> Option<(&str, &str)> {
        let target_id = self.mapper.target_by_title(title)?;
        let target_title = self.mapper.title_of(target_id)?;
        Some((target_id, target_title))
    }
}

/// Target page ids whose current version is needed to rewrite `links`.
pub fn required_versions(pass: RewritePass, links: &[Link], context: &RewriteContext) -> Vec<String> {
    let mut ids = BTreeSet::new();
    for link in links.iter().filter(|link| pass.handles(link)) {
        let title = match pass {
            RewritePass::Pages => wiki_link_title(&link.raw_value),
            RewritePass::MdPages => wiki_ref_title(&link.raw_value),
            RewritePass::MdUrls if link.raw_value.contains("/wiki/") => {
                wiki_link_title(&link.raw_value)
            }
            _ => None,
        };
        if let Some((target_id, _)) = title.as_deref().and_then(|title| context.linked_page(title)) {
            ids.insert(target_id.to_string());
        }
    }
    ids.into_iter().collect()
}

/// Apply one pass to a page body. Each link replaces at most its first remaining
/// occurrence, so running a pass twice reports the second run as NOK and leaves the
/// content unchanged.
pub fn substitute(
    pass: RewritePass,
    content: &str,
    links: &[Link],
    context: &RewriteContext,
    versions: &HashMap<String, u64>,
) -> Substitution {
    let mut current = content.to_string();
    let mut results = Vec::new();

    for link in links.iter().filter(|link| pass.handles(link)) {
        let outcome = match plan_replacement(pass, link, context, versions) {
            Err(outcome) => outcome,
            Ok(replacement) => match replace_first(pass, &current, link, &replacement) {
                Some(updated) => {
                    current = updated;
                    LinkOutcome::Ok
                }
                None => LinkOutcome::Nok("link not found in content".to_string()),
            },
        };
        results.push(LinkResult {
            ordinal: link.ordinal,
            raw_value: link.raw_value.clone(),
            outcome,
        });
    }

    Substitution {
        content: current,
        results,
    }
}

fn plan_replacement(
    pass: RewritePass,
    link: &Link,
    context: &RewriteContext,
    versions: &HashMap<String, u64>,
) -> Result<String, LinkOutcome> {
    match pass {
        RewritePass::Images => {
            let record = uploaded(context, AssetKind::Image, link)?;
            Ok(image_markup(record.filename.as_deref().unwrap_or_default()))
        }
        RewritePass::Pages => {
            let title = wiki_link_title(&link.raw_value)
                .ok_or_else(|| LinkOutcome::Nok("no page title in link".to_string()))?;
            page_link_for(&title, context, versions)
        }
        RewritePass::MdPages => {
            let Some(title) = wiki_ref_title(&link.raw_value) else {
                return Err(LinkOutcome::Skipped("not a page reference".to_string()));
            };
            page_link_for(&title, context, versions)
        }
        RewritePass::MdUrls => Ok(md_url_replacement(link, context, versions)),
        RewritePass::Documents => {
            let record = uploaded(context, AssetKind::Document, link)?;
            Ok(document_macro(record.filename.as_deref().unwrap_or_default()))
        }
        RewritePass::Tickets => {
            let number = ticket_number(&link.raw_value)
                .ok_or_else(|| LinkOutcome::Nok("no ticket number in link".to_string()))?;
            if !context.known_tickets.contains(&number) {
                return Err(LinkOutcome::Nok(format!("unknown ticket #{number}")));
            }
            context
                .ticket_keys
                .get(&number)
                .cloned()
                .ok_or_else(|| LinkOutcome::Nok(format!("no issue key for ticket #{number}")))
        }
    }
}

fn uploaded<'a>(
    context: &'a RewriteContext,
    asset: AssetKind,
    link: &Link,
) -> Result<&'a UploadRecord, LinkOutcome> {
    match context.upload(asset, link) {
        Some(record) if record.is_ok() => Ok(record),
        Some(record) => Err(LinkOutcome::Nok(format!(
            "upload failed: {}",
            record.detail.as_deref().unwrap_or("unknown error")
        ))),
        None => Err(LinkOutcome::Nok(format!("{} not uploaded", asset.as_str()))),
    }
}

fn page_link_for(
    title: &str,
    context: &RewriteContext,
    versions: &HashMap<String, u64>,
) -> Result<String, LinkOutcome> {
    let (target_id, target_title) = context
        .linked_page(title)
        .ok_or_else(|| LinkOutcome::Nok(format!("page '{title}' not migrated")))?;
    let version = versions
        .get(target_id)
        .ok_or_else(|| LinkOutcome::Nok(format!("cannot get version of page {target_id}")))?;
    Ok(page_link_markup(target_title, *version))
}

/// Page link for migrated wiki pages, document macro for documents uploaded from the
/// same page, plain anchor otherwise.
fn md_url_replacement(link: &Link, context: &RewriteContext, versions: &HashMap<String, u64>) -> String {
    let url = &link.raw_value;
    if url.contains("/wiki/")
        && let Some(title) = wiki_link_title(url)
        && let Ok(markup) = page_link_for(&title, context, versions)
    {
        return markup;
    }
    if url.contains("/documents/")
        && let Some(document_id) = attachment_id(url)
        && let Some(record) = context.document_by_id(&link.page_id, &document_id)
    {
        return document_macro(record.filename.as_deref().unwrap_or_default());
    }
    format!("<a href=\"{url}\">{}</a>", link.display_text)
}

fn replace_first(pass: RewritePass, content: &str, link: &Link, replacement: &str) -> Option<String> {
    match pass {
        RewritePass::Images => replace_first_match(content, image_pattern(), replacement, |caps| {
            strip_download_suffix(&caps[1]) == link.raw_value
        }),
        RewritePass::Pages | RewritePass::Documents => {
            replace_first_match(content, anchor_pattern(), replacement, |caps| {
                caps[1] == link.raw_value
            })
        }
        RewritePass::Tickets => replace_first_match(content, anchor_pattern(), replacement, |caps| {
            caps[1] == link.raw_value && caps[2] == link.display_text
        }),
        RewritePass::MdPages => {
            replace_literal(content, &format!("[[{}]]", link.raw_value), replacement)
        }
        RewritePass::MdUrls => replace_literal(
            content,
            &format!("[{}]({})", link.display_text, link.raw_value),
            replacement,
        ),
    }
}

fn replace_first_match<F>(content: &str, pattern: &Regex, replacement: &str, accept: F) -> Option<String>
where
    F: Fn(&regex::Captures<'_>) -> bool,
{
    let found = pattern
        .captures_iter(content)
        .find(|caps| accept(caps))?
        .get(0)?
        .range();
    let mut updated = String::with_capacity(content.len() + replacement.len());
    updated.push_str(&content[..found.start]);
    updated.push_str(replacement);
    updated.push_str(&content[found.end..]);
    Some(updated)
}

fn replace_literal(content: &str, needle: &str, replacement: &str) -> Option<String> {
    content
        .contains(needle)
        .then(|| content.replacen(needle, replacement, 1))
}

pub fn image_markup(filename: &str) -> String {
    format!(
        "<ac:image ac:height=\"250\"><ri:attachment ri:filename=\"{filename}\" ri:version-at-save=\"1\" /></ac:image>"
    )
}

pub fn page_link_markup(title: &str, version: u64) -> String {
    format!(
        "<ac:link><ri:page ri:content-title=\"{title}\" ri:version-at-save=\"{version}\" /></ac:link>"
    )
}

pub fn document_macro(filename: &str) -> String {
    format!(
        "<ac:structured-macro ac:name=\"view-file\" ac:schema-version=\"1\" ac:macro-id=\"{VIEW_FILE_MACRO_ID}\">\
         <ac:parameter ac:name=\"name\"><ri:attachment ri:filename=\"{filename}\" ri:version-at-save=\"1\" /></ac:parameter>\
         <ac:parameter ac:name=\"height\">250</ac:parameter></ac:structured-macro>"
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct RewritePageResult {
    pub source_page_id: String,
    pub target_page_id: Option<String>,
    pub title: Option<String>,
    pub action: String,
    pub ok: usize,
    pub nok: usize,
    pub changed_lines: Option<usize>,
    pub detail: Option<String>,
    pub links: Vec<LinkResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewriteReport {
    pub pass: RewritePass,
    pub dry_run: bool,
    pub pages_considered: usize,
    pub pages_updated: usize,
    pub pages_unchanged: usize,
    pub pages_skipped: usize,
    pub pages_failed: usize,
    pub links_ok: usize,
    pub links_nok: usize,
    pub links_skipped: usize,
    pub errors: Vec<String>,
    pub pages: Vec<RewritePageResult>,
    pub request_count: usize,
}

impl RewriteReport {
    fn new(pass: RewritePass, dry_run: bool) -> Self {
        Self {
            pass,
            dry_run,
            pages_considered: 0,
            pages_updated: 0,
            pages_unchanged: 0,
            pages_skipped: 0,
            pages_failed: 0,
            links_ok: 0,
            links_nok: 0,
            links_skipped: 0,
            errors: Vec::new(),
            pages: Vec::new(),
            request_count: 0,
        }
    }
}

/// Run one rewrite pass against live target content. Each page is read once and
/// written back at most once.
pub fn rewrite_with_api<T: TargetApi>(
    ledger: &Ledger,
    pass: RewritePass,
    dry_run: bool,
    target: &mut T,
) -> Result<RewriteReport> {
    let context = RewriteContext::load(ledger)?;
    let mut by_page: BTreeMap<String, Vec<Link>> = BTreeMap::new();
    for link in ledger.links()? {
        if pass.handles(&link) {
            by_page.entry(link.page_id.clone()).or_default().push(link);
        }
    }
    if pass == RewritePass::Tickets && !by_page.is_empty() && context.ticket_keys.is_empty() {
        warn!("no ticket keys imported; run `wikimigrate tickets import` first");
    }

    let mut report = RewriteReport::new(pass, dry_run);
    let mut versions: HashMap<String, u64> = HashMap::new();
    let mut unavailable: HashSet<String> = HashSet::new();

    for (source_page_id, links) in by_page {
        report.pages_considered += 1;
        let mut page_result = RewritePageResult {
            source_page_id: source_page_id.clone(),
            target_page_id: None,
            title: None,
            action: String::new(),
            ok: 0,
            nok: 0,
            changed_lines: None,
            detail: None,
            links: Vec::new(),
        };

        let Some(target_page_id) = context.mapper.target_for(&source_page_id) else {
            report.pages_skipped += 1;
            report.links_skipped += links.len();
            page_result.action = "skipped".to_string();
            page_result.detail = Some("page not published".to_string());
            report.pages.push(page_result);
            continue;
        };
        page_result.target_page_id = Some(target_page_id.to_string());
        page_result.title = context.mapper.title_of(target_page_id).map(str::to_string);

        let live = match target.get_page(target_page_id) {
            Ok(live) => live,
            Err(error) => {
                warn!(page = target_page_id, "cannot read page content: {error:#}");
                report.pages_failed += 1;
                report.links_nok += links.len();
                report.errors.push(format!("{target_page_id}: {error:#}"));
                page_result.action = "failed".to_string();
                page_result.detail = Some(format!("{error:#}"));
                report.pages.push(page_result);
                continue;
            }
        };
        if live.body.trim().is_empty() {
            report.pages_skipped += 1;
            report.links_skipped += links.len();
            page_result.action = "skipped".to_string();
            page_result.detail = Some("content is empty".to_string());
            report.pages.push(page_result);
            continue;
        }

        for linked_id in required_versions(pass, &links, &context) {
            if versions.contains_key(&linked_id) || unavailable.contains(&linked_id) {
                continue;
            }
            match target.get_page_version(&linked_id) {
                Ok(version) => {
                    versions.insert(linked_id, version);
                }
                Err(error) => {
                    warn!(page = %linked_id, "cannot get page version: {error:#}");
                    unavailable.insert(linked_id);
                }
            }
        }

        let substitution = substitute(pass, &live.body, &links, &context, &versions);
        for result in &substitution.results {
            match &result.outcome {
                LinkOutcome::Ok => page_result.ok += 1,
                LinkOutcome::Nok(reason) => {
                    page_result.nok += 1;
                    info!(page = target_page_id, link = %result.raw_value, "NOK: {reason}");
                }
                LinkOutcome::Skipped(_) => report.links_skipped += 1,
            }
        }
        report.links_ok += page_result.ok;
        report.links_nok += page_result.nok;

        if substitution.content == live.body {
            report.pages_unchanged += 1;
            page_result.action = "unchanged".to_string();
        } else if dry_run {
            report.pages_updated += 1;
            page_result.action = "would_update".to_string();
            page_result.changed_lines = Some(changed_lines(&live.body, &substitution.content));
        } else {
            match target.update_page(target_page_id, &live.title, &substitution.content) {
                Ok(updated) => {
                    report.pages_updated += 1;
                    page_result.action = "updated".to_string();
                    page_result.changed_lines =
                        Some(changed_lines(&live.body, &substitution.content));
                    info!(
                        page = target_page_id,
                        version = updated.version,
                        ok = page_result.ok,
                        nok = page_result.nok,
                        "updated page"
                    );
                }
                Err(error) => {
                    warn!(page = target_page_id, "page update failed: {error:#}");
                    report.pages_failed += 1;
                    report.errors.push(format!("{target_page_id}: {error:#}"));
                    page_result.action = "failed".to_string();
                    page_result.detail = Some(format!("{error:#}"));
                }
            }
        }
        page_result.links = substitution.results;
        report.pages.push(page_result);
    }

    report.request_count = target.request_count();
    Ok(report)
}

pub fn parse_pass(value: &str) -> Result<RewritePass> {
    let Some(pass) = RewritePass::parse(value) else {
        let known = RewritePass::ALL
            .iter()
            .map(|pass| pass.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        bail!("unknown rewrite pass '{value}' (expected one of: {known})");
    };
    Ok(pass)
}

fn changed_lines(before: &str, after: &str) -> usize {
    TextDiff::from_lines(before, after)
        .iter_all_changes()
        .filter(|change| change.tag() != ChangeTag::Equal)
        .count()
}
