use std::collections::HashSet;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::attachments::{
    DownloadReport, UploadReport, download_attachments, is_document_link, upload_assets_with_api,
};
use crate::ledger::{Ledger, LedgerCounts, STATE_SOURCE_SPACE_ID};
use crate::links::{
    AnchorTarget, LinkSummary, SpaceMatcher, attachment_id, classify_anchor, extract, summarize,
    ticket_number, wiki_link_title, wiki_ref_title,
};
use crate::model::{AssetKind, LinkKind, PageFormat, PublishFailure};
use crate::normalize::normalize;
use crate::publish::{PublishContext, PublishReport, publish_with_api, target_title};
use crate::rewrite::{RewritePass, RewriteReport, rewrite_with_api};
use crate::runtime::ResolvedPaths;
use crate::source::SourceApi;
use crate::target::TargetApi;
use crate::tree::PageForest;

#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub pages: usize,
    pub html_pages: usize,
    pub plain_pages: usize,
    pub root_pages: usize,
    pub warnings: Vec<String>,
    pub tree: Vec<String>,
    pub links: LinkSummary,
}

pub fn source_space_id(ledger: &Ledger) -> Result<String> {
    match ledger.state(STATE_SOURCE_SPACE_ID)? {
        Some(space_id) => Ok(space_id),
        None => bail!("no source space exported yet; run `wikimigrate export` first"),
    }
}

/// Validate the page tree, normalize every body and rebuild the link ledger.
/// Tree errors abort before any row changes.
pub fn prepare(ledger: &mut Ledger) -> Result<PrepareReport> {
    let stored = ledger.source_pages()?;
    if stored.is_empty() {
        bail!("no source pages exported yet; run `wikimigrate export` first");
    }
    let raw_pages = stored.iter().map(|entry| entry.page.clone()).collect::<Vec<_>>();
    let raw_forest = PageForest::build(raw_pages)?;

    let mut warnings = Vec::new();
    let mut updates = Vec::with_capacity(stored.len());
    for entry in &stored {
        let normalized = normalize(&entry.page.body, entry.page.format);
        if let Some(warning) = &normalized.warning {
            warn!(id = %entry.page.id, title = %entry.page.title, "{warning}");
            warnings.push(format!("{} ({}): {warning}", entry.page.title, entry.page.id));
        }
        updates.push((entry.ingest_order, normalized.body, normalized.warning));
    }
    ledger.store_normalized(&updates)?;

    let spaces = SpaceMatcher::from_spaces(&ledger.spaces()?);
    let pages = ledger.pages()?;
    let mut all_links = Vec::new();
    let mut by_page = Vec::with_capacity(pages.len());
    for page in &pages {
        let links = extract(&page.id, &page.body, &spaces);
        all_links.extend(links.iter().cloned());
        by_page.push((page.id.clone(), links));
    }
    ledger.replace_links(&by_page)?;
    let summary = summarize(&all_links);
    info!(pages = pages.len(), links = summary.total, "prepared pages");

    Ok(PrepareReport {
        pages: pages.len(),
        html_pages: pages
            .iter()
            .filter(|page| page.format == PageFormat::Html)
            .count(),
        plain_pages: pages
            .iter()
            .filter(|page| page.format == PageFormat::Plain)
            .count(),
        root_pages: raw_forest.root_pages().len(),
        warnings,
        tree: raw_forest.render(),
        links: summary,
    })
}

/// Normalized page forest as stored by `prepare`.
pub fn load_forest(ledger: &Ledger) -> Result<PageForest> {
    Ok(PageForest::build(ledger.pages()?)?)
}

pub fn publish<T: TargetApi>(
    ledger: &Ledger,
    context: &PublishContext,
    dry_run: bool,
    target: &mut T,
) -> Result<PublishReport> {
    let forest = load_forest(ledger)?;
    publish_with_api(ledger, &forest, context, dry_run, target)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkVerification {
    pub images: usize,
    pub images_downloaded: usize,
    pub documents: usize,
    pub documents_downloaded: usize,
    pub ticket_links: usize,
    pub tickets_known: usize,
    pub page_links: usize,
    pub titles_known: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub space_id: Option<String>,
    pub counts: LedgerCounts,
    pub verification: LinkVerification,
    pub publish_failures: Vec<PublishFailure>,
}

/// Ledger counts plus a check of every extracted link against what is available locally.
pub fn status(ledger: &Ledger, paths: &ResolvedPaths) -> Result<StatusReport> {
    let links = ledger.links()?;
    let tickets = ledger
        .tickets()?
        .into_iter()
        .map(|ticket| ticket.number)
        .collect::<HashSet<_>>();
    let titles = ledger
        .source_pages()?
        .into_iter()
        .map(|entry| target_title(&entry.page.title).to_lowercase())
        .collect::<HashSet<_>>();
    let downloaded = |value: &str| {
        attachment_id(value).is_some_and(|id| paths.attachments_dir.join(id).exists())
    };

    let mut verification = LinkVerification::default();
    for link in &links {
        match link.kind {
            LinkKind::Image => {
                verification.images += 1;
                verification.images_downloaded += usize::from(downloaded(&link.raw_value));
            }
            LinkKind::Anchor | LinkKind::MdUrl if is_document_link(link) => {
                verification.documents += 1;
                verification.documents_downloaded += usize::from(downloaded(&link.raw_value));
            }
            LinkKind::Anchor => match classify_anchor(&link.raw_value) {
                AnchorTarget::Ticket => {
                    verification.ticket_links += 1;
                    let known = ticket_number(&link.raw_value)
                        .is_some_and(|number| tickets.contains(&number));
                    verification.tickets_known += usize::from(known);
                }
                AnchorTarget::WikiPage => {
                    verification.page_links += 1;
                    let known = wiki_link_title(&link.raw_value)
                        .is_some_and(|title| titles.contains(&title.to_lowercase()));
                    verification.titles_known += usize::from(known);
                }
                _ => {}
            },
            LinkKind::WikiRef => {
                if let Some(title) = wiki_ref_title(&link.raw_value) {
                    verification.page_links += 1;
                    verification.titles_known +=
                        usize::from(titles.contains(&title.to_lowercase()));
                }
            }
            _ => {}
        }
    }

    Ok(StatusReport {
        space_id: ledger.state(STATE_SOURCE_SPACE_ID)?,
        counts: ledger.counts()?,
        verification,
        publish_failures: ledger.publish_failures()?,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub prepare: PrepareReport,
    pub download: DownloadReport,
    pub publish: PublishReport,
    pub uploads: Vec<UploadReport>,
    pub rewrites: Vec<RewriteReport>,
}

/// Every phase after `export`, in dependency order. Document uploads run before the
/// markdown URL pass so document URLs can resolve to uploaded files.
pub fn run_all<S: SourceApi, T: TargetApi>(
    ledger: &mut Ledger,
    paths: &ResolvedPaths,
    context: &PublishContext,
    dry_run: bool,
    source: &mut S,
    target: &mut T,
) -> Result<RunReport> {
    let prepare = prepare(ledger)?;
    let space_id = source_space_id(ledger)?;
    let download = download_attachments(ledger, &space_id, &paths.attachments_dir, source)?;
    let publish = publish(ledger, context, dry_run, target)?;

    let mut uploads = Vec::new();
    let mut rewrites = Vec::new();
    rewrites.push(rewrite_with_api(ledger, RewritePass::Pages, dry_run, target)?);
    uploads.push(upload_assets_with_api(
        ledger,
        &paths.attachments_dir,
        AssetKind::Image,
        dry_run,
        target,
    )?);
    rewrites.push(rewrite_with_api(ledger, RewritePass::Images, dry_run, target)?);
    rewrites.push(rewrite_with_api(ledger, RewritePass::MdPages, dry_run, target)?);
    uploads.push(upload_assets_with_api(
        ledger,
        &paths.attachments_dir,
        AssetKind::Document,
        dry_run,
        target,
    )?);
    for pass in [RewritePass::MdUrls, RewritePass::Documents, RewritePass::Tickets] {
        rewrites.push(rewrite_with_api(ledger, pass, dry_run, target)?);
    }

    Ok(RunReport {
        dry_run,
        prepare,
        download,
        publish,
        uploads,
        rewrites,
    })
}
