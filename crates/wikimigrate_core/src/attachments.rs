use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::ledger::Ledger;
use crate::links::{AnchorTarget, attachment_id, classify_anchor};
use crate::mapping::IdMapper;
use crate::model::{AssetKind, Attachment, Link, LinkKind, UploadOutcome, UploadRecord};
use crate::source::SourceApi;
use crate::target::TargetApi;

/// Resolves attachment links of one source space to stored attachment metadata.
/// Lookups are cached for the lifetime of the resolver, misses included.
pub struct AttachmentResolver {
    space_id: String,
    download_dir: PathBuf,
    cache: HashMap<String, Attachment>,
    missing: HashSet<String>,
    filenames: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded,
    AlreadyPresent,
}

impl AttachmentResolver {
    pub fn new(space_id: &str, download_dir: &Path, known: Vec<Attachment>) -> Self {
        let mut resolver = Self {
            space_id: space_id.to_string(),
            download_dir: download_dir.to_path_buf(),
            cache: HashMap::new(),
            missing: HashSet::new(),
            filenames: HashMap::new(),
        };
        for attachment in known {
            resolver.remember(attachment);
        }
        resolver
    }

    pub fn load(ledger: &Ledger, space_id: &str, download_dir: &Path) -> Result<Self> {
        Ok(Self::new(space_id, download_dir, ledger.attachments()?))
    }

    pub fn local_path(&self, source_id: &str) -> PathBuf {
        self.download_dir.join(source_id)
    }

    pub fn cached(&self, source_id: &str) -> Option<&Attachment> {
        self.cache.get(source_id)
    }

    /// Look up the attachment behind `raw_value`. Lookup failures are logged and
    /// reported as `None`; only ledger writes propagate as errors.
    pub fn resolve<A: SourceApi>(
        &mut self,
        api: &mut A,
        ledger: &Ledger,
        raw_value: &str,
    ) -> Result<Option<Attachment>> {
        let Some(source_id) = attachment_id(raw_value) else {
            warn!(link = raw_value, "attachment link has no resource id");
            return Ok(None);
        };
        if let Some(found) = self.cache.get(&source_id) {
            return Ok(Some(found.clone()));
        }
        if self.missing.contains(&source_id) {
            return Ok(None);
        }

        let meta = match api.get_document(&self.space_id, &source_id) {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                warn!(link = raw_value, id = %source_id, "attachment not found in source space");
                self.missing.insert(source_id);
                return Ok(None);
            }
            Err(error) => {
                warn!(link = raw_value, id = %source_id, "attachment lookup failed: {error:#}");
                self.missing.insert(source_id);
                return Ok(None);
            }
        };

        let attachment = Attachment {
            canonical_filename: self.unique_filename(&source_id, &meta.filename),
            source_id,
            content_type: meta.content_type,
            name: meta.name,
            download_url: meta.url,
            filesize: meta.filesize,
            sha256: None,
        };
        ledger.upsert_attachment(&attachment)?;
        self.remember(attachment.clone());
        Ok(Some(attachment))
    }

    /// Store the binary at `<download_dir>/<source_id>`; an existing file is kept.
    /// Bytes land in `<source_id>.part` first and are renamed once fully written.
    pub fn download<A: SourceApi>(
        &mut self,
        api: &mut A,
        ledger: &Ledger,
        attachment: &Attachment,
    ) -> Result<DownloadOutcome> {
        let path = self.local_path(&attachment.source_id);
        if path.exists() {
            if attachment.sha256.is_none() {
                let bytes = fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                self.store_checksum(ledger, attachment, &bytes)?;
            }
            return Ok(DownloadOutcome::AlreadyPresent);
        }
        fs::create_dir_all(&self.download_dir).with_context(|| {
            format!("failed to create {}", self.download_dir.display())
        })?;
        let bytes = api.download(&attachment.download_url)?;
        // Only a complete file may appear under the final name.
        let partial = path.with_file_name(format!("{}.part", attachment.source_id));
        fs::write(&partial, &bytes)
            .with_context(|| format!("failed to write {}", partial.display()))?;
        fs::rename(&partial, &path).with_context(|| {
            format!("failed to move {} to {}", partial.display(), path.display())
        })?;
        self.store_checksum(ledger, attachment, &bytes)?;
        Ok(DownloadOutcome::Downloaded)
    }

    fn store_checksum(&mut self, ledger: &Ledger, attachment: &Attachment, bytes: &[u8]) -> Result<()> {
        let updated = Attachment {
            sha256: Some(sha256_hex(bytes)),
            filesize: Some(i64::try_from(bytes.len()).context("file size does not fit into i64")?),
            ..attachment.clone()
        };
        ledger.upsert_attachment(&updated)?;
        self.cache.insert(updated.source_id.clone(), updated);
        Ok(())
    }

    fn remember(&mut self, attachment: Attachment) {
        self.filenames
            .entry(attachment.canonical_filename.to_lowercase())
            .or_insert_with(|| attachment.source_id.clone());
        self.cache.insert(attachment.source_id.clone(), attachment);
    }

    /// Filenames must be unique per migration; a clash gets the source id as prefix.
    fn unique_filename(&self, source_id: &str, filename: &str) -> String {
        let base = if filename.trim().is_empty() {
            source_id.to_string()
        } else {
            filename.trim().to_string()
        };
        match self.filenames.get(&base.to_lowercase()) {
            Some(owner) if owner != source_id => format!("{source_id}-{base}"),
            _ => base,
        }
    }
}

/// Links of `asset` kind: images for `Image`; document anchors and `/documents/`
/// markdown URLs for `Document`.
pub fn asset_links(links: &[Link], asset: AssetKind) -> Vec<&Link> {
    links
        .iter()
        .filter(|link| match asset {
            AssetKind::Image => link.kind == LinkKind::Image,
            AssetKind::Document => is_document_link(link),
        })
        .collect()
}

pub fn is_document_link(link: &Link) -> bool {
    match link.kind {
        LinkKind::Anchor => classify_anchor(&link.raw_value) == AnchorTarget::Document,
        LinkKind::MdUrl => link.raw_value.contains("/documents/"),
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub links_considered: usize,
    pub unique_attachments: usize,
    pub downloaded: usize,
    pub already_present: usize,
    pub missing: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub request_count: usize,
}

/// Fetch metadata and binaries for every attachment referenced by an image link,
/// a document anchor, or a document markdown URL. Each attachment id is handled once.
pub fn download_attachments<A: SourceApi>(
    ledger: &Ledger,
    space_id: &str,
    download_dir: &Path,
    api: &mut A,
) -> Result<DownloadReport> {
    let links = ledger.links()?;
    let mut resolver = AttachmentResolver::load(ledger, space_id, download_dir)?;
    let candidates = links
        .iter()
        .filter(|link| link.kind == LinkKind::Image || is_document_link(link))
        .collect::<Vec<_>>();

    let mut report = DownloadReport {
        links_considered: candidates.len(),
        unique_attachments: 0,
        downloaded: 0,
        already_present: 0,
        missing: 0,
        failed: 0,
        errors: Vec::new(),
        request_count: 0,
    };

    let mut seen = BTreeSet::new();
    for link in candidates {
        let Some(source_id) = attachment_id(&link.raw_value) else {
            report.missing += 1;
            continue;
        };
        if !seen.insert(source_id) {
            continue;
        }
        report.unique_attachments += 1;
        let Some(attachment) = resolver.resolve(api, ledger, &link.raw_value)? else {
            report.missing += 1;
            continue;
        };
        match resolver.download(api, ledger, &attachment) {
            Ok(DownloadOutcome::Downloaded) => {
                info!(id = %attachment.source_id, file = %attachment.canonical_filename, "downloaded attachment");
                report.downloaded += 1;
            }
            Ok(DownloadOutcome::AlreadyPresent) => report.already_present += 1,
            Err(error) => {
                warn!(url = %attachment.download_url, "download failed: {error:#}");
                report.failed += 1;
                report
                    .errors
                    .push(format!("{}: {error:#}", attachment.source_id));
            }
        }
    }

    report.request_count = api.request_count();
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadItem {
    pub page_id: String,
    pub link: String,
    pub filename: Option<String>,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub asset: AssetKind,
    pub dry_run: bool,
    pub considered: usize,
    pub uploaded: usize,
    pub reused: usize,
    pub already_uploaded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub items: Vec<UploadItem>,
    pub request_count: usize,
}

/// Attach every downloaded `asset` to the target page its source page was published
/// as. One record per (page, link) is persisted as soon as the attempt finishes.
pub fn upload_assets_with_api<T: TargetApi>(
    ledger: &Ledger,
    download_dir: &Path,
    asset: AssetKind,
    dry_run: bool,
    target: &mut T,
) -> Result<UploadReport> {
    let links = ledger.links()?;
    let mapper = IdMapper::load(ledger)?;
    let attachments = ledger
        .attachments()?
        .into_iter()
        .map(|attachment| (attachment.source_id.clone(), attachment))
        .collect::<HashMap<_, _>>();

    let previous = ledger.uploads()?;
    let mut done = previous
        .iter()
        .filter(|record| record.asset == asset && record.is_ok())
        .map(|record| (record.source_page_id.clone(), record.source_link_value.clone()))
        .collect::<HashSet<_>>();
    let mut on_page: BTreeMap<(String, String), UploadRecord> = BTreeMap::new();
    for record in previous.into_iter().filter(UploadRecord::is_ok) {
        if let Some(source_id) = record.source_attachment_id.clone() {
            on_page
                .entry((record.target_page_id.clone(), source_id))
                .or_insert(record);
        }
    }

    let mut report = UploadReport {
        asset,
        dry_run,
        considered: 0,
        uploaded: 0,
        reused: 0,
        already_uploaded: 0,
        failed: 0,
        errors: Vec::new(),
        items: Vec::new(),
        request_count: 0,
    };

    let mut handled = HashSet::new();
    for link in asset_links(&links, asset) {
        let key = (link.page_id.clone(), link.raw_value.clone());
        if !handled.insert(key.clone()) {
            continue;
        }
        report.considered += 1;
        if done.contains(&key) {
            report.already_uploaded += 1;
            continue;
        }
        let source_id = attachment_id(&link.raw_value);

        let mut record = UploadRecord {
            asset,
            source_page_id: link.page_id.clone(),
            target_page_id: String::new(),
            source_link_value: link.raw_value.clone(),
            source_attachment_id: source_id.clone(),
            target_attachment_id: None,
            filename: None,
            outcome: UploadOutcome::Failed,
            detail: None,
        };

        let Some(target_page_id) = mapper.target_for(&link.page_id) else {
            let detail = format!("cannot find target page for source page '{}'", link.page_id);
            finish_failed(ledger, &mut report, record, detail, dry_run)?;
            continue;
        };
        record.target_page_id = target_page_id.to_string();

        let Some(attachment) = source_id.as_deref().and_then(|id| attachments.get(id)) else {
            let detail = format!(
                "attachment '{}' has not been downloaded",
                source_id.as_deref().unwrap_or(&link.raw_value)
            );
            finish_failed(ledger, &mut report, record, detail, dry_run)?;
            continue;
        };
        record.filename = Some(attachment.canonical_filename.clone());

        if let Some(existing) =
            on_page.get(&(target_page_id.to_string(), attachment.source_id.clone()))
        {
            record.outcome = UploadOutcome::Ok;
            record.target_attachment_id = existing.target_attachment_id.clone();
            record.detail = Some("already attached to target page".to_string());
            if !dry_run {
                ledger.record_upload(&record)?;
                done.insert(key);
            }
            report.reused += 1;
            push_item(&mut report, &record, if dry_run { "would_reuse" } else { "reused" });
            continue;
        }

        let path = download_dir.join(&attachment.source_id);
        if !path.exists() {
            let detail = format!("missing local file {}", path.display());
            finish_failed(ledger, &mut report, record, detail, dry_run)?;
            continue;
        }

        if dry_run {
            push_item(&mut report, &record, "would_upload");
            continue;
        }

        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        match target.upload_attachment(
            target_page_id,
            &attachment.canonical_filename,
            &attachment.content_type,
            &bytes,
        ) {
            Ok(uploaded) => {
                if let Err(error) =
                    target.set_attachment_content_type(target_page_id, &uploaded, &attachment.content_type)
                {
                    warn!(file = %attachment.canonical_filename, "content type not set: {error:#}");
                    record.detail = Some(format!("content type not set: {error:#}"));
                }
                record.outcome = UploadOutcome::Ok;
                record.target_attachment_id = Some(uploaded.id);
                ledger.record_upload(&record)?;
                on_page
                    .entry((record.target_page_id.clone(), attachment.source_id.clone()))
                    .or_insert_with(|| record.clone());
                done.insert(key);
                report.uploaded += 1;
                info!(file = %attachment.canonical_filename, page = target_page_id, "uploaded attachment");
                push_item(&mut report, &record, "uploaded");
            }
            Err(error) => {
                warn!(file = %attachment.canonical_filename, page = target_page_id, "upload failed: {error:#}");
                finish_failed(ledger, &mut report, record, format!("{error:#}"), false)?;
            }
        }
    }

    report.request_count = target.request_count();
    Ok(report)
}

fn finish_failed(
    ledger: &Ledger,
    report: &mut UploadReport,
    mut record: UploadRecord,
    detail: String,
    dry_run: bool,
) -> Result<()> {
    warn!(page = %record.source_page_id, link = %record.source_link_value, "{detail}");
    record.outcome = UploadOutcome::Failed;
    record.detail = Some(detail.clone());
    report.failed += 1;
    report
        .errors
        .push(format!("{} {}: {detail}", record.source_page_id, record.source_link_value));
    if !dry_run {
        ledger.record_upload(&record)?;
    }
    push_item(report, &record, "failed");
    Ok(())
}

fn push_item(report: &mut UploadReport, record: &UploadRecord, action: &str) {
    report.items.push(UploadItem {
        page_id: record.source_page_id.clone(),
        link: record.source_link_value.clone(),
        filename: record.filename.clone(),
        action: action.to_string(),
        detail: record.detail.clone(),
    });
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::model::PageMapping;
    use crate::source::testing::MockSource;
    use crate::target::testing::MockTarget;

    const IMAGE_LINK: &str = "https://app.example.com/spaces/S1/documents/DOC1";

    fn link(page_id: &str, ordinal: u32, kind: LinkKind, raw_value: &str) -> Link {
        Link {
            page_id: page_id.to_string(),
            ordinal,
            kind,
            raw_value: raw_value.to_string(),
            display_text: String::new(),
        }
    }

    fn ledger_with_links(dir: &Path, links: Vec<Link>) -> Ledger {
        let mut ledger = Ledger::open_at(&dir.join("migration.db")).expect("open");
        let mut by_page: BTreeMap<String, Vec<Link>> = BTreeMap::new();
        for link in links {
            by_page.entry(link.page_id.clone()).or_default().push(link);
        }
        ledger
            .replace_links(&by_page.into_iter().collect::<Vec<_>>())
            .expect("links");
        ledger
    }

    fn map_page(ledger: &Ledger, source: &str, target: &str) {
        ledger
            .insert_mapping(&PageMapping {
                source_page_id: source.to_string(),
                target_page_id: target.to_string(),
                target_title: format!("Page {source}"),
                offset_path: "0".to_string(),
            })
            .expect("mapping");
    }

    #[test]
    fn same_attachment_on_two_pages_downloads_once() {
        let temp = tempdir().expect("tempdir");
        let ledger = ledger_with_links(
            temp.path(),
            vec![
                link("A", 1, LinkKind::Image, IMAGE_LINK),
                link("B", 1, LinkKind::Image, IMAGE_LINK),
            ],
        );
        let mut source = MockSource::default().with_document("DOC1", "diagram.png", "image/png");
        let dir = temp.path().join("attachments");

        let report = download_attachments(&ledger, "S1", &dir, &mut source).expect("download");
        assert_eq!(report.links_considered, 2);
        assert_eq!(report.unique_attachments, 1);
        assert_eq!(report.downloaded, 1);
        assert_eq!(source.downloads.len(), 1);
        assert_eq!(source.document_lookups, vec!["DOC1".to_string()]);
        assert!(dir.join("DOC1").exists());

        let stored = ledger.attachments().expect("attachments");
        assert_eq!(stored.len(), 1);
        assert!(stored[0].sha256.as_deref().is_some_and(|sum| sum.len() == 64));

        let again = download_attachments(&ledger, "S1", &dir, &mut source).expect("download");
        assert_eq!(again.already_present, 1);
        assert_eq!(source.downloads.len(), 1);
    }

    #[test]
    fn interrupted_download_is_fetched_again() {
        let temp = tempdir().expect("tempdir");
        let ledger = ledger_with_links(temp.path(), vec![link("A", 1, LinkKind::Image, IMAGE_LINK)]);
        let mut source = MockSource::default().with_document("DOC1", "diagram.png", "image/png");
        let dir = temp.path().join("attachments");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("DOC1.part"), b"byt").expect("leftover");

        let report = download_attachments(&ledger, "S1", &dir, &mut source).expect("download");
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.already_present, 0);
        assert_eq!(fs::read(dir.join("DOC1")).expect("read"), b"bytes of DOC1".to_vec());
        assert!(!dir.join("DOC1.part").exists());
    }

    #[test]
    fn failed_lookup_is_cached_and_not_fatal() {
        let temp = tempdir().expect("tempdir");
        let ledger = Ledger::open_at(&temp.path().join("migration.db")).expect("open");
        let mut source = MockSource::default();
        source.failing_documents.insert("BAD".to_string());
        let mut resolver = AttachmentResolver::new("S1", temp.path(), Vec::new());

        let first = resolver
            .resolve(&mut source, &ledger, "https://x/spaces/S1/documents/BAD/download/BAD")
            .expect("resolve");
        let second = resolver
            .resolve(&mut source, &ledger, "https://x/spaces/S1/documents/BAD")
            .expect("resolve");
        assert!(first.is_none());
        assert!(second.is_none());
        assert_eq!(source.document_lookups.len(), 1);
    }

    #[test]
    fn clashing_filenames_get_id_prefix() {
        let temp = tempdir().expect("tempdir");
        let ledger = Ledger::open_at(&temp.path().join("migration.db")).expect("open");
        let mut source = MockSource::default()
            .with_document("DOC1", "image.png", "image/png")
            .with_document("DOC2", "image.png", "image/png");
        let mut resolver = AttachmentResolver::new("S1", temp.path(), Vec::new());

        let first = resolver
            .resolve(&mut source, &ledger, "https://x/spaces/S1/documents/DOC1")
            .expect("resolve")
            .expect("found");
        let second = resolver
            .resolve(&mut source, &ledger, "https://x/spaces/S1/documents/DOC2")
            .expect("resolve")
            .expect("found");
        assert_eq!(first.canonical_filename, "image.png");
        assert_eq!(second.canonical_filename, "DOC2-image.png");
    }

    #[test]
    fn upload_records_outcomes_and_skips_completed_links() {
        let temp = tempdir().expect("tempdir");
        let ledger = ledger_with_links(
            temp.path(),
            vec![
                link("A", 1, LinkKind::Image, IMAGE_LINK),
                link("C", 1, LinkKind::Image, IMAGE_LINK),
            ],
        );
        map_page(&ledger, "A", "101");
        let dir = temp.path().join("attachments");
        let mut source = MockSource::default().with_document("DOC1", "diagram.png", "image/png");
        download_attachments(&ledger, "S1", &dir, &mut source).expect("download");

        let mut target = MockTarget::default();
        let report = upload_assets_with_api(&ledger, &dir, AssetKind::Image, false, &mut target)
            .expect("upload");
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(target.uploads, vec![("101".to_string(), "diagram.png".to_string())]);
        assert_eq!(
            target.content_type_updates,
            vec![("att1".to_string(), "image/png".to_string())]
        );
        assert!(report.errors[0].contains("cannot find target page for source page 'C'"));

        let records = ledger.uploads().expect("uploads");
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.source_page_id == "A" && r.is_ok()));
        assert!(records.iter().any(|r| r.source_page_id == "C" && !r.is_ok()));

        let rerun = upload_assets_with_api(&ledger, &dir, AssetKind::Image, false, &mut target)
            .expect("rerun");
        assert_eq!(rerun.already_uploaded, 1);
        assert_eq!(target.uploads.len(), 1);
    }

    #[test]
    fn failed_upload_is_recorded_and_batch_continues() {
        let temp = tempdir().expect("tempdir");
        let ledger = ledger_with_links(
            temp.path(),
            vec![
                link("A", 1, LinkKind::Image, IMAGE_LINK),
                link("A", 2, LinkKind::Image, "https://x/spaces/S1/documents/DOC2"),
            ],
        );
        map_page(&ledger, "A", "101");
        let dir = temp.path().join("attachments");
        let mut source = MockSource::default()
            .with_document("DOC1", "huge.png", "image/png")
            .with_document("DOC2", "small.png", "image/png");
        download_attachments(&ledger, "S1", &dir, &mut source).expect("download");

        let mut target = MockTarget::default();
        target.failing_uploads.insert("huge.png".to_string());
        let report = upload_assets_with_api(&ledger, &dir, AssetKind::Image, false, &mut target)
            .expect("upload");
        assert_eq!(report.failed, 1);
        assert_eq!(report.uploaded, 1);
        let failed = ledger
            .uploads()
            .expect("uploads")
            .into_iter()
            .find(|record| !record.is_ok())
            .expect("failed record");
        assert!(failed.detail.as_deref().unwrap_or_default().contains("HTTP 413"));
    }

    #[test]
    fn dry_run_upload_writes_nothing() {
        let temp = tempdir().expect("tempdir");
        let ledger = ledger_with_links(temp.path(), vec![link("A", 1, LinkKind::Image, IMAGE_LINK)]);
        map_page(&ledger, "A", "101");
        let dir = temp.path().join("attachments");
        let mut source = MockSource::default().with_document("DOC1", "diagram.png", "image/png");
        download_attachments(&ledger, "S1", &dir, &mut source).expect("download");

        let mut target = MockTarget::default();
        let report = upload_assets_with_api(&ledger, &dir, AssetKind::Image, true, &mut target)
            .expect("upload");
        assert_eq!(report.items[0].action, "would_upload");
        assert!(target.uploads.is_empty());
        assert!(ledger.uploads().expect("uploads").is_empty());
    }

    #[test]
    fn document_links_include_anchors_and_markdown_urls() {
        let links = vec![
            link("A", 1, LinkKind::Anchor, "https://x/spaces/S1/documents/D1/download/D1"),
            link("A", 2, LinkKind::Anchor, "https://x/spaces/S1/tickets/12"),
            link("A", 3, LinkKind::MdUrl, "https://x/spaces/S1/documents/D2"),
            link("A", 4, LinkKind::Image, IMAGE_LINK),
        ];
        let ordinals = asset_links(&links, AssetKind::Document)
            .into_iter()
            .map(|link| link.ordinal)
            .collect::<Vec<_>>();
        assert_eq!(ordinals, vec![1, 3]);
    }
}
