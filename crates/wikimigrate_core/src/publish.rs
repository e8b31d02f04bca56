use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::ledger::Ledger;
use crate::mapping::IdMapper;
use crate::model::{Page, PageMapping, PublishFailure, SourceUser, display_timestamp};
use crate::target::{CreatePageRequest, TargetApi};
use crate::tree::PageForest;

/// Body used for pages that only exist to hold children.
pub const PAGE_TREE_MACRO: &str = concat!(
    r#"<p><ac:structured-macro ac:name="pagetree" ac:schema-version="1" "#,
    r#"ac:macro-id="caf6610e-f939-4ef9-b748-2121668fcf46">"#,
    r#"<ac:parameter ac:name="expandCollapseAll">true</ac:parameter>"#,
    r#"<ac:parameter ac:name="root"><ac:link><ri:page ri:content-title="@self" /></ac:link></ac:parameter>"#,
    r#"<ac:parameter ac:name="searchBox">true</ac:parameter>"#,
    r#"</ac:structured-macro></p>"#
);

const DRY_RUN_ID_PREFIX: &str = "dry-run-";

/// Inputs shared by every page of a publish run.
#[derive(Debug, Clone)]
pub struct PublishContext {
    pub wiki_url: String,
    authors: HashMap<String, String>,
}

impl PublishContext {
    pub fn new(wiki_url: &str, users: &[SourceUser]) -> Self {
        Self {
            wiki_url: wiki_url.trim_end_matches('/').to_string(),
            authors: users
                .iter()
                .map(|user| (user.id.clone(), user.name.clone()))
                .collect(),
        }
    }

    pub fn author_name(&self, author_id: Option<&str>) -> &str {
        author_id
            .and_then(|id| self.authors.get(id))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishPageResult {
    pub source_page_id: String,
    pub title: String,
    pub action: String,
    pub target_page_id: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub dry_run: bool,
    pub total: usize,
    pub created: usize,
    pub already_published: usize,
    pub reparented_to_root: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub pages: Vec<PublishPageResult>,
    pub request_count: usize,
}

pub fn target_title(title: &str) -> String {
    title.replace('_', " ")
}

pub fn provenance_banner(page: &Page, context: &PublishContext) -> String {
    format!(
        "<p>Created by {} at {}</p><p><a href=\"{}/{}\" target=\"_blank\">Assembla Wiki</a></p><hr/>",
        context.author_name(page.author_id.as_deref()),
        display_timestamp(&page.created_at),
        context.wiki_url,
        page.title
    )
}

/// Banner followed by the page body; an empty body with children becomes a page tree.
pub fn page_body(page: &Page, has_children: bool, context: &PublishContext) -> String {
    let body = if page.body.trim().is_empty() && has_children {
        PAGE_TREE_MACRO
    } else {
        page.body.as_str()
    };
    format!("{}{}", provenance_banner(page, context), body)
}

/// Create every page of `forest` in pre-order so a parent always exists before its
/// children. Mapped pages are skipped; each creation is checkpointed immediately.
pub fn publish_with_api<T: TargetApi>(
    ledger: &Ledger,
    forest: &PageForest,
    context: &PublishContext,
    dry_run: bool,
    target: &mut T,
) -> Result<PublishReport> {
    let mut mapper = IdMapper::load(ledger)?;
    let entries = forest.pre_order();
    let mut report = PublishReport {
        dry_run,
        total: entries.len(),
        created: 0,
        already_published: 0,
        reparented_to_root: 0,
        failed: 0,
        errors: Vec::new(),
        pages: Vec::new(),
        request_count: 0,
    };
    let mut placeholders = 0usize;

    for (index, entry) in entries.iter().enumerate() {
        let Some(page) = forest.page(&entry.page_id) else {
            continue;
        };
        let title = target_title(&page.title);
        if let Some(existing) = mapper.target_for(&page.id) {
            report.already_published += 1;
            report.pages.push(PublishPageResult {
                source_page_id: page.id.clone(),
                title,
                action: "exists".to_string(),
                target_page_id: Some(existing.to_string()),
                detail: None,
            });
            continue;
        }

        let mut detail = None;
        let parent_target = match page.parent_id.as_deref() {
            None => None,
            Some(parent_id) => match mapper.target_for(parent_id) {
                Some(parent_target) => Some(parent_target.to_string()),
                None => {
                    warn!(
                        id = %page.id,
                        title = %page.title,
                        parent_id,
                        "cannot find published parent; creating page at the root"
                    );
                    report.reparented_to_root += 1;
                    detail = Some(format!("parent '{parent_id}' not published; created at root"));
                    None
                }
            },
        };

        let body = page_body(page, forest.has_children(&page.id), context);
        let offset_path = entry.offset_path();

        if dry_run {
            placeholders += 1;
            let placeholder = format!("{DRY_RUN_ID_PREFIX}{placeholders}");
            mapper.insert(&page.id, &placeholder, &title);
            report.created += 1;
            report.pages.push(PublishPageResult {
                source_page_id: page.id.clone(),
                title,
                action: "would_create".to_string(),
                target_page_id: Some(placeholder),
                detail: detail.or_else(|| parent_target.map(|parent| format!("parent {parent}"))),
            });
            continue;
        }

        let request = CreatePageRequest {
            title: &title,
            body: &body,
            parent_id: parent_target.as_deref(),
            position: index + 1,
            total: entries.len(),
        };
        match target.create_page(&request) {
            Ok(created) => {
                ledger.insert_mapping(&PageMapping {
                    source_page_id: page.id.clone(),
                    target_page_id: created.id.clone(),
                    target_title: title.clone(),
                    offset_path,
                })?;
                mapper.insert(&page.id, &created.id, &title);
                info!(
                    position = index + 1,
                    total = entries.len(),
                    id = %created.id,
                    title = %title,
                    "created page"
                );
                report.created += 1;
                report.pages.push(PublishPageResult {
                    source_page_id: page.id.clone(),
                    title,
                    action: "created".to_string(),
                    target_page_id: Some(created.id),
                    detail,
                });
            }
            Err(error) => {
                let message = format!("{error:#}");
                warn!(id = %page.id, title = %title, "page creation failed: {message}");
                ledger.record_publish_failure(&PublishFailure {
                    source_page_id: page.id.clone(),
                    title: title.clone(),
                    error: message.clone(),
                })?;
                report.failed += 1;
                report.errors.push(format!("{title}: {message}"));
                report.pages.push(PublishPageResult {
                    source_page_id: page.id.clone(),
                    title,
                    action: "failed".to_string(),
                    target_page_id: None,
                    detail: Some(message),
                });
            }
        }
    }

    report.request_count = target.request_count();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::*;
    use crate::ledger::tests::sample_page;
    use crate::target::testing::MockTarget;

    fn context() -> PublishContext {
        PublishContext::new(
            "https://app.example.com/spaces/team/wiki/",
            &[SourceUser {
                id: "U1".to_string(),
                login: "jdoe".to_string(),
                name: "Jane Doe".to_string(),
            }],
        )
    }

    fn forest() -> PageForest {
        let mut child = sample_page("B", Some("A"), "Setup_Guide", "<p>steps</p>");
        child.created_at = Utc
            .with_ymd_and_hms(2019, 6, 1, 8, 0, 0)
            .single()
            .expect("timestamp");
        PageForest::build(vec![child, sample_page("A", None, "Home", "")]).expect("forest")
    }

    #[test]
    fn banner_and_page_tree_placeholder() {
        let forest = forest();
        let home = forest.page("A").expect("home");
        let body = page_body(home, true, &context());
        assert!(body.starts_with(
            "<p>Created by Jane Doe at 2019-05-01 08:30:00</p>\
             <p><a href=\"https://app.example.com/spaces/team/wiki/Home\" target=\"_blank\">Assembla Wiki</a></p><hr/>"
        ));
        assert!(body.ends_with(PAGE_TREE_MACRO));

        let leaf = sample_page("C", None, "Empty", "  ");
        assert!(!page_body(&leaf, false, &context()).contains("pagetree"));
    }

    #[test]
    fn parent_is_created_before_child_and_mapped() {
        let temp = tempdir().expect("tempdir");
        let ledger = Ledger::open_at(&temp.path().join("migration.db")).expect("open");
        let mut target = MockTarget::default();

        let report = publish_with_api(&ledger, &forest(), &context(), false, &mut target)
            .expect("publish");
        assert_eq!(report.created, 2);
        assert_eq!(target.created, vec!["Home".to_string(), "Setup Guide".to_string()]);

        let mapper = IdMapper::load(&ledger).expect("mapper");
        let home = mapper.target_for("A").expect("home mapped");
        let guide = mapper.target_for("B").expect("guide mapped");
        assert_eq!(target.parents.get(guide), Some(&Some(home.to_string())));
        assert_eq!(mapper.title_of(guide), Some("Setup Guide"));
    }

    #[test]
    fn rerun_skips_published_pages() {
        let temp = tempdir().expect("tempdir");
        let ledger = Ledger::open_at(&temp.path().join("migration.db")).expect("open");
        let mut target = MockTarget::default();
        publish_with_api(&ledger, &forest(), &context(), false, &mut target).expect("first");

        let again = publish_with_api(&ledger, &forest(), &context(), false, &mut target)
            .expect("second");
        assert_eq!(again.created, 0);
        assert_eq!(again.already_published, 2);
        assert_eq!(target.created.len(), 2);
    }

    #[test]
    fn failed_parent_sends_child_to_root_and_is_recorded() {
        let temp = tempdir().expect("tempdir");
        let ledger = Ledger::open_at(&temp.path().join("migration.db")).expect("open");
        let mut target = MockTarget::default();
        target.failing_titles.insert("Home".to_string());

        let report = publish_with_api(&ledger, &forest(), &context(), false, &mut target)
            .expect("publish");
        assert_eq!(report.failed, 1);
        assert_eq!(report.reparented_to_root, 1);
        let guide = IdMapper::load(&ledger)
            .expect("mapper")
            .target_for("B")
            .map(str::to_string)
            .expect("guide mapped");
        assert_eq!(target.parents.get(&guide), Some(&None));

        let failures = ledger.publish_failures().expect("failures");
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("error parsing xhtml"));
    }

    #[test]
    fn dry_run_plans_children_under_placeholders() {
        let temp = tempdir().expect("tempdir");
        let ledger = Ledger::open_at(&temp.path().join("migration.db")).expect("open");
        let mut target = MockTarget::default();

        let report = publish_with_api(&ledger, &forest(), &context(), true, &mut target)
            .expect("publish");
        assert!(target.created.is_empty());
        assert!(ledger.mappings().expect("mappings").is_empty());
        assert_eq!(report.pages[0].action, "would_create");
        assert_eq!(report.pages[0].target_page_id.as_deref(), Some("dry-run-1"));
        assert_eq!(report.pages[1].detail.as_deref(), Some("parent dry-run-1"));
        assert_eq!(report.reparented_to_root, 0);
    }
}
