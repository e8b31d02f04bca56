use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::ledger::Ledger;
use crate::links::{md_url_pattern, wiki_ref_pattern};
use crate::target::TargetApi;

static CODE: OnceLock<Regex> = OnceLock::new();
static HEADING: OnceLock<Regex> = OnceLock::new();
static TICKET_REF: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    MarkdownLink,
    WikiRef,
    Code,
    Heading,
    TicketRef,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarkdownLink => "markdown_link",
            Self::WikiRef => "wiki_ref",
            Self::Code => "code",
            Self::Heading => "heading",
            Self::TicketRef => "ticket_ref",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub text: String,
    /// For ticket references: the mapped issue key, or `unknown`.
    pub issue_key: Option<String>,
}

/// Leftover source markup in one published page body.
pub fn scan_content(content: &str, ticket_keys: &HashMap<u64, String>) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut push = |kind, text: &str, issue_key| {
        findings.push(Finding {
            kind,
            text: text.to_string(),
            issue_key,
        });
    };

    for found in md_url_pattern().find_iter(content) {
        push(FindingKind::MarkdownLink, found.as_str(), None);
    }
    for found in wiki_ref_pattern().find_iter(content) {
        push(FindingKind::WikiRef, found.as_str(), None);
    }
    let code = CODE.get_or_init(|| Regex::new(r"(?s)<code>.*?</code>").unwrap());
    for found in code.find_iter(content) {
        push(FindingKind::Code, found.as_str(), None);
    }
    let heading = HEADING.get_or_init(|| Regex::new(r"^#+ ").unwrap());
    for line in content.lines().filter(|line| heading.is_match(line)) {
        push(FindingKind::Heading, line.trim_end(), None);
    }
    let ticket = TICKET_REF.get_or_init(|| Regex::new(r"(?:^|[^&\w])#(\d+)\b").unwrap());
    for caps in ticket.captures_iter(content) {
        let number = &caps[1];
        let key = number
            .parse::<u64>()
            .ok()
            .and_then(|number| ticket_keys.get(&number).cloned())
            .unwrap_or_else(|| "unknown".to_string());
        push(FindingKind::TicketRef, &format!("#{number}"), Some(key));
    }
    findings
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub target_page_id: String,
    pub title: String,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub pages_checked: usize,
    pub pages_with_findings: usize,
    pub counts: HashMap<String, usize>,
    pub unknown_tickets: usize,
    pub errors: Vec<String>,
    pub pages: Vec<AuditPage>,
    pub request_count: usize,
}

/// Read every published page and list what the rewrite passes left behind. Never writes.
pub fn audit_with_api<T: TargetApi>(ledger: &Ledger, target: &mut T) -> Result<AuditReport> {
    let ticket_keys = ledger
        .ticket_keys()?
        .into_iter()
        .map(|key| (key.ticket_number, key.issue_key))
        .collect::<HashMap<_, _>>();
    let mappings = ledger.mappings()?;

    let mut report = AuditReport {
        pages_checked: 0,
        pages_with_findings: 0,
        counts: HashMap::new(),
        unknown_tickets: 0,
        errors: Vec::new(),
        pages: Vec::new(),
        request_count: 0,
    };

    for mapping in mappings {
        let page = match target.get_page(&mapping.target_page_id) {
            Ok(page) => page,
            Err(error) => {
                warn!(page = %mapping.target_page_id, "cannot read page content: {error:#}");
                report
                    .errors
                    .push(format!("{}: {error:#}", mapping.target_page_id));
                continue;
            }
        };
        report.pages_checked += 1;
        let findings = scan_content(&page.body, &ticket_keys);
        if findings.is_empty() {
            continue;
        }
        report.pages_with_findings += 1;
        for finding in &findings {
            *report
                .counts
                .entry(finding.kind.as_str().to_string())
                .or_default() += 1;
            if finding.issue_key.as_deref() == Some("unknown") {
                report.unknown_tickets += 1;
            }
        }
        report.pages.push(AuditPage {
            target_page_id: mapping.target_page_id,
            title: mapping.target_title,
            findings,
        });
    }

    report.request_count = target.request_count();
    Ok(report)
}
