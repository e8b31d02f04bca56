use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ledger::Ledger;
use crate::model::TicketKey;

/// One row of a ticket key export: source ticket number to target issue key.
#[derive(Debug, Clone, Deserialize)]
struct TicketKeyRow {
    ticket_number: u64,
    issue_key: String,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketImportReport {
    pub rows: usize,
    pub imported: usize,
    pub ignored: usize,
    pub duplicates: Vec<String>,
}

/// Parse a JSON array of `{ticket_number, issue_key, result?}` rows. Rows with a
/// `result` other than `OK` are ignored. When a number repeats, the first row wins.
pub fn parse_ticket_keys(content: &str) -> Result<(Vec<TicketKey>, TicketImportReport)> {
    let mut rows: Vec<TicketKeyRow> =
        serde_json::from_str(content).context("failed to parse ticket key file")?;
    let total = rows.len();
    rows.retain(|row| {
        row.result
            .as_deref()
            .is_none_or(|result| result.eq_ignore_ascii_case("ok"))
            && !row.issue_key.trim().is_empty()
    });
    let ignored = total - rows.len();
    rows.sort_by_key(|row| row.ticket_number);

    let mut keys: Vec<TicketKey> = Vec::with_capacity(rows.len());
    let mut duplicates = Vec::new();
    for row in rows {
        if let Some(first) = keys.last().filter(|key| key.ticket_number == row.ticket_number) {
            duplicates.push(format!(
                "#{} -> {} (kept {})",
                row.ticket_number, row.issue_key, first.issue_key
            ));
            continue;
        }
        keys.push(TicketKey {
            ticket_number: row.ticket_number,
            issue_key: row.issue_key.trim().to_string(),
        });
    }

    let report = TicketImportReport {
        rows: total,
        imported: keys.len(),
        ignored,
        duplicates,
    };
    Ok((keys, report))
}

pub fn import_ticket_keys(ledger: &mut Ledger, path: &Path) -> Result<TicketImportReport> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (keys, report) = parse_ticket_keys(&content)?;
    for duplicate in &report.duplicates {
        tracing::warn!("duplicate ticket key ignored: {duplicate}");
    }
    ledger.replace_ticket_keys(&keys)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn failed_rows_are_ignored_and_first_duplicate_wins() {
        let (keys, report) = parse_ticket_keys(
            r#"[
                {"ticket_number": 7, "issue_key": "PRJ-2", "result": "OK"},
                {"ticket_number": 3, "issue_key": "PRJ-1"},
                {"ticket_number": 7, "issue_key": "PRJ-9", "result": "OK"},
                {"ticket_number": 8, "issue_key": "PRJ-3", "result": "NOK"}
            ]"#,
        )
        .expect("parse");
        assert_eq!(
            keys,
            vec![
                TicketKey {
                    ticket_number: 3,
                    issue_key: "PRJ-1".to_string()
                },
                TicketKey {
                    ticket_number: 7,
                    issue_key: "PRJ-2".to_string()
                },
            ]
        );
        assert_eq!(report.rows, 4);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.duplicates, vec!["#7 -> PRJ-9 (kept PRJ-2)".to_string()]);
    }

    #[test]
    fn import_replaces_stored_keys() {
        let temp = tempdir().expect("tempdir");
        let mut ledger = Ledger::open_at(&temp.path().join("migration.db")).expect("open");
        let file = temp.path().join("keys.json");
        fs::write(&file, r#"[{"ticket_number": 1, "issue_key": "PRJ-1"}]"#).expect("write");

        let report = import_ticket_keys(&mut ledger, &file).expect("import");
        assert_eq!(report.imported, 1);
        assert_eq!(ledger.ticket_keys().expect("keys")[0].issue_key, "PRJ-1");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let error = parse_ticket_keys("{not json").expect_err("must fail");
        assert!(error.to_string().contains("failed to parse ticket key file"));
    }
}
