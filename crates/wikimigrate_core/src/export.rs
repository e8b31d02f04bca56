use anyhow::{Result, bail};
use serde::Serialize;
use tracing::info;

use crate::ledger::{
    Ledger, STATE_EXPORTED_AT, STATE_SOURCE_SPACE_ID, STATE_SOURCE_SPACE_NAME, unix_timestamp,
};
use crate::model::SourceSpace;
use crate::source::SourceApi;

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub space_id: String,
    pub space_name: String,
    pub spaces: usize,
    pub pages: usize,
    pub users: usize,
    pub tickets: usize,
    pub request_count: usize,
}

/// Find a space by name (case-insensitive), wiki name, or id.
pub fn find_space<'a>(spaces: &'a [SourceSpace], wanted: &str) -> Option<&'a SourceSpace> {
    let wanted = wanted.trim();
    spaces
        .iter()
        .find(|space| space.name.eq_ignore_ascii_case(wanted))
        .or_else(|| spaces.iter().find(|space| space.wiki_name == wanted))
        .or_else(|| spaces.iter().find(|space| space.id == wanted))
}

/// Pull spaces, wiki pages, users and tickets of `space` into the ledger, replacing
/// earlier exports. An unknown space aborts before anything is written.
pub fn export_space<A: SourceApi>(
    ledger: &mut Ledger,
    space: &str,
    ticket_report: u32,
    api: &mut A,
) -> Result<ExportReport> {
    let spaces = api.get_spaces()?;
    let Some(selected) = find_space(&spaces, space).cloned() else {
        let mut known = spaces.iter().map(|space| space.name.as_str()).collect::<Vec<_>>();
        known.sort_unstable();
        bail!(
            "source space '{space}' not found (known spaces: {})",
            if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            }
        );
    };
    info!(id = %selected.id, name = %selected.name, "exporting source space");

    let pages = api.get_wiki_pages(&selected.id)?;
    let users = api.get_users(&selected.id)?;
    let tickets = api.get_tickets(&selected.id, ticket_report)?;

    ledger.replace_spaces(&spaces)?;
    ledger.replace_source_pages(&pages)?;
    ledger.replace_users(&users)?;
    ledger.replace_tickets(&tickets)?;
    ledger.set_state(STATE_SOURCE_SPACE_ID, &selected.id)?;
    ledger.set_state(STATE_SOURCE_SPACE_NAME, &selected.name)?;
    ledger.set_state(STATE_EXPORTED_AT, &unix_timestamp()?.to_string())?;

    Ok(ExportReport {
        space_id: selected.id,
        space_name: selected.name,
        spaces: spaces.len(),
        pages: pages.len(),
        users: users.len(),
        tickets: tickets.len(),
        request_count: api.request_count(),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::ledger::tests::sample_page;
    use crate::model::{SourceTicket, SourceUser};
    use crate::source::testing::MockSource;

    fn source() -> MockSource {
        MockSource {
            spaces: vec![
                SourceSpace {
                    id: "S1".to_string(),
                    name: "Team Space".to_string(),
                    wiki_name: "team-space".to_string(),
                },
                SourceSpace {
                    id: "S2".to_string(),
                    name: "Archive".to_string(),
                    wiki_name: "archive".to_string(),
                },
            ],
            pages: vec![sample_page("A", None, "Home", "<p>hi</p>")],
            users: vec![SourceUser {
                id: "U1".to_string(),
                login: "jdoe".to_string(),
                name: "Jane Doe".to_string(),
            }],
            tickets: vec![SourceTicket {
                id: "T1".to_string(),
                number: 1,
                summary: "Crash".to_string(),
            }],
            ..MockSource::default()
        }
    }

    #[test]
    fn export_stores_everything_for_the_selected_space() {
        let temp = tempdir().expect("tempdir");
        let mut ledger = Ledger::open_at(&temp.path().join("migration.db")).expect("open");
        let mut api = source();

        let report = export_space(&mut ledger, "team space", 0, &mut api).expect("export");
        assert_eq!(report.space_id, "S1");
        assert_eq!(report.pages, 1);
        assert_eq!(
            ledger.state(STATE_SOURCE_SPACE_ID).expect("state").as_deref(),
            Some("S1")
        );
        let counts = ledger.counts().expect("counts");
        assert_eq!(counts.spaces, 2);
        assert_eq!(counts.users, 1);
        assert_eq!(counts.tickets, 1);
        assert_eq!(counts.normalized_pages, 0);
    }

    #[test]
    fn unknown_space_lists_known_names_and_writes_nothing() {
        let temp = tempdir().expect("tempdir");
        let mut ledger = Ledger::open_at(&temp.path().join("migration.db")).expect("open");
        let mut api = source();

        let error = export_space(&mut ledger, "Missing", 0, &mut api).expect_err("must fail");
        assert_eq!(
            error.to_string(),
            "source space 'Missing' not found (known spaces: Archive, Team Space)"
        );
        assert_eq!(ledger.counts().expect("counts").spaces, 0);
    }

    #[test]
    fn spaces_match_by_wiki_name_or_id() {
        let api = source();
        assert_eq!(find_space(&api.spaces, "archive").map(|s| s.id.as_str()), Some("S2"));
        assert_eq!(find_space(&api.spaces, "S1").map(|s| s.id.as_str()), Some("S1"));
        assert!(find_space(&api.spaces, "S3").is_none());
    }
}
