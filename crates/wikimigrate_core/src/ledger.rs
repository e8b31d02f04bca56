use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::migrate::run_migrations;
use crate::model::{
    AssetKind, Attachment, Link, LinkKind, Page, PageFormat, PageMapping, PublishFailure,
    SourceSpace, SourceTicket, SourceUser, TicketKey, UploadOutcome, UploadRecord,
    format_timestamp, parse_timestamp,
};
use crate::runtime::ResolvedPaths;

pub const STATE_SOURCE_SPACE_ID: &str = "source_space_id";
pub const STATE_SOURCE_SPACE_NAME: &str = "source_space_name";
pub const STATE_EXPORTED_AT: &str = "exported_at_unix";

/// A source page as exported, with its normalized body once `prepare` has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub ingest_order: i64,
    /// `body` holds the raw exported markup.
    pub page: Page,
    pub normalized_body: Option<String>,
    pub normalize_warning: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerCounts {
    pub spaces: usize,
    pub users: usize,
    pub pages: usize,
    pub normalized_pages: usize,
    pub tickets: usize,
    pub links: usize,
    pub attachments: usize,
    pub mappings: usize,
    pub publish_failures: usize,
    pub uploads_ok: usize,
    pub uploads_failed: usize,
    pub ticket_keys: usize,
}

/// Checkpoint store shared by every phase. Each write is committed immediately so an
/// interrupted run resumes from the last completed unit.
pub struct Ledger {
    connection: Connection,
}

impl Ledger {
    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        Self::open_at(&paths.db_path)
    }

    pub fn open_at(db_path: &Path) -> Result<Self> {
        let parent = db_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create database parent directory {}",
                parent.display()
            )
        })?;
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign_keys pragma")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        run_migrations(&connection)?;
        Ok(Self { connection })
    }

    pub fn state(&self, key: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT value FROM migration_state WHERE key = ?1 LIMIT 1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read migration state key {key}"))
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO migration_state (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .with_context(|| format!("failed to set migration state key {key}"))?;
        Ok(())
    }

    pub fn replace_spaces(&mut self, spaces: &[SourceSpace]) -> Result<()> {
        let tx = self.connection.transaction()?;
        tx.execute("DELETE FROM source_spaces", [])
            .context("failed to clear source spaces")?;
        for space in spaces {
            tx.execute(
                "INSERT OR REPLACE INTO source_spaces (id, name, wiki_name) VALUES (?1, ?2, ?3)",
                params![space.id, space.name, space.wiki_name],
            )
            .with_context(|| format!("failed to store space {}", space.id))?;
        }
        tx.commit().context("failed to commit source spaces")
    }

    pub fn spaces(&self) -> Result<Vec<SourceSpace>> {
        self.query_all(
            "SELECT id, name, wiki_name FROM source_spaces ORDER BY name",
            |row| {
                Ok(SourceSpace {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    wiki_name: row.get(2)?,
                })
            },
        )
    }

    pub fn replace_users(&mut self, users: &[SourceUser]) -> Result<()> {
        let tx = self.connection.transaction()?;
        tx.execute("DELETE FROM source_users", [])
            .context("failed to clear source users")?;
        for user in users {
            tx.execute(
                "INSERT OR REPLACE INTO source_users (id, login, name) VALUES (?1, ?2, ?3)",
                params![user.id, user.login, user.name],
            )
            .with_context(|| format!("failed to store user {}", user.id))?;
        }
        tx.commit().context("failed to commit source users")
    }

    pub fn users(&self) -> Result<Vec<SourceUser>> {
        self.query_all("SELECT id, login, name FROM source_users ORDER BY id", |row| {
            Ok(SourceUser {
                id: row.get(0)?,
                login: row.get(1)?,
                name: row.get(2)?,
            })
        })
    }

    pub fn replace_tickets(&mut self, tickets: &[SourceTicket]) -> Result<()> {
        let tx = self.connection.transaction()?;
        tx.execute("DELETE FROM source_tickets", [])
            .context("failed to clear source tickets")?;
        for ticket in tickets {
            tx.execute(
                "INSERT OR REPLACE INTO source_tickets (id, number, summary) VALUES (?1, ?2, ?3)",
                params![ticket.id, to_i64(ticket.number)?, ticket.summary],
            )
            .with_context(|| format!("failed to store ticket {}", ticket.id))?;
        }
        tx.commit().context("failed to commit source tickets")
    }

    pub fn tickets(&self) -> Result<Vec<SourceTicket>> {
        self.query_all(
            "SELECT id, number, summary FROM source_tickets ORDER BY number",
            |row| {
                Ok(SourceTicket {
                    id: row.get(0)?,
                    number: row.get::<_, i64>(1)?.max(0) as u64,
                    summary: row.get(2)?,
                })
            },
        )
    }

    /// Replace the exported pages. Normalized bodies and the link ledger are derived
    /// from them, so both are cleared as well.
    pub fn replace_source_pages(&mut self, pages: &[Page]) -> Result<()> {
        let tx = self.connection.transaction()?;
        tx.execute("DELETE FROM source_pages", [])
            .context("failed to clear source pages")?;
        tx.execute("DELETE FROM page_links", [])
            .context("failed to clear page links")?;
        for (position, page) in pages.iter().enumerate() {
            tx.execute(
                "INSERT INTO source_pages (
                    ingest_order, id, parent_id, title, raw_body, format, author_id, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    i64::try_from(position).context("page position does not fit into i64")?,
                    page.id,
                    page.parent_id,
                    page.title,
                    page.body,
                    page.format.as_str(),
                    page.author_id,
                    format_timestamp(&page.created_at),
                ],
            )
            .with_context(|| format!("failed to store page {}", page.id))?;
        }
        tx.commit().context("failed to commit source pages")
    }

    pub fn source_pages(&self) -> Result<Vec<StoredPage>> {
        self.query_all(
            "SELECT ingest_order, id, parent_id, title, raw_body, format, author_id, created_at,
                    normalized_body, normalize_warning
             FROM source_pages ORDER BY ingest_order",
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            },
        )?
        .into_iter()
        .map(
            |(
                ingest_order,
                id,
                parent_id,
                title,
                raw_body,
                format,
                author_id,
                created_at,
                normalized_body,
                normalize_warning,
            )| {
                let format = PageFormat::parse(&format)
                    .ok_or_else(|| anyhow::anyhow!("page {id} has unknown format '{format}'"))?;
                let created_at = parse_timestamp(&created_at).ok_or_else(|| {
                    anyhow::anyhow!("page {id} has invalid created_at '{created_at}'")
                })?;
                Ok(StoredPage {
                    ingest_order,
                    page: Page {
                        id,
                        parent_id,
                        title,
                        body: raw_body,
                        format,
                        created_at,
                        author_id,
                    },
                    normalized_body,
                    normalize_warning,
                })
            },
        )
        .collect()
    }

    pub fn store_normalized(
        &mut self,
        updates: &[(i64, String, Option<String>)],
    ) -> Result<()> {
        let tx = self.connection.transaction()?;
        for (ingest_order, body, warning) in updates {
            tx.execute(
                "UPDATE source_pages SET normalized_body = ?1, normalize_warning = ?2
                 WHERE ingest_order = ?3",
                params![body, warning, ingest_order],
            )
            .with_context(|| format!("failed to store normalized page #{ingest_order}"))?;
        }
        tx.commit().context("failed to commit normalized pages")
    }

    /// Pages with their normalized bodies. Fails when `prepare` has not run.
    pub fn pages(&self) -> Result<Vec<Page>> {
        self.source_pages()?
            .into_iter()
            .map(|stored| {
                let Some(body) = stored.normalized_body else {
                    bail!(
                        "page '{}' has not been normalized; run `wikimigrate prepare` first",
                        stored.page.id
                    );
                };
                Ok(Page {
                    body,
                    ..stored.page
                })
            })
            .collect()
    }

    /// Replace the full link set of each listed page.
    pub fn replace_links(&mut self, links_by_page: &[(String, Vec<Link>)]) -> Result<()> {
        let tx = self.connection.transaction()?;
        for (page_id, links) in links_by_page {
            tx.execute("DELETE FROM page_links WHERE page_id = ?1", [page_id])
                .with_context(|| format!("failed to clear links of page {page_id}"))?;
            for link in links {
                tx.execute(
                    "INSERT INTO page_links (page_id, ordinal, kind, raw_value, display_text)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        link.page_id,
                        i64::from(link.ordinal),
                        link.kind.as_str(),
                        link.raw_value,
                        link.display_text
                    ],
                )
                .with_context(|| {
                    format!("failed to store link {} of page {}", link.ordinal, link.page_id)
                })?;
            }
        }
        tx.commit().context("failed to commit page links")
    }

    pub fn links(&self) -> Result<Vec<Link>> {
        self.query_all(
            "SELECT page_id, ordinal, kind, raw_value, display_text
             FROM page_links ORDER BY page_id, ordinal",
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )?
        .into_iter()
        .map(|(page_id, ordinal, kind, raw_value, display_text)| {
            let kind = LinkKind::parse(&kind)
                .ok_or_else(|| anyhow::anyhow!("unknown link kind '{kind}' on page {page_id}"))?;
            Ok(Link {
                page_id,
                ordinal: u32::try_from(ordinal).context("link ordinal does not fit into u32")?,
                kind,
                raw_value,
                display_text,
            })
        })
        .collect()
    }

    pub fn upsert_attachment(&self, attachment: &Attachment) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO attachments (
                    source_id, canonical_filename, content_type, name, download_url, filesize,
                    sha256, updated_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(source_id) DO UPDATE SET
                    canonical_filename = excluded.canonical_filename,
                    content_type = excluded.content_type,
                    name = excluded.name,
                    download_url = excluded.download_url,
                    filesize = excluded.filesize,
                    sha256 = excluded.sha256,
                    updated_at_unix = excluded.updated_at_unix",
                params![
                    attachment.source_id,
                    attachment.canonical_filename,
                    attachment.content_type,
                    attachment.name,
                    attachment.download_url,
                    attachment.filesize,
                    attachment.sha256,
                    unix_timestamp()?
                ],
            )
            .with_context(|| format!("failed to upsert attachment {}", attachment.source_id))?;
        Ok(())
    }

    pub fn attachments(&self) -> Result<Vec<Attachment>> {
        self.query_all(
            "SELECT source_id, canonical_filename, content_type, name, download_url, filesize, sha256
             FROM attachments ORDER BY source_id",
            |row| {
                Ok(Attachment {
                    source_id: row.get(0)?,
                    canonical_filename: row.get(1)?,
                    content_type: row.get(2)?,
                    name: row.get(3)?,
                    download_url: row.get(4)?,
                    filesize: row.get(5)?,
                    sha256: row.get(6)?,
                })
            },
        )
    }

    /// Record a created page. A source page maps to at most one target page.
    pub fn insert_mapping(&self, mapping: &PageMapping) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO page_mappings (
                    source_page_id, target_page_id, target_title, offset_path, created_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    mapping.source_page_id,
                    mapping.target_page_id,
                    mapping.target_title,
                    mapping.offset_path,
                    unix_timestamp()?
                ],
            )
            .with_context(|| format!("failed to record mapping for {}", mapping.source_page_id))?;
        self.connection
            .execute(
                "DELETE FROM publish_failures WHERE source_page_id = ?1",
                [&mapping.source_page_id],
            )
            .context("failed to clear publish failure")?;
        Ok(())
    }

    pub fn mappings(&self) -> Result<Vec<PageMapping>> {
        self.query_all(
            "SELECT source_page_id, target_page_id, target_title, offset_path
             FROM page_mappings ORDER BY created_at_unix, rowid",
            |row| {
                Ok(PageMapping {
                    source_page_id: row.get(0)?,
                    target_page_id: row.get(1)?,
                    target_title: row.get(2)?,
                    offset_path: row.get(3)?,
                })
            },
        )
    }

    pub fn record_publish_failure(&self, failure: &PublishFailure) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO publish_failures (source_page_id, title, error, failed_at_unix)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source_page_id) DO UPDATE SET
                    title = excluded.title,
                    error = excluded.error,
                    failed_at_unix = excluded.failed_at_unix",
                params![
                    failure.source_page_id,
                    failure.title,
                    failure.error,
                    unix_timestamp()?
                ],
            )
            .with_context(|| {
                format!("failed to record publish failure for {}", failure.source_page_id)
            })?;
        Ok(())
    }

    pub fn publish_failures(&self) -> Result<Vec<PublishFailure>> {
        self.query_all(
            "SELECT source_page_id, title, error FROM publish_failures ORDER BY failed_at_unix",
            |row| {
                Ok(PublishFailure {
                    source_page_id: row.get(0)?,
                    title: row.get(1)?,
                    error: row.get(2)?,
                })
            },
        )
    }

    /// Persist one upload attempt. A later attempt for the same link on the same page
    /// replaces the earlier record.
    pub fn record_upload(&self, record: &UploadRecord) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO uploads (
                    asset, target_page_id, source_link_value, source_page_id,
                    source_attachment_id, target_attachment_id, filename, outcome, detail,
                    recorded_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(asset, source_page_id, source_link_value) DO UPDATE SET
                    target_page_id = excluded.target_page_id,
                    source_attachment_id = excluded.source_attachment_id,
                    target_attachment_id = excluded.target_attachment_id,
                    filename = excluded.filename,
                    outcome = excluded.outcome,
                    detail = excluded.detail,
                    recorded_at_unix = excluded.recorded_at_unix",
                params![
                    record.asset.as_str(),
                    record.target_page_id,
                    record.source_link_value,
                    record.source_page_id,
                    record.source_attachment_id,
                    record.target_attachment_id,
                    record.filename,
                    record.outcome.as_str(),
                    record.detail,
                    unix_timestamp()?
                ],
            )
            .with_context(|| {
                format!(
                    "failed to record {} upload for {}",
                    record.asset.as_str(),
                    record.source_link_value
                )
            })?;
        Ok(())
    }

    pub fn uploads(&self) -> Result<Vec<UploadRecord>> {
        self.query_all(
            "SELECT asset, source_page_id, target_page_id, source_link_value,
                    source_attachment_id, target_attachment_id, filename, outcome, detail
             FROM uploads ORDER BY recorded_at_unix, rowid",
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            },
        )?
        .into_iter()
        .map(
            |(
                asset,
                source_page_id,
                target_page_id,
                source_link_value,
                source_attachment_id,
                target_attachment_id,
                filename,
                outcome,
                detail,
            )| {
                Ok(UploadRecord {
                    asset: AssetKind::parse(&asset)
                        .ok_or_else(|| anyhow::anyhow!("unknown upload asset '{asset}'"))?,
                    source_page_id,
                    target_page_id,
                    source_link_value,
                    source_attachment_id,
                    target_attachment_id,
                    filename,
                    outcome: UploadOutcome::parse(&outcome)
                        .ok_or_else(|| anyhow::anyhow!("unknown upload outcome '{outcome}'"))?,
                    detail,
                })
            },
        )
        .collect()
    }

    pub fn replace_ticket_keys(&mut self, keys: &[TicketKey]) -> Result<()> {
        let tx = self.connection.transaction()?;
        tx.execute("DELETE FROM ticket_keys", [])
            .context("failed to clear ticket keys")?;
        for key in keys {
            tx.execute(
                "INSERT INTO ticket_keys (ticket_number, issue_key) VALUES (?1, ?2)",
                params![to_i64(key.ticket_number)?, key.issue_key],
            )
            .with_context(|| format!("failed to store key for ticket #{}", key.ticket_number))?;
        }
        tx.commit().context("failed to commit ticket keys")
    }

    pub fn ticket_keys(&self) -> Result<Vec<TicketKey>> {
        self.query_all(
            "SELECT ticket_number, issue_key FROM ticket_keys ORDER BY ticket_number",
            |row| {
                Ok(TicketKey {
                    ticket_number: row.get::<_, i64>(0)?.max(0) as u64,
                    issue_key: row.get(1)?,
                })
            },
        )
    }

    pub fn counts(&self) -> Result<LedgerCounts> {
        Ok(LedgerCounts {
            spaces: self.count("SELECT COUNT(*) FROM source_spaces")?,
            users: self.count("SELECT COUNT(*) FROM source_users")?,
            pages: self.count("SELECT COUNT(*) FROM source_pages")?,
            normalized_pages: self
                .count("SELECT COUNT(*) FROM source_pages WHERE normalized_body IS NOT NULL")?,
            tickets: self.count("SELECT COUNT(*) FROM source_tickets")?,
            links: self.count("SELECT COUNT(*) FROM page_links")?,
            attachments: self.count("SELECT COUNT(*) FROM attachments")?,
            mappings: self.count("SELECT COUNT(*) FROM page_mappings")?,
            publish_failures: self.count("SELECT COUNT(*) FROM publish_failures")?,
            uploads_ok: self.count("SELECT COUNT(*) FROM uploads WHERE outcome = 'ok'")?,
            uploads_failed: self.count("SELECT COUNT(*) FROM uploads WHERE outcome = 'failed'")?,
            ticket_keys: self.count("SELECT COUNT(*) FROM ticket_keys")?,
        })
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let value: i64 = self
            .connection
            .query_row(sql, [], |row| row.get(0))
            .with_context(|| format!("failed to run count query: {sql}"))?;
        usize::try_from(value).context("row count does not fit into usize")
    }

    fn query_all<T, F>(&self, sql: &str, map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut statement = self
            .connection
            .prepare(sql)
            .with_context(|| format!("failed to prepare query: {sql}"))?;
        let rows = statement
            .query_map([], map)
            .with_context(|| format!("failed to run query: {sql}"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode ledger row")?);
        }
        Ok(out)
    }
}

pub fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).context("value does not fit into i64")
}
