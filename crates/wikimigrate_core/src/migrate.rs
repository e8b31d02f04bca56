use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Ledger schema steps; step `n` (1-based) moves `user_version` from `n - 1` to `n`.
const STEPS: [(&str, &str); 3] = [
    ("source_export", include_str!("migrations/v001_source_export.sql")),
    ("link_ledger", include_str!("migrations/v002_link_ledger.sql")),
    ("publish_state", include_str!("migrations/v003_publish_state.sql")),
];

/// Bring the ledger schema on `connection` up to date.
/// Returns the versions applied by this call, oldest first.
pub fn run_migrations(connection: &Connection) -> Result<Vec<u32>> {
    let mut applied = Vec::new();
    for version in schema_version(connection)? + 1..=latest_version() {
        let (name, sql) = step(version);
        // A failed step rolls back with the dropped transaction and leaves user_version alone.
        let tx = connection
            .unchecked_transaction()
            .context("failed to begin ledger migration")?;
        tx.execute_batch(sql)
            .and_then(|()| tx.pragma_update(None, "user_version", version))
            .and_then(|()| tx.commit())
            .with_context(|| format!("failed to apply ledger migration v{version:03}_{name}"))?;
        tracing::debug!(version, name, "applied ledger migration");
        applied.push(version);
    }
    Ok(applied)
}

/// Number of schema steps a ledger at `db_path` still needs; a missing file needs all.
pub fn pending_migration_count(db_path: &Path) -> Result<usize> {
    if !db_path.exists() {
        return Ok(STEPS.len());
    }
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let current = schema_version(&connection)?;
    Ok(latest_version().saturating_sub(current) as usize)
}

pub fn latest_version() -> u32 {
    STEPS.len() as u32
}

fn schema_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read ledger schema version")?;
    u32::try_from(version).context("ledger schema version is negative")
}

fn step(version: u32) -> (&'static str, &'static str) {
    STEPS[version as usize - 1]
}
