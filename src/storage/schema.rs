//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS network_metrics (
            id INTEGER PRIMARY KEY,
            type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_network_metrics_type_created
            ON network_metrics(type, created_at);
        CREATE INDEX IF NOT EXISTS idx_network_metrics_created
            ON network_metrics(created_at);",
    )?;

    Ok(())
}
