//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                sender TEXT NOT NULL,
                sender_domain TEXT NOT NULL DEFAULT '',
                recipient TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                body_preview TEXT NOT NULL DEFAULT '',
                received_at TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                fetched_at TEXT NOT NULL,
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender);
            CREATE INDEX IF NOT EXISTS idx_messages_domain ON messages(sender_domain);
            CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at);

            CREATE TABLE IF NOT EXISTS verdicts (
                message_id TEXT PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
                recommendation TEXT NOT NULL,
                confidence REAL NOT NULL,
                stated_confidence REAL,
                category TEXT NOT NULL,
                priority TEXT NOT NULL,
                reasoning TEXT NOT NULL,
                source_tier TEXT NOT NULL,
                model_name TEXT NOT NULL,
                rule_name TEXT,
                analyzed_at TEXT NOT NULL,
                review_status TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_verdicts_category ON verdicts(category);
            CREATE INDEX IF NOT EXISTS idx_verdicts_review ON verdicts(review_status);
            CREATE INDEX IF NOT EXISTS idx_verdicts_tier ON verdicts(source_tier);

            CREATE TABLE IF NOT EXISTS decisions (
                message_id TEXT PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
                agreed_with_verdict INTEGER NOT NULL,
                action_taken TEXT NOT NULL,
                notes TEXT,
                decided_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_decided ON decisions(decided_at);
        "#,
    },
    Migration {
        version: 2,
        name: "learned_rules",
        sql: r#"
            CREATE TABLE IF NOT EXISTS learned_rules (
                id TEXT PRIMARY KEY,
                pattern_type TEXT NOT NULL,
                pattern_value TEXT NOT NULL,
                action TEXT NOT NULL,
                consistency_rate REAL NOT NULL,
                support INTEGER NOT NULL,
                times_matched INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 0,
                requires_review INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                UNIQUE (pattern_type, pattern_value)
            );
            CREATE INDEX IF NOT EXISTS idx_learned_rules_active ON learned_rules(is_active);
        "#,
    },
];

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &["messages", "verdicts", "decisions", "learned_rules", "_migrations"] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_run_on_a_spawned_task() {
        let conn = test_conn().await;
        let version = tokio::spawn(async move {
            run_migrations(&conn).await?;
            get_current_version(&conn).await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(version, MIGRATIONS.last().map(|m| m.version).unwrap_or(0));
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        assert_eq!(get_current_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rule_uniqueness_enforced() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let insert = "INSERT INTO learned_rules (id, pattern_type, pattern_value, action, consistency_rate, support, created_at)
                      VALUES (?1, 'vip_sender', 'a@b.com', 'keep', 1.0, 10, datetime('now'))";
        conn.execute(insert, libsql::params!["r1"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["r2"]).await.is_err());
    }
}
