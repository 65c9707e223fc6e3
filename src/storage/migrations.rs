//! Applies `schema::MIGRATIONS` to a database.
//!
//! All pending migrations run in one transaction holding an advisory lock,
//! so several processes starting against a fresh database apply each
//! migration exactly once. Applied names are kept in `_migrations`.

use std::collections::HashSet;

use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::{debug, info};

use super::schema::{tables, Migration, MIGRATIONS};

/// Advisory lock key held while migrating ("leasehold" in ASCII, truncated).
const MIGRATION_LOCK_KEY: i64 = 0x6c65_6173_6568_6f6c;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {name} failed: {source}")]
    MigrationFailed {
        name: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Brings the task schema up to date.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every migration not yet recorded. Returns how many ran.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        create_bookkeeping_table(&mut tx).await?;
        let applied: HashSet<String> =
            sqlx::query_scalar::<_, String>(&format!("SELECT name FROM {}", tables::MIGRATIONS))
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();

        let pending = pending_migrations(MIGRATIONS, &applied);
        for migration in &pending {
            apply(&mut tx, migration).await?;
        }
        tx.commit().await?;

        info!(
            applied = pending.len(),
            total = MIGRATIONS.len(),
            "Schema up to date"
        );
        Ok(pending.len())
    }

    /// Applied migrations, oldest first.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        let mut conn = self.pool.acquire().await?;
        create_bookkeeping_table(&mut conn).await?;

        let migrations = sqlx::query_as(&format!(
            "SELECT name, applied_at FROM {} ORDER BY applied_at, name",
            tables::MIGRATIONS
        ))
        .fetch_all(&mut *conn)
        .await?;
        Ok(migrations)
    }

    /// Drops the task and bookkeeping tables. Destroys every task.
    pub async fn reset_database(&self) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;
        for table in [tables::TASKS, tables::MIGRATIONS] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn create_bookkeeping_table(conn: &mut PgConnection) -> Result<(), MigrationError> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        tables::MIGRATIONS
    ))
    .execute(conn)
    .await?;
    Ok(())
}

async fn apply(conn: &mut PgConnection, migration: &Migration) -> Result<(), MigrationError> {
    for statement in migration.statements {
        sqlx::query(statement)
            .execute(&mut *conn)
            .await
            .map_err(|source| MigrationError::MigrationFailed {
                name: migration.name.to_string(),
                source,
            })?;
    }
    sqlx::query(&format!("INSERT INTO {} (name) VALUES ($1)", tables::MIGRATIONS))
        .bind(migration.name)
        .execute(conn)
        .await?;

    debug!(migration = migration.name, "Applied migration");
    Ok(())
}

/// Migrations from `all` missing from `applied`, in order.
fn pending_migrations(all: &[Migration], applied: &HashSet<String>) -> Vec<Migration> {
    all.iter()
        .filter(|migration| !applied.contains(migration.name))
        .copied()
        .collect()
}

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIRST: Migration = Migration {
        name: "0001_first",
        statements: &["SELECT 1"],
    };
    const SECOND: Migration = Migration {
        name: "0002_second",
        statements: &["SELECT 2"],
    };

    #[test]
    fn test_pending_skips_applied_and_keeps_order() {
        let all = [FIRST, SECOND];

        let none = HashSet::new();
        let names: Vec<&str> = pending_migrations(&all, &none)
            .iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["0001_first", "0002_second"]);

        let applied: HashSet<String> = ["0001_first".to_string()].into();
        let names: Vec<&str> = pending_migrations(&all, &applied)
            .iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["0002_second"]);

        let everything: HashSet<String> =
            all.iter().map(|m| m.name.to_string()).collect();
        assert!(pending_migrations(&all, &everything).is_empty());
    }

    #[test]
    fn test_migration_failed_names_the_migration() {
        let err = MigrationError::MigrationFailed {
            name: "0001_create_tasks".to_string(),
            source: sqlx::Error::RowNotFound,
        };
        assert!(err.to_string().contains("0001_create_tasks"));
    }
}
