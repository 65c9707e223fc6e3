//! Database schema constants and the ordered list of migrations.
//!
//! Each constant holds exactly one SQL command; a `Migration` groups the
//! commands that ship together under one name.

/// SQL schema for creating the tasks table.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id BIGSERIAL PRIMARY KEY,
    task_type TEXT NOT NULL,
    state JSONB NOT NULL DEFAULT '{}'::jsonb,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'running', 'waiting', 'completed', 'failed')),
    worker_id TEXT,
    lease_expires_at TIMESTAMPTZ,
    error TEXT,
    parent_id BIGINT REFERENCES tasks(id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Serves the claim query's scan over pending and leased rows, oldest first.
pub const CREATE_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_created_at ON tasks(status, created_at)";

/// Serves child listing and the cancellation subtree walk.
pub const CREATE_PARENT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_parent_id ON tasks(parent_id)";

/// A named schema change, applied at most once per database.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Recorded in the bookkeeping table; never rename a shipped migration.
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

/// Every migration, oldest first. Append only.
pub const MIGRATIONS: &[Migration] = &[Migration {
    name: "0001_create_tasks",
    statements: &[CREATE_TASKS_TABLE, CREATE_STATUS_INDEX, CREATE_PARENT_INDEX],
}];

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    MIGRATIONS
        .iter()
        .flat_map(|migration| migration.statements.iter().copied())
        .collect()
}

/// Table names in the schema.
pub mod tables {
    pub const TASKS: &str = "tasks";
    /// Migration bookkeeping.
    pub const MIGRATIONS: &str = "_migrations";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 3);
        // The table must exist before its indexes
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS tasks"));
        assert!(statements[1..].iter().all(|s| s.contains("CREATE INDEX")));
    }

    #[test]
    fn test_statements_are_single_commands() {
        for statement in all_schema_statements() {
            assert!(!statement.trim().trim_end_matches(';').contains(';'));
        }
    }

    #[test]
    fn test_status_check_lists_every_status() {
        for status in ["pending", "running", "waiting", "completed", "failed"] {
            assert!(CREATE_TASKS_TABLE.contains(&format!("'{}'", status)));
        }
    }

    #[test]
    fn test_migration_names_are_unique_and_ordered() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
        assert!(MIGRATIONS.iter().all(|m| !m.statements.is_empty()));
    }

    #[test]
    fn test_table_constants() {
        assert_eq!(tables::TASKS, "tasks");
        assert_eq!(tables::MIGRATIONS, "_migrations");
    }
}
