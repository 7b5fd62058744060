use sqlx::Row;

use tx_protocol::TaskStatus;

use crate::migrations::latest_schema_version;

use super::StateRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    Error,
    Warning,
    Info,
}

impl ValidationSeverity {
    pub const fn as_str(self) -> &'static str {
        match self {
            ValidationSeverity::Error => "error",
            ValidationSeverity::Warning => "warning",
            ValidationSeverity::Info => "info",
        }
    }
}

/// One diagnostic check outcome.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub check: &'static str,
    pub severity: ValidationSeverity,
    pub detail: String,
    pub fixable: bool,
    pub rows_fixed: u64,
}

impl StateRuntime {
    /// Runs the ordered diagnostic checks. In fix mode the fixable findings
    /// are repaired and the repaired row counts reported.
    pub async fn validate_store(&self, fix: bool) -> anyhow::Result<Vec<ValidationIssue>> {
        let mut issues = Vec::new();

        // 1. Engine-level integrity.
        let integrity: String = sqlx::query("PRAGMA integrity_check")
            .fetch_one(self.pool())
            .await?
            .try_get(0)?;
        if integrity != "ok" {
            issues.push(ValidationIssue {
                check: "integrity",
                severity: ValidationSeverity::Error,
                detail: integrity,
                fixable: false,
                rows_fixed: 0,
            });
        }

        // 2. Schema version agreement.
        let version: Option<i64> = sqlx::query("SELECT MAX(version) AS version FROM schema_version")
            .fetch_one(self.pool())
            .await?
            .try_get("version")?;
        let version = version.unwrap_or(0);
        let latest = latest_schema_version();
        if version != latest {
            issues.push(ValidationIssue {
                check: "schema_version",
                severity: ValidationSeverity::Error,
                detail: format!("store is at version {version}, expected {latest}"),
                fixable: false,
                rows_fixed: 0,
            });
        }

        // 3. Foreign-key violations.
        let fk_rows = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(self.pool())
            .await?;
        if !fk_rows.is_empty() {
            issues.push(ValidationIssue {
                check: "foreign_keys",
                severity: ValidationSeverity::Error,
                detail: format!("{} foreign-key violations", fk_rows.len()),
                fixable: false,
                rows_fixed: 0,
            });
        }

        // 4. Dependencies pointing at missing tasks.
        let orphaned: i64 = sqlx::query(
            r#"
SELECT COUNT(*) AS orphaned
FROM task_dependencies d
WHERE NOT EXISTS (SELECT 1 FROM tasks t WHERE t.id = d.blocker_id)
   OR NOT EXISTS (SELECT 1 FROM tasks t WHERE t.id = d.blocked_id)
            "#,
        )
        .fetch_one(self.pool())
        .await?
        .try_get("orphaned")?;
        if orphaned > 0 {
            let rows_fixed = if fix {
                sqlx::query(
                    r#"
DELETE FROM task_dependencies
WHERE NOT EXISTS (SELECT 1 FROM tasks t WHERE t.id = task_dependencies.blocker_id)
   OR NOT EXISTS (SELECT 1 FROM tasks t WHERE t.id = task_dependencies.blocked_id)
                    "#,
                )
                .execute(self.pool())
                .await?
                .rows_affected()
            } else {
                0
            };
            issues.push(ValidationIssue {
                check: "orphaned_dependencies",
                severity: ValidationSeverity::Warning,
                detail: format!("{orphaned} dependency edges reference missing tasks"),
                fixable: true,
                rows_fixed,
            });
        }

        // 5. Unknown status strings reset to backlog.
        let known: Vec<String> = TaskStatus::ALL
            .iter()
            .map(|status| format!("'{}'", status.as_str()))
            .collect();
        let known = known.join(", ");
        let invalid: i64 = sqlx::query(&format!(
            r#"
SELECT COUNT(*) AS invalid
FROM tasks
WHERE status NOT IN ({known})
            "#
        ))
        .fetch_one(self.pool())
        .await?
        .try_get("invalid")?;
        if invalid > 0 {
            let rows_fixed = if fix {
                sqlx::query(&format!(
                    r#"
UPDATE tasks SET status = 'backlog'
WHERE status NOT IN ({known})
                    "#
                ))
                .execute(self.pool())
                .await?
                .rows_affected()
            } else {
                0
            };
            issues.push(ValidationIssue {
                check: "invalid_status",
                severity: ValidationSeverity::Warning,
                detail: format!("{invalid} tasks carry unknown status values"),
                fixable: true,
                rows_fixed,
            });
        }

        // 6. Parent pointers to missing tasks are nulled.
        let missing_parents: i64 = sqlx::query(
            r#"
SELECT COUNT(*) AS missing
FROM tasks
WHERE parent_id IS NOT NULL
  AND NOT EXISTS (SELECT 1 FROM tasks p WHERE p.id = tasks.parent_id)
            "#,
        )
        .fetch_one(self.pool())
        .await?
        .try_get("missing")?;
        if missing_parents > 0 {
            let rows_fixed = if fix {
                sqlx::query(
                    r#"
UPDATE tasks SET parent_id = NULL
WHERE parent_id IS NOT NULL
  AND NOT EXISTS (SELECT 1 FROM tasks p WHERE p.id = tasks.parent_id)
                    "#,
                )
                .execute(self.pool())
                .await?
                .rows_affected()
            } else {
                0
            };
            issues.push(ValidationIssue {
                check: "missing_parents",
                severity: ValidationSeverity::Warning,
                detail: format!("{missing_parents} tasks reference missing parents"),
                fixable: true,
                rows_fixed,
            });
        }

        Ok(issues)
    }
}
