//! Guarded read-only SQL execution.
//!
//! Two layers, kept deliberately redundant:
//! 1. a text screen rejecting multi-statement payloads and DDL/DML/ATTACH/
//!    PRAGMA/extension keywords before anything touches the database, and
//! 2. engine-level guards on a per-request read-only connection: an
//!    authorizer denying the same action set, a progress handler enforcing
//!    the VM step budget and wall-clock deadline, and an appended
//!    `LIMIT N+1` for truncation detection.
//!
//! Budget overruns come back as a normal error result, never a panic.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::Regex;
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 200;
pub const DEFAULT_TIMEOUT_MS: u64 = 300;
pub const MAX_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_MAX_VM_STEPS: u64 = 500_000;
pub const MAX_MAX_VM_STEPS: u64 = 5_000_000;

#[derive(Debug, Clone, Copy)]
pub struct SqlGuardOptions {
    pub limit: usize,
    pub timeout_ms: u64,
    pub max_vm_steps: u64,
    pub include_schema: bool,
}

impl Default for SqlGuardOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_vm_steps: DEFAULT_MAX_VM_STEPS,
            include_schema: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlQueryOutput {
    pub ok: bool,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub truncated: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Vec<TableSchema>>,
}

impl SqlQueryOutput {
    fn failure(error: String, hint: Option<String>, elapsed_ms: u64) -> Self {
        Self {
            ok: false,
            rows: Vec::new(),
            row_count: 0,
            columns: Vec::new(),
            truncated: false,
            elapsed_ms,
            error: Some(error),
            hint,
            schema: None,
        }
    }
}

/// Reject dangerous SQL before execution: multiple statements and a
/// case-insensitive whole-word screen over DDL/DML/ATTACH/PRAGMA and
/// extension loading.
pub fn validate_sql_text(sql: &str) -> Result<(), String> {
    let stripped = sql.trim().trim_end_matches(';');
    if stripped.contains(';') {
        return Err("Multiple statements are not allowed".to_string());
    }

    const FORBIDDEN: &[&str] = &[
        "ATTACH", "DETACH", "load_extension", "CREATE", "DROP", "ALTER", "INSERT", "UPDATE",
        "DELETE", "REPLACE", "PRAGMA",
    ];
    for keyword in FORBIDDEN {
        let pattern = format!(r"(?i)\b{}\b", keyword);
        if Regex::new(&pattern).expect("static regex").is_match(sql) {
            return Err(format!("Forbidden SQL keyword detected: {}", keyword));
        }
    }
    Ok(())
}

/// Remove a trailing user LIMIT clause so the engine-appended `LIMIT N+1`
/// is authoritative. Inner (subquery) LIMITs are preserved.
pub fn strip_limit_clause(sql: &str) -> String {
    let pattern = Regex::new(r"(?is)\s+LIMIT\s+\d+(?:\s*,\s*\d+|\s+OFFSET\s+\d+)?\s*;?\s*$")
        .expect("static regex");
    pattern.replace(sql, "").to_string()
}

/// Heuristic hints for common errors against the evidence graph schema.
fn error_hint(error: &str) -> Option<String> {
    let lower = error.to_lowercase();

    if lower.contains("no such column") && lower.contains("task_id") {
        if lower.contains("page") {
            return Some(
                "pages are URL-scoped and carry no task_id. To filter by task, JOIN \
                 serp_items and queries: pages.url = serp_items.url, serp_items.query_id \
                 = queries.id, queries.task_id = '...'"
                    .to_string(),
            );
        }
        if lower.contains("fragment") {
            return Some(
                "fragments carry no task_id. JOIN pages ON fragments.page_id = pages.id, \
                 then reach the task through serp_items and queries."
                    .to_string(),
            );
        }
        if lower.contains("edge") {
            return Some(
                "edges carry no task_id. JOIN claims c ON edges.target_id = c.id AND \
                 edges.target_type = 'claim' WHERE c.task_id = '...'"
                    .to_string(),
            );
        }
    }

    if lower.contains("no such table") {
        if lower.contains("results") || lower.contains("search") {
            return Some(
                "search results live in serp_items (query_id, url, rank, source_tag); \
                 queries link them to tasks."
                    .to_string(),
            );
        }
        if lower.contains("health") {
            return Some("engine health is the engine_health table, one row per engine.".to_string());
        }
    }

    None
}

/// Execute a validated query on a fresh read-only connection with all
/// runtime guards installed. Blocking; call through [`execute`].
pub fn execute_readonly(db_path: &Path, sql: &str, options: &SqlGuardOptions) -> SqlQueryOutput {
    let started = Instant::now();
    let elapsed_ms = |started: Instant| started.elapsed().as_millis() as u64;

    let conn = match Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(conn) => conn,
        Err(e) => {
            return SqlQueryOutput::failure(
                format!("Failed to open read-only connection: {}", e),
                None,
                elapsed_ms(started),
            )
        }
    };

    install_guards(&conn, options.timeout_ms, options.max_vm_steps);

    let clean = strip_limit_clause(sql.trim().trim_end_matches(';'));
    let sql_with_limit = format!("{} LIMIT {}", clean, options.limit + 1);

    let result = run_query(&conn, &sql_with_limit, options.limit);
    let elapsed = elapsed_ms(started);

    match result {
        Ok((mut rows, columns)) => {
            let truncated = rows.len() > options.limit;
            if truncated {
                rows.truncate(options.limit);
            }

            let schema = if options.include_schema {
                match read_schema(&conn) {
                    Ok(tables) => Some(tables),
                    Err(e) => {
                        log::warn!("Schema introspection failed: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            SqlQueryOutput {
                ok: true,
                row_count: rows.len(),
                rows,
                columns,
                truncated,
                elapsed_ms: elapsed,
                error: None,
                hint: None,
                schema,
            }
        }
        Err(e) => {
            let message = e.to_string();
            if message.to_lowercase().contains("interrupt") {
                return SqlQueryOutput::failure(
                    "Query interrupted (timeout or max_vm_steps exceeded)".to_string(),
                    Some("Reduce the scanned range, add WHERE filters, or raise timeout_ms/max_vm_steps within their caps.".to_string()),
                    elapsed,
                );
            }
            log::warn!("SQL execution error: {}", message);
            let hint = error_hint(&message);
            SqlQueryOutput::failure(message, hint, elapsed)
        }
    }
}

/// Async wrapper; each request gets its own blocking read-only connection.
pub async fn execute(db_path: PathBuf, sql: String, options: SqlGuardOptions) -> SqlQueryOutput {
    tokio::task::spawn_blocking(move || execute_readonly(&db_path, &sql, &options))
        .await
        .unwrap_or_else(|e| SqlQueryOutput::failure(format!("Query worker failed: {}", e), None, 0))
}

fn install_guards(conn: &Connection, timeout_ms: u64, max_vm_steps: u64) {
    conn.authorizer(Some(|ctx: AuthContext<'_>| match ctx.action {
        AuthAction::Attach { .. }
        | AuthAction::Detach { .. }
        | AuthAction::Pragma { .. }
        | AuthAction::CreateIndex { .. }
        | AuthAction::CreateTable { .. }
        | AuthAction::CreateTempIndex { .. }
        | AuthAction::CreateTempTable { .. }
        | AuthAction::CreateTempTrigger { .. }
        | AuthAction::CreateTempView { .. }
        | AuthAction::CreateTrigger { .. }
        | AuthAction::CreateView { .. }
        | AuthAction::CreateVtable { .. }
        | AuthAction::DropIndex { .. }
        | AuthAction::DropTable { .. }
        | AuthAction::DropTempIndex { .. }
        | AuthAction::DropTempTable { .. }
        | AuthAction::DropTempTrigger { .. }
        | AuthAction::DropTempView { .. }
        | AuthAction::DropTrigger { .. }
        | AuthAction::DropView { .. }
        | AuthAction::DropVtable { .. }
        | AuthAction::AlterTable { .. }
        | AuthAction::Insert { .. }
        | AuthAction::Update { .. }
        | AuthAction::Delete { .. }
        | AuthAction::Transaction { .. }
        | AuthAction::Savepoint { .. } => Authorization::Deny,
        AuthAction::Function { function_name } => {
            if function_name.eq_ignore_ascii_case("load_extension") {
                Authorization::Deny
            } else {
                Authorization::Allow
            }
        }
        _ => Authorization::Allow,
    }));

    // Progress callback cadence: frequent enough to honor short deadlines,
    // coarse enough to stay cheap.
    let callback_every = ((max_vm_steps / 1000).max(1_000)).min(100_000) as std::os::raw::c_int;
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut steps_used: u64 = 0;

    conn.progress_handler(
        callback_every,
        Some(move || {
            steps_used += callback_every as u64;
            steps_used >= max_vm_steps || Instant::now() >= deadline
        }),
    );
}

type QueryRows = Vec<serde_json::Map<String, serde_json::Value>>;

fn run_query(
    conn: &Connection,
    sql: &str,
    _limit: usize,
) -> rusqlite::Result<(QueryRows, Vec<String>)> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let column_count = columns.len();

    let mut out = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut object = serde_json::Map::with_capacity(column_count);
        for (i, name) in columns.iter().enumerate() {
            object.insert(name.clone(), value_to_json(row.get_ref(i)?));
        }
        out.push(object);
    }

    Ok((out, columns))
}

fn value_to_json(value: rusqlite::types::ValueRef<'_>) -> serde_json::Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).to_string()),
        // Blobs travel as hex.
        ValueRef::Blob(b) => {
            serde_json::Value::from(b.iter().map(|x| format!("{:02x}", x)).collect::<String>())
        }
    }
}

/// Table/column listing parsed from sqlite_master.sql (PRAGMA is denied by
/// the authorizer, so the CREATE statements are parsed instead).
fn read_schema(conn: &Connection) -> rusqlite::Result<Vec<TableSchema>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%'
         ORDER BY name",
    )?;

    let mut tables = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let create_sql: Option<String> = row.get(1)?;
        tables.push(TableSchema {
            name,
            columns: create_sql.as_deref().map(parse_columns).unwrap_or_default(),
        });
    }
    Ok(tables)
}

fn parse_columns(create_sql: &str) -> Vec<String> {
    let Some(open) = create_sql.find('(') else {
        return Vec::new();
    };
    let Some(close) = create_sql.rfind(')') else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }

    let body = &create_sql[open + 1..close];
    let mut columns = Vec::new();
    let mut depth = 0usize;
    let mut part = String::new();

    let mut push_part = |part: &str, columns: &mut Vec<String>| {
        let head = part
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']');
        if head.is_empty() {
            return;
        }
        const TABLE_CLAUSES: &[&str] = &["FOREIGN", "PRIMARY", "UNIQUE", "CHECK", "CONSTRAINT"];
        if !TABLE_CLAUSES.contains(&head.to_uppercase().as_str()) {
            columns.push(head.to_string());
        }
    };

    for c in body.chars() {
        match c {
            '(' => {
                depth += 1;
                part.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                part.push(c);
            }
            ',' if depth == 0 => {
                push_part(&part, &mut columns);
                part.clear();
            }
            _ => part.push(c),
        }
    }
    push_part(&part, &mut columns);
    columns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_multiple_statements() {
        assert!(validate_sql_text("SELECT 1; SELECT 2").is_err());
        assert!(validate_sql_text("SELECT 1;").is_ok());
    }

    #[test]
    fn rejects_forbidden_keywords_whole_word_case_insensitive() {
        for sql in [
            "INSERT INTO tasks VALUES ('x')",
            "insert into tasks values ('x')",
            "DROP TABLE tasks",
            "ATTACH DATABASE 'x' AS y",
            "PRAGMA journal_mode",
            "SELECT load_extension('evil')",
            "UPDATE tasks SET status = 'done'",
            "DELETE FROM tasks",
            "REPLACE INTO tasks VALUES (1)",
            "ALTER TABLE tasks ADD COLUMN x",
        ] {
            let err = validate_sql_text(sql).unwrap_err();
            assert!(err.contains("Forbidden"), "sql={} err={}", sql, err);
        }
    }

    #[test]
    fn keyword_screen_matches_whole_words_only() {
        // "created_at" contains "create" but is not the keyword CREATE.
        assert!(validate_sql_text("SELECT created_at FROM tasks").is_ok());
        assert!(validate_sql_text("SELECT * FROM tasks WHERE id = 'updated'").is_ok());
    }

    #[test]
    fn strip_limit_handles_variants() {
        assert_eq!(strip_limit_clause("SELECT * FROM t"), "SELECT * FROM t");
        assert_eq!(strip_limit_clause("SELECT * FROM t LIMIT 10"), "SELECT * FROM t");
        assert_eq!(
            strip_limit_clause("SELECT * FROM t LIMIT 10 OFFSET 5"),
            "SELECT * FROM t"
        );
        assert_eq!(strip_limit_clause("SELECT * FROM t LIMIT 10, 5"), "SELECT * FROM t");
        assert_eq!(strip_limit_clause("SELECT * FROM t limit 10;"), "SELECT * FROM t");
        // Inner subquery LIMIT survives.
        let inner = "SELECT * FROM (SELECT * FROM t LIMIT 5) AS s";
        assert_eq!(strip_limit_clause(inner), inner);
    }

    #[test]
    fn parse_columns_skips_table_level_clauses() {
        let cols = parse_columns(
            "CREATE TABLE t (id TEXT PRIMARY KEY, value REAL CHECK (value >= 0), \
             UNIQUE (id, value), FOREIGN KEY (id) REFERENCES other(id))",
        );
        assert_eq!(cols, vec!["id", "value"]);
    }

    #[test]
    fn hints_cover_task_id_on_pages() {
        let hint = error_hint("no such column: task_id in pages query").unwrap();
        assert!(hint.contains("URL-scoped"));
    }

    // -- execution against a real database -----------------------------------

    async fn seeded_db(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let pool = crate::db::test_pool(dir.path()).await;
        for i in 0..5 {
            sqlx::query("INSERT INTO tasks (id, hypothesis, status, created_at) VALUES (?, ?, 'completed', ?)")
                .bind(format!("task_{}", i))
                .bind(format!("hypothesis {}", i))
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&pool)
                .await
                .unwrap();
        }
        pool.close().await;
        dir.path().join("test.db")
    }

    #[tokio::test]
    async fn selects_rows_with_truncation_flag() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = seeded_db(&dir).await;

        let options = SqlGuardOptions {
            limit: 3,
            ..Default::default()
        };
        let out = execute(db_path, "SELECT * FROM tasks".to_string(), options).await;

        assert!(out.ok, "error={:?}", out.error);
        assert_eq!(out.row_count, 3);
        assert!(out.truncated);
        assert!(out.columns.contains(&"hypothesis".to_string()));
    }

    #[tokio::test]
    async fn user_limit_is_stripped_and_engine_limit_applies() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = seeded_db(&dir).await;

        let options = SqlGuardOptions {
            limit: 2,
            ..Default::default()
        };
        let out = execute(db_path, "SELECT * FROM tasks LIMIT 100".to_string(), options).await;

        assert!(out.ok);
        assert_eq!(out.row_count, 2);
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn under_limit_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = seeded_db(&dir).await;

        let out = execute(
            db_path,
            "SELECT * FROM tasks WHERE id = 'task_0'".to_string(),
            SqlGuardOptions::default(),
        )
        .await;

        assert!(out.ok);
        assert_eq!(out.row_count, 1);
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn authorizer_blocks_writes_even_past_text_screen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = seeded_db(&dir).await;

        // Straight to execution, bypassing validate_sql_text: the
        // engine-level guard must still refuse.
        let out = execute(
            db_path.clone(),
            "INSERT INTO tasks (id, hypothesis, status, created_at) VALUES ('x', 'y', 'created', 'now')"
                .to_string(),
            SqlGuardOptions::default(),
        )
        .await;
        assert!(!out.ok);

        // And the row count is unchanged.
        let check = execute(
            db_path,
            "SELECT COUNT(*) AS cnt FROM tasks".to_string(),
            SqlGuardOptions::default(),
        )
        .await;
        assert_eq!(check.rows[0]["cnt"], serde_json::Value::from(5));
    }

    #[tokio::test]
    async fn sql_execution_never_mutates_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = seeded_db(&dir).await;

        let before = std::fs::read(&db_path).unwrap();
        let _ = execute(
            db_path.clone(),
            "SELECT * FROM tasks ORDER BY id".to_string(),
            SqlGuardOptions::default(),
        )
        .await;
        let after = std::fs::read(&db_path).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn syntax_error_returns_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = seeded_db(&dir).await;

        let out = execute(
            db_path,
            "SELECT FROM WHERE".to_string(),
            SqlGuardOptions::default(),
        )
        .await;
        assert!(!out.ok);
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn missing_task_id_column_comes_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = seeded_db(&dir).await;

        let out = execute(
            db_path,
            "SELECT task_id FROM pages".to_string(),
            SqlGuardOptions::default(),
        )
        .await;
        assert!(!out.ok);
        assert!(out.hint.is_some());
    }

    #[tokio::test]
    async fn include_schema_lists_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = seeded_db(&dir).await;

        let options = SqlGuardOptions {
            include_schema: true,
            ..Default::default()
        };
        let out = execute(db_path, "SELECT 1 AS one".to_string(), options).await;

        assert!(out.ok);
        let schema = out.schema.unwrap();
        let names: Vec<&str> = schema.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"tasks"));
        assert!(names.contains(&"edges"));

        let tasks = schema.iter().find(|t| t.name == "tasks").unwrap();
        assert!(tasks.columns.contains(&"hypothesis".to_string()));
    }

    #[tokio::test]
    async fn step_budget_interrupts_runaway_query() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = seeded_db(&dir).await;

        // Cartesian explosion over a recursive CTE; must hit the budget.
        let options = SqlGuardOptions {
            max_vm_steps: 10_000,
            timeout_ms: MAX_TIMEOUT_MS,
            ..Default::default()
        };
        let out = execute(
            db_path,
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
             SELECT COUNT(*) FROM c"
                .to_string(),
            options,
        )
        .await;

        assert!(!out.ok);
        assert!(out.error.unwrap().contains("interrupted"));
    }
}
