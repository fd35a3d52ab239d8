use regex::Regex;
use once_cell::sync::Lazy;
use sqlx::{Pool, Row, Sqlite, SqlitePool, Transaction};
use std::collections::{BTreeMap, HashSet};
use tracing::{info, instrument, warn};

use crate::error::AppError;

static COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"--[^\n]*(\n|$)").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r" *([(),]) *").unwrap());
static QUOTED_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r#""(\w+)""#).unwrap());

/// Reduce a CREATE statement to a canonical form so cosmetic edits to the
/// schema file do not trigger table rebuilds.
pub fn normalize_sql(sql: &str) -> String {
    let sql = COMMENTS.replace_all(sql, " ");
    let sql = WHITESPACE.replace_all(&sql, " ");
    let sql = PUNCTUATION.replace_all(&sql, "$1");
    let sql = QUOTED_IDENT.replace_all(&sql, "$1");
    sql.trim().to_uppercase()
}

#[derive(Debug, Clone)]
struct SchemaObject {
    table: String,
    sql: String,
}

#[derive(Debug, Default)]
struct SchemaSnapshot {
    tables: BTreeMap<String, SchemaObject>,
    indices: BTreeMap<String, SchemaObject>,
}

#[derive(Default, Debug, PartialEq, Eq)]
pub struct ModifiedTable {
    pub name: String,
    pub removed_columns: Vec<String>,
    pub new_columns: Vec<String>,
}

#[derive(Default, Debug)]
pub struct SchemaChanges {
    pub new_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    pub modified_tables: Vec<ModifiedTable>,
    pub new_indices: Vec<String>,
    pub removed_indices: Vec<String>,
    pub modified_indices: Vec<String>,
}

impl SchemaChanges {
    pub fn is_empty(&self) -> bool {
        self.new_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.modified_tables.is_empty()
            && self.new_indices.is_empty()
            && self.removed_indices.is_empty()
            && self.modified_indices.is_empty()
    }

    pub fn is_destructive(&self) -> bool {
        !self.removed_tables.is_empty()
            || !self.removed_indices.is_empty()
            || self
                .modified_tables
                .iter()
                .any(|t| !t.removed_columns.is_empty())
    }
}

pub struct SchemaMigrator {
    pool: Pool<Sqlite>,
    target_schema: String,
    allow_deletions: bool,
}

impl SchemaMigrator {
    pub fn new(pool: Pool<Sqlite>, target_schema: &str, allow_deletions: bool) -> Self {
        Self {
            pool,
            target_schema: target_schema.to_string(),
            allow_deletions,
        }
    }

    async fn pristine(&self) -> Result<SqlitePool, AppError> {
        let pristine = SqlitePool::connect("sqlite::memory:").await?;
        if !self.target_schema.trim().is_empty() {
            sqlx::raw_sql(&self.target_schema)
                .execute(&pristine)
                .await
                .map_err(|e| AppError::Internal(format!("Invalid target schema: {}", e)))?;
        }
        Ok(pristine)
    }

    #[instrument(skip(self))]
    pub async fn plan(&self) -> Result<SchemaChanges, AppError> {
        let pristine = self.pristine().await?;
        let mut conn = self.pool.acquire().await?;
        let current = snapshot(&mut *conn).await?;
        let mut pristine_conn = pristine.acquire().await?;
        let target = snapshot(&mut *pristine_conn).await?;

        let mut changes = SchemaChanges::default();

        for (name, table) in &target.tables {
            match current.tables.get(name) {
                None => changes.new_tables.push(name.clone()),
                Some(existing) if normalize_sql(&existing.sql) != normalize_sql(&table.sql) => {
                    let current_cols = table_columns(&mut *conn, name).await?;
                    let target_cols = table_columns(&mut *pristine_conn, name).await?;
                    changes.modified_tables.push(ModifiedTable {
                        name: name.clone(),
                        removed_columns: difference(&current_cols, &target_cols),
                        new_columns: difference(&target_cols, &current_cols),
                    });
                }
                Some(_) => {}
            }
        }
        changes.removed_tables = current
            .tables
            .keys()
            .filter(|name| !target.tables.contains_key(*name))
            .cloned()
            .collect();

        for (name, index) in &target.indices {
            match current.indices.get(name) {
                None => changes.new_indices.push(name.clone()),
                Some(existing) if normalize_sql(&existing.sql) != normalize_sql(&index.sql) => {
                    changes.modified_indices.push(name.clone())
                }
                Some(_) => {}
            }
        }
        changes.removed_indices = current
            .indices
            .keys()
            .filter(|name| !target.indices.contains_key(*name))
            .cloned()
            .collect();

        Ok(changes)
    }

    /// Bring the live database to the target schema. Returns whether
    /// anything changed.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<bool, AppError> {
        info!("Starting declarative database migration");

        let changes = self.plan().await?;
        if changes.is_empty() {
            info!("No schema changes needed");
            return Ok(false);
        }

        if changes.is_destructive() && !self.allow_deletions {
            warn!(?changes, "Refusing destructive migration");
            return Err(AppError::Validation(format!(
                "Migration would remove tables {:?}, indices {:?} or columns in {:?}; set ALLOW_DESTRUCTIVE_MIGRATIONS=true to permit this",
                changes.removed_tables,
                changes.removed_indices,
                changes
                    .modified_tables
                    .iter()
                    .filter(|t| !t.removed_columns.is_empty())
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
            )));
        }

        let pristine = self.pristine().await?;
        let mut pristine_conn = pristine.acquire().await?;
        let target = snapshot(&mut *pristine_conn).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("PRAGMA defer_foreign_keys = TRUE")
            .execute(&mut *tx)
            .await?;

        let mut applied = 0u32;

        for name in &changes.new_tables {
            execute(&mut tx, &format!("create table {}", name), &target.tables[name].sql).await?;
            applied += 1;
        }

        for table in &changes.modified_tables {
            let target_cols = table_columns(&mut *pristine_conn, &table.name).await?;
            rebuild_table(&mut tx, &table.name, &target.tables[&table.name].sql, &target_cols)
                .await?;
            applied += 1;
        }

        for name in &changes.removed_tables {
            execute(&mut tx, &format!("drop table {}", name), &format!("DROP TABLE {}", name))
                .await?;
            applied += 1;
        }

        // Rebuilt tables lose their indices, so compare against the live
        // state inside the transaction rather than the plan.
        let live = snapshot(&mut *tx).await?;
        for (name, index) in &live.indices {
            let stale = match target.indices.get(name) {
                None => true,
                Some(wanted) => normalize_sql(&wanted.sql) != normalize_sql(&index.sql),
            };
            if stale {
                execute(&mut tx, &format!("drop index {}", name), &format!("DROP INDEX {}", name))
                    .await?;
                applied += 1;
            }
        }
        let live = snapshot(&mut *tx).await?;
        for (name, index) in &target.indices {
            if !live.indices.contains_key(name) {
                execute(
                    &mut tx,
                    &format!("create index {} on {}", name, index.table),
                    &index.sql,
                )
                .await?;
                applied += 1;
            }
        }

        tx.commit().await?;
        info!(applied, "Schema migration committed");
        Ok(applied > 0)
    }
}

async fn execute(
    tx: &mut Transaction<'_, Sqlite>,
    description: &str,
    sql: &str,
) -> Result<(), AppError> {
    info!("Database migration: {} with SQL:\n{}", description, sql);
    sqlx::query(sql).execute(&mut **tx).await?;
    Ok(())
}

async fn rebuild_table(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    target_sql: &str,
    target_cols: &[String],
) -> Result<(), AppError> {
    let temp = format!("{}_migration_new", table);
    let create_temp = target_sql.replacen(table, &temp, 1);
    execute(tx, &format!("create replacement for {}", table), &create_temp).await?;

    let current_cols = table_columns(&mut **tx, table).await?;
    let common: Vec<&str> = target_cols
        .iter()
        .filter(|c| current_cols.contains(c))
        .map(String::as_str)
        .collect();

    if !common.is_empty() {
        let cols = common.join(", ");
        execute(
            tx,
            &format!("copy rows into {}", temp),
            &format!("INSERT INTO {} ({}) SELECT {} FROM {}", temp, cols, cols, table),
        )
        .await?;
    }

    execute(tx, &format!("drop old {}", table), &format!("DROP TABLE {}", table)).await?;
    execute(
        tx,
        &format!("rename {} to {}", temp, table),
        &format!("ALTER TABLE {} RENAME TO {}", temp, table),
    )
    .await?;
    Ok(())
}

async fn snapshot(conn: &mut sqlx::SqliteConnection) -> Result<SchemaSnapshot, AppError> {
    let rows = sqlx::query(
        "SELECT type, name, tbl_name, sql FROM sqlite_master
         WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut snapshot = SchemaSnapshot::default();
    for row in rows {
        let kind: String = row.get("type");
        let name: String = row.get("name");
        let object = SchemaObject {
            table: row.get("tbl_name"),
            sql: row.get("sql"),
        };
        match kind.as_str() {
            "table" => {
                snapshot.tables.insert(name, object);
            }
            "index" => {
                snapshot.indices.insert(name, object);
            }
            _ => {}
        }
    }
    Ok(snapshot)
}

async fn table_columns(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
) -> Result<Vec<String>, AppError> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.iter().map(|row| row.get::<String, _>("name")).collect())
}

fn difference(left: &[String], right: &[String]) -> Vec<String> {
    let right: HashSet<&String> = right.iter().collect();
    left.iter().filter(|c| !right.contains(c)).cloned().collect()
}

#[instrument(skip(pool, target_schema))]
pub async fn migrate_database_declaratively(
    pool: Pool<Sqlite>,
    target_schema: &str,
) -> Result<bool, AppError> {
    let allow_deletions = std::env::var("ALLOW_DESTRUCTIVE_MIGRATIONS")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    SchemaMigrator::new(pool, target_schema, allow_deletions)
        .migrate()
        .await
}

#[instrument(skip(pool, target_schema))]
pub async fn get_schema_changes(
    pool: Pool<Sqlite>,
    target_schema: &str,
) -> Result<SchemaChanges, AppError> {
    SchemaMigrator::new(pool, target_schema, false).plan().await
}
