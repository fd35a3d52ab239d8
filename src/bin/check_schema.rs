use std::path::PathBuf;

use anyhow::Context;
use lms_gamification::database::{CURRENT_SCHEMA, SchemaChanges, get_schema_changes};
use lms_gamification::env::{database_url, load_environment};
use sqlx::SqlitePool;

/// Compare a live database against the declared schema and list what a
/// migration would change. Exits non-zero when the change is destructive.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_environment().context("failed to read environment files")?;

    let schema = match std::env::var("SCHEMA_PATH") {
        Ok(path) => {
            let path = PathBuf::from(path);
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read schema file {}", path.display()))?
        }
        Err(_) => CURRENT_SCHEMA.to_string(),
    };

    let url = database_url();
    let pool = SqlitePool::connect(&url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let changes = get_schema_changes(pool, &schema).await?;

    if changes.is_empty() {
        println!("Schema is up to date");
        return Ok(());
    }

    print_changes(&changes);

    if changes.is_destructive() {
        println!("Destructive changes detected, set ALLOW_DESTRUCTIVE_MIGRATIONS=true to apply");
        std::process::exit(1);
    }

    println!("Changes passed the check");
    Ok(())
}

fn print_changes(changes: &SchemaChanges) {
    print_list("Table added:", &changes.new_tables);
    print_list("Table removed:", &changes.removed_tables);
    for table in &changes.modified_tables {
        let prefix = format!("Column added to {}:", table.name);
        print_list(&prefix, &table.new_columns);
        let prefix = format!("Column removed from {}:", table.name);
        print_list(&prefix, &table.removed_columns);
    }
    print_list("Index added:", &changes.new_indices);
    print_list("Index removed:", &changes.removed_indices);
    print_list("Index changed:", &changes.modified_indices);
}

fn print_list(prefix: &str, items: &[String]) {
    for item in items {
        println!("    {} {}", prefix, item);
    }
}
