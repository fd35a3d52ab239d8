#[cfg(test)]
mod tests {
    use crate::database::{
        CURRENT_SCHEMA, SchemaMigrator, get_schema_changes, migrate_database_declaratively,
        normalize_sql,
    };
    use crate::error::AppError;
    use sqlx::{Row, SqlitePool};

    const COURSES_SCHEMA: &str = r#"
        CREATE TABLE learners (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
    "#;

    const WITH_BADGES_SCHEMA: &str = r#"
        CREATE TABLE learners (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE badges (
            id INTEGER PRIMARY KEY,
            learner_id INTEGER NOT NULL,
            label TEXT NOT NULL,
            FOREIGN KEY (learner_id) REFERENCES learners (id)
        );
    "#;

    const WITH_EMAIL_SCHEMA: &str = r#"
        CREATE TABLE learners (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT
        );
    "#;

    const WITHOUT_NAME_SCHEMA: &str = r#"
        CREATE TABLE learners (
            id INTEGER PRIMARY KEY
        );
    "#;

    const WITH_INDEX_SCHEMA: &str = r#"
        CREATE TABLE learners (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE INDEX idx_learners_name ON learners (name);
    "#;

    async fn create_test_db() -> SqlitePool {
        SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database")
    }

    async fn table_names(pool: &SqlitePool) -> Vec<String> {
        sqlx::query(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .expect("Failed to fetch table names")
        .into_iter()
        .map(|row| row.get::<String, _>(0))
        .collect()
    }

    async fn column_names(pool: &SqlitePool, table: &str) -> Vec<String> {
        sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(pool)
            .await
            .expect("Failed to read table info")
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect()
    }

    async fn index_names(pool: &SqlitePool) -> Vec<String> {
        sqlx::query(
            "SELECT name FROM sqlite_master
             WHERE type = 'index' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .expect("Failed to fetch index names")
        .into_iter()
        .map(|row| row.get::<String, _>(0))
        .collect()
    }

    #[tokio::test]
    async fn test_current_schema_applies_cleanly() {
        let pool = create_test_db().await;

        let changed = migrate_database_declaratively(pool.clone(), CURRENT_SCHEMA)
            .await
            .expect("Migration failed");
        assert!(changed);

        let tables = table_names(&pool).await;
        for expected in [
            "achievements",
            "lesson_progress",
            "organizations",
            "point_transactions",
            "study_streaks",
            "user_achievements",
            "user_points",
            "users",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }

        let again = migrate_database_declaratively(pool.clone(), CURRENT_SCHEMA)
            .await
            .expect("Second migration failed");
        assert!(!again, "Re-running the same schema should be a no-op");

        let changes = get_schema_changes(pool, CURRENT_SCHEMA).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_add_table() {
        let pool = create_test_db().await;
        sqlx::raw_sql(COURSES_SCHEMA).execute(&pool).await.unwrap();

        let changes = get_schema_changes(pool.clone(), WITH_BADGES_SCHEMA)
            .await
            .unwrap();
        assert_eq!(changes.new_tables, vec!["badges".to_string()]);
        assert!(!changes.is_destructive());

        let changed = SchemaMigrator::new(pool.clone(), WITH_BADGES_SCHEMA, false)
            .migrate()
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(table_names(&pool).await, vec!["badges", "learners"]);
    }

    #[tokio::test]
    async fn test_added_column_preserves_rows() {
        let pool = create_test_db().await;
        sqlx::raw_sql(COURSES_SCHEMA).execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO learners (name) VALUES (?)")
            .bind("Ada")
            .execute(&pool)
            .await
            .unwrap();

        SchemaMigrator::new(pool.clone(), WITH_EMAIL_SCHEMA, false)
            .migrate()
            .await
            .unwrap();

        assert!(column_names(&pool, "learners").await.contains(&"email".to_string()));

        let row = sqlx::query("SELECT name, email FROM learners")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("name"), "Ada");
        assert!(row.get::<Option<String>, _>("email").is_none());
    }

    #[tokio::test]
    async fn test_destructive_changes_need_permission() {
        let pool = create_test_db().await;
        sqlx::raw_sql(WITH_BADGES_SCHEMA).execute(&pool).await.unwrap();

        let refused = SchemaMigrator::new(pool.clone(), WITHOUT_NAME_SCHEMA, false)
            .migrate()
            .await;
        match refused {
            Err(AppError::Validation(message)) => {
                assert!(message.contains("badges"));
                assert!(message.contains("learners"));
            }
            other => panic!("Expected a refused migration, got {:?}", other.map(|_| ())),
        }
        assert_eq!(table_names(&pool).await, vec!["badges", "learners"]);
        assert!(column_names(&pool, "learners").await.contains(&"name".to_string()));

        let changed = SchemaMigrator::new(pool.clone(), WITHOUT_NAME_SCHEMA, true)
            .migrate()
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(table_names(&pool).await, vec!["learners"]);
        assert_eq!(column_names(&pool, "learners").await, vec!["id".to_string()]);
    }

    #[tokio::test]
    async fn test_index_changes() {
        let pool = create_test_db().await;
        sqlx::raw_sql(COURSES_SCHEMA).execute(&pool).await.unwrap();

        SchemaMigrator::new(pool.clone(), WITH_INDEX_SCHEMA, false)
            .migrate()
            .await
            .unwrap();
        assert_eq!(index_names(&pool).await, vec!["idx_learners_name"]);

        let changes = get_schema_changes(pool.clone(), COURSES_SCHEMA).await.unwrap();
        assert_eq!(changes.removed_indices, vec!["idx_learners_name".to_string()]);
        assert!(changes.is_destructive());

        assert!(
            SchemaMigrator::new(pool.clone(), COURSES_SCHEMA, false)
                .migrate()
                .await
                .is_err()
        );
        SchemaMigrator::new(pool.clone(), COURSES_SCHEMA, true)
            .migrate()
            .await
            .unwrap();
        assert!(index_names(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn test_rebuilt_table_keeps_its_index() {
        let pool = create_test_db().await;
        sqlx::raw_sql(WITH_INDEX_SCHEMA).execute(&pool).await.unwrap();

        let target = format!(
            "{}\nCREATE INDEX idx_learners_name ON learners (name);",
            WITH_EMAIL_SCHEMA
        );
        SchemaMigrator::new(pool.clone(), &target, false)
            .migrate()
            .await
            .unwrap();

        assert_eq!(index_names(&pool).await, vec!["idx_learners_name"]);
        assert!(column_names(&pool, "learners").await.contains(&"email".to_string()));
    }

    #[test]
    fn test_normalize_sql() {
        assert_eq!(
            normalize_sql("CREATE TABLE test( -- comment\n  id INTEGER )"),
            "CREATE TABLE TEST(ID INTEGER)"
        );
        assert_eq!(
            normalize_sql("CREATE TABLE \"quoted\"(id INTEGER)"),
            "CREATE TABLE QUOTED(ID INTEGER)"
        );
    }
}
