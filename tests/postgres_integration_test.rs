// ABOUTME: Integration tests against a real PostgreSQL database
// ABOUTME: Builds a throwaway ActionKit schema and runs full sync cycles over it

use ak_survey_sync::config::SyncConfig;
use ak_survey_sync::survey::info::refresh_info;
use ak_survey_sync::survey::orchestrator::{connect_backend, execute, execute_page, now};
use ak_survey_sync::survey::scheduler::PageState;
use chrono::{NaiveDate, NaiveDateTime};
use std::env;

/// Helper to get the test database URL from the environment
fn get_test_url() -> Option<String> {
    env::var("TEST_DATABASE_URL").ok()
}

fn ts(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn test_config(url: &str, suffix: &str) -> SyncConfig {
    SyncConfig {
        database_url: url.to_string(),
        ak_schema: format!("ak_test_{}", suffix),
        survey_schema: format!("survey_test_{}", suffix),
        ..Default::default()
    }
}

/// Helper to create empty ActionKit source tables in a fresh schema
async fn setup_source(client: &tokio_postgres::Client, config: &SyncConfig) -> anyhow::Result<()> {
    let ddl = format!(
        r#"
        DROP SCHEMA IF EXISTS "{ak}" CASCADE;
        DROP SCHEMA IF EXISTS "{survey}" CASCADE;
        CREATE SCHEMA "{ak}";
        CREATE TABLE "{ak}"."core_page" (
            id INTEGER PRIMARY KEY,
            type VARCHAR(255) NOT NULL
        );
        CREATE TABLE "{ak}"."core_action" (
            id INTEGER PRIMARY KEY,
            page_id INTEGER NOT NULL,
            created_at TIMESTAMP NOT NULL
        );
        CREATE TABLE "{ak}"."core_actionfield" (
            id SERIAL PRIMARY KEY,
            parent_id INTEGER NOT NULL,
            name VARCHAR(255) NOT NULL,
            value TEXT NOT NULL
        );
        "#,
        ak = config.ak_schema,
        survey = config.survey_schema
    );
    client.batch_execute(&ddl).await?;
    Ok(())
}

/// Helper to drop both test schemas
async fn cleanup(client: &tokio_postgres::Client, config: &SyncConfig) {
    let ddl = format!(
        r#"DROP SCHEMA IF EXISTS "{}" CASCADE; DROP SCHEMA IF EXISTS "{}" CASCADE"#,
        config.ak_schema, config.survey_schema
    );
    let _ = client.batch_execute(&ddl).await;
}

async fn insert_action(
    client: &tokio_postgres::Client,
    config: &SyncConfig,
    page_id: i32,
    action_id: i32,
    created_at: NaiveDateTime,
    fields: &[(&str, &str)],
) -> anyhow::Result<()> {
    client
        .execute(
            &format!(
                r#"INSERT INTO "{}"."core_action" (id, page_id, created_at) VALUES ($1, $2, $3)"#,
                config.ak_schema
            ),
            &[&action_id, &page_id, &created_at],
        )
        .await?;
    for (name, value) in fields {
        client
            .execute(
                &format!(
                    r#"INSERT INTO "{}"."core_actionfield" (parent_id, name, value) VALUES ($1, $2, $3)"#,
                    config.ak_schema
                ),
                &[&action_id, name, value],
            )
            .await?;
    }
    Ok(())
}

async fn insert_page(
    client: &tokio_postgres::Client,
    config: &SyncConfig,
    page_id: i32,
    page_type: &str,
) -> anyhow::Result<()> {
    client
        .execute(
            &format!(
                r#"INSERT INTO "{}"."core_page" (id, type) VALUES ($1, $2)"#,
                config.ak_schema
            ),
            &[&page_id, &page_type],
        )
        .await?;
    Ok(())
}

/// Test: a first run materializes one sparse row per action and records the checkpoint
#[tokio::test]
#[ignore]
async fn test_full_cycle_materializes_survey() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let config = test_config(&url, "cycle");
    let client = ak_survey_sync::postgres::connect(&url)
        .await
        .expect("Failed to connect");
    setup_source(&client, &config).await.unwrap();

    insert_page(&client, &config, 42, "Survey").await.unwrap();
    insert_page(&client, &config, 43, "Petition").await.unwrap();
    insert_action(&client, &config, 42, 1, ts(9), &[("email", "a@example.org")])
        .await
        .unwrap();
    insert_action(&client, &config, 42, 2, ts(10), &[("email", "b@example.org"), ("zip", "02134")])
        .await
        .unwrap();
    insert_action(&client, &config, 42, 3, ts(11), &[("zip", "60601")])
        .await
        .unwrap();
    insert_action(&client, &config, 43, 4, ts(11), &[("email", "c@example.org")])
        .await
        .unwrap();

    let summary = execute(&config).await.unwrap();
    assert_eq!(summary.pages_succeeded, 1);
    assert_eq!(summary.total_rows, 3);

    let rows = client
        .query(
            &format!(
                r#"SELECT action_id, email, zip FROM "{}"."page_42" ORDER BY action_id"#,
                config.survey_schema
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get::<_, Option<String>>("zip"), None);
    assert_eq!(rows[1].get::<_, Option<String>>("zip"), Some("02134".to_string()));
    assert_eq!(rows[2].get::<_, Option<String>>("email"), None);

    let registry = client
        .query_one(
            &format!(
                r#"SELECT column_list, last_refresh FROM "{}"."pages" WHERE page_id = 42"#,
                config.survey_schema
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(registry.get::<_, String>("column_list"), "email,zip");
    assert_eq!(registry.get::<_, Option<NaiveDateTime>>("last_refresh"), Some(ts(11)));

    // Nothing new: the page is not rediscovered
    let summary = execute(&config).await.unwrap();
    assert!(summary.outcomes.is_empty());

    cleanup(&client, &config).await;
}

/// Test: new fields add columns without touching existing rows
#[tokio::test]
#[ignore]
async fn test_new_fields_extend_table() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let config = test_config(&url, "extend");
    let client = ak_survey_sync::postgres::connect(&url)
        .await
        .expect("Failed to connect");
    setup_source(&client, &config).await.unwrap();

    insert_page(&client, &config, 7, "Survey").await.unwrap();
    insert_action(&client, &config, 7, 1, ts(9), &[("age", "41")])
        .await
        .unwrap();
    execute(&config).await.unwrap();

    insert_action(&client, &config, 7, 2, ts(10), &[("color", "red")])
        .await
        .unwrap();
    execute(&config).await.unwrap();

    let rows = client
        .query(
            &format!(
                r#"SELECT action_id, age, color FROM "{}"."page_7" ORDER BY action_id"#,
                config.survey_schema
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get::<_, Option<f64>>("age"), Some(41.0));
    assert_eq!(rows[0].get::<_, Option<String>>("color"), None);
    assert_eq!(rows[1].get::<_, Option<String>>("color"), Some("red".to_string()));

    cleanup(&client, &config).await;
}

/// Test: replaying a page from an earlier point upserts instead of duplicating
#[tokio::test]
#[ignore]
async fn test_replay_is_idempotent() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let config = test_config(&url, "replay");
    let client = ak_survey_sync::postgres::connect(&url)
        .await
        .expect("Failed to connect");
    setup_source(&client, &config).await.unwrap();

    insert_page(&client, &config, 9, "Survey").await.unwrap();
    insert_action(&client, &config, 9, 1, ts(9), &[("q", "yes")])
        .await
        .unwrap();
    insert_action(&client, &config, 9, 2, ts(10), &[("q", "no")])
        .await
        .unwrap();
    execute(&config).await.unwrap();

    let backend = connect_backend(&config).await.unwrap();
    let outcome = execute_page(&backend, &config, 9, Some(ts(0)), now())
        .await
        .unwrap();
    assert_eq!(outcome.state, PageState::CaughtUp);
    assert_eq!(outcome.checkpoint_after, Some(ts(10)));

    let info = refresh_info(&backend, 9).await.unwrap();
    assert_eq!(info.action_count, 2);
    assert_eq!(info.saved_count, 2);
    assert_eq!(info.pending_count(), 0);

    cleanup(&client, &config).await;
}
