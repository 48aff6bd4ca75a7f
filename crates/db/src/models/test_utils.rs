use std::str::FromStr;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

use super::crew::{CreateCrew, Crew, CrewTask};

pub(crate) async fn setup_test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("invalid sqlite config")
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("failed to open sqlite memory db");

    bootstrap_schema(&pool).await;

    pool
}

async fn bootstrap_schema(pool: &SqlitePool) {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS crews (
            id          BLOB PRIMARY KEY,
            name        TEXT NOT NULL,
            description TEXT,
            tasks       TEXT NOT NULL DEFAULT '[]',
            created_at  TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            updated_at  TEXT NOT NULL DEFAULT (datetime('now','subsec'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id                 BLOB PRIMARY KEY,
            crew_id            BLOB NOT NULL REFERENCES crews(id) ON DELETE CASCADE,
            client_id          BLOB NOT NULL,
            status             TEXT NOT NULL DEFAULT 'PENDING',
            current_task_index INTEGER NOT NULL DEFAULT 0,
            cancel_requested   INTEGER NOT NULL DEFAULT 0,
            error              TEXT,
            created_at         TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            started_at         TEXT,
            completed_at       TEXT
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS stages (
            id           BLOB PRIMARY KEY,
            execution_id BLOB NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
            sequence     INTEGER NOT NULL,
            task_index   INTEGER NOT NULL,
            stage_type   TEXT NOT NULL,
            title        TEXT NOT NULL,
            content      TEXT NOT NULL,
            agent        TEXT,
            created_at   TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            UNIQUE (execution_id, sequence)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS human_input_requests (
            id           BLOB PRIMARY KEY,
            execution_id BLOB NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
            prompt       TEXT NOT NULL,
            answer       TEXT,
            outcome      TEXT,
            deadline     TEXT,
            created_at   TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            resolved_at  TEXT
        );
        "#,
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_human_input_requests_unresolved
            ON human_input_requests(execution_id) WHERE resolved_at IS NULL;
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .expect("failed to bootstrap schema");
    }
}

pub(crate) async fn create_test_crew(pool: &SqlitePool) -> Uuid {
    let crew_id = Uuid::new_v4();
    let data = CreateCrew {
        name: format!("Test Crew {}", crew_id),
        description: None,
        tasks: vec![CrewTask {
            name: "Test task".to_string(),
            description: "A task".to_string(),
            agent: "Tester".to_string(),
            human_input: None,
        }],
    };

    Crew::create(pool, &data, crew_id)
        .await
        .expect("failed to create test crew");

    crew_id
}
