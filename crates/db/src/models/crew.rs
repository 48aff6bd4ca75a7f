use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CrewError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Crew not found")]
    NotFound,
}

/// Configuration for one task's optional human checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct HumanInputSpec {
    pub prompt: String,
    /// Seconds until the gate times out; `None` waits indefinitely.
    pub timeout_seconds: Option<u64>,
    /// When true, a timeout fails the execution instead of continuing
    /// with no input.
    #[serde(default)]
    pub hard_blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CrewTask {
    pub name: String,
    pub description: String,
    /// Display name of the agent responsible for the task.
    pub agent: String,
    pub human_input: Option<HumanInputSpec>,
}

/// An ordered task sequence. The topology is fixed configuration; the
/// engine walks it linearly.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Crew {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub tasks: String, // JSON array of CrewTask
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateCrew {
    pub name: String,
    pub description: Option<String>,
    pub tasks: Vec<CrewTask>,
}

impl Crew {
    pub async fn create(pool: &SqlitePool, data: &CreateCrew, id: Uuid) -> Result<Self, CrewError> {
        let tasks_str = serde_json::to_string(&data.tasks).unwrap_or_else(|_| "[]".to_string());

        let crew = sqlx::query_as::<_, Crew>(
            r#"
            INSERT INTO crews (id, name, description, tasks)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.description)
        .bind(tasks_str)
        .fetch_one(pool)
        .await?;

        Ok(crew)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, CrewError> {
        let crew = sqlx::query_as::<_, Crew>(r#"SELECT * FROM crews WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(crew)
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, CrewError> {
        let crews = sqlx::query_as::<_, Crew>(r#"SELECT * FROM crews ORDER BY created_at ASC"#)
            .fetch_all(pool)
            .await?;

        Ok(crews)
    }

    /// Parse the stored task list.
    pub fn task_list(&self) -> Vec<CrewTask> {
        serde_json::from_str(&self.tasks).unwrap_or_default()
    }

    /// Seed a starter crew on an empty install so the board has something
    /// to show before any configuration happens.
    pub async fn seed_default(pool: &SqlitePool) -> Result<Option<Self>, CrewError> {
        let count: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM crews"#)
            .fetch_one(pool)
            .await?;
        if count.0 > 0 {
            return Ok(None);
        }

        let data = CreateCrew {
            name: "SEO Site Audit".to_string(),
            description: Some("Crawl, analyze and report on a client site".to_string()),
            tasks: vec![
                CrewTask {
                    name: "Crawl site".to_string(),
                    description: "Fetch the client's pages and collect on-page signals"
                        .to_string(),
                    agent: "Crawler".to_string(),
                    human_input: None,
                },
                CrewTask {
                    name: "Analyze keywords".to_string(),
                    description: "Rank tracked keywords against crawl findings".to_string(),
                    agent: "Analyst".to_string(),
                    human_input: Some(HumanInputSpec {
                        prompt: "Which keyword set should the report prioritize?".to_string(),
                        timeout_seconds: Some(3600),
                        hard_blocking: false,
                    }),
                },
                CrewTask {
                    name: "Compile report".to_string(),
                    description: "Assemble the audit into a client-ready report".to_string(),
                    agent: "Reporter".to_string(),
                    human_input: None,
                },
            ],
        };

        let crew = Self::create(pool, &data, Uuid::new_v4()).await?;
        Ok(Some(crew))
    }
}
