//! Postgres-backed store.
//!
//! Asset tables are created per pipe output; `tasks`, `alerts` and
//! `blocked` are shared essentials. The selection query uses a LEFT JOIN
//! anti-predicate against `tasks` so rows without any marker are selected
//! too.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use trawl_core::data::{AlertType, Data};

use crate::{Result, Store};

/// Table queried for the distinct-target listing feeding `as_file` runs.
const CANONICAL_ASSET_TABLE: &str = "domains";

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// True when a table of that name exists. Used by schema tests.
    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let row =
            sqlx::query("SELECT 1 FROM information_schema.tables WHERE table_name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}

#[derive(sqlx::FromRow)]
struct DataRow {
    id: String,
    asset: String,
    target: String,
    pipe: String,
    data: Option<Value>,
}

impl From<DataRow> for Data {
    fn from(row: DataRow) -> Self {
        let data = match row.data {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Data {
            id: row.id,
            asset: row.asset,
            target: row.target,
            pipe: row.pipe,
            data,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn setup_schema(&self, tables: &[String]) -> Result<()> {
        for statement in [
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id serial PRIMARY KEY,
                pipe text NOT NULL,
                ident text NOT NULL,
                note text,
                created_at timestamp DEFAULT NOW()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS tasks_pipe_idx ON tasks (pipe)",
            "CREATE INDEX IF NOT EXISTS tasks_ident_idx ON tasks (ident)",
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id serial PRIMARY KEY,
                type text NOT NULL,
                pipe text NOT NULL,
                ident text NOT NULL,
                message text,
                created_at timestamp DEFAULT NOW()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS alerts_pipe_idx ON alerts (pipe)",
            "CREATE INDEX IF NOT EXISTS alerts_ident_idx ON alerts (ident)",
            r#"
            CREATE TABLE IF NOT EXISTS blocked (
                domain text PRIMARY KEY,
                created_at timestamp DEFAULT NOW()
            )
            "#,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        for table in tables {
            for statement in [
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        id text PRIMARY KEY,
                        asset text NOT NULL,
                        target text NOT NULL,
                        pipe text NOT NULL,
                        exclude boolean DEFAULT FALSE,
                        data jsonb,
                        created_at timestamp DEFAULT NOW()
                    )
                    "#
                ),
                format!("CREATE INDEX IF NOT EXISTS {table}_asset_idx ON {table} (asset)"),
                format!("CREATE INDEX IF NOT EXISTS {table}_target_idx ON {table} (target)"),
            ] {
                sqlx::query(&statement).execute(&self.pool).await?;
            }
        }

        Ok(())
    }

    async fn add_task(&self, pipe: &str, ident: &str, note: Option<&str>) -> Result<()> {
        sqlx::query("INSERT INTO tasks (pipe, ident, note) VALUES ($1, $2, $3)")
            .bind(pipe)
            .bind(ident)
            .bind(note)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn should_run(&self, pipe: &str, ident: &str, interval: Duration) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM tasks \
             WHERE pipe = $1 AND ident = $2 \
             AND created_at > NOW() - make_interval(secs => $3) \
             LIMIT 1",
        )
        .bind(pipe)
        .bind(ident)
        .bind(interval.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_none())
    }

    async fn retrieve(
        &self,
        table: &str,
        pipe: &str,
        filter: &BTreeMap<String, String>,
        threshold: &BTreeMap<String, f64>,
        interval: Duration,
    ) -> Result<Vec<Data>> {
        let mut sql = format!(
            "SELECT A.id, A.asset, A.target, A.pipe, A.data FROM {table} A \
             LEFT JOIN tasks T ON T.ident = A.id AND T.pipe = $1 \
             AND T.created_at > NOW() - make_interval(secs => $2) \
             WHERE T.ident IS NULL AND A.exclude = FALSE"
        );

        let mut placeholder = 2;
        for _ in filter {
            sql.push_str(&format!(
                " AND (A.data ->> ${}) = ${}",
                placeholder + 1,
                placeholder + 2
            ));
            placeholder += 2;
        }
        for _ in threshold {
            sql.push_str(&format!(
                " AND (A.data ->> ${})::numeric >= ${}::numeric",
                placeholder + 1,
                placeholder + 2
            ));
            placeholder += 2;
        }

        tracing::debug!(%sql, pipe, "generated selection sql");

        let mut query = sqlx::query_as::<_, DataRow>(&sql)
            .bind(pipe)
            .bind(interval.as_secs_f64());
        for (key, value) in filter {
            query = query.bind(key).bind(value);
        }
        for (key, value) in threshold {
            query = query.bind(key).bind(value);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Data::from).collect())
    }

    async fn retrieve_by_target(
        &self,
        table: &str,
        filter: &BTreeMap<String, String>,
        target: &str,
    ) -> Result<Vec<Data>> {
        let mut sql = format!(
            "SELECT id, asset, target, pipe, data FROM {table} \
             WHERE target = $1 AND exclude = FALSE"
        );

        let mut placeholder = 1;
        for _ in filter {
            sql.push_str(&format!(
                " AND (data ->> ${}) = ${}",
                placeholder + 1,
                placeholder + 2
            ));
            placeholder += 2;
        }

        let mut query = sqlx::query_as::<_, DataRow>(&sql).bind(target);
        for (key, value) in filter {
            query = query.bind(key).bind(value);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Data::from).collect())
    }

    async fn retrieve_targets(&self) -> Result<Vec<String>> {
        let targets = sqlx::query_scalar::<_, String>(&format!(
            "SELECT DISTINCT target FROM {CANONICAL_ASSET_TABLE}"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(targets)
    }

    async fn retrieve_blocked(&self) -> Result<Vec<String>> {
        let blocked = sqlx::query_scalar::<_, String>("SELECT domain FROM blocked")
            .fetch_all(&self.pool)
            .await?;
        Ok(blocked)
    }

    async fn save(
        &self,
        table: &str,
        pipe: &str,
        id: &str,
        data: &Data,
        mut result: Map<String, Value>,
    ) -> Result<bool> {
        // a non-empty rendered asset wins over the input row's asset
        let mut asset = data.asset.as_str();
        if let Some(Value::String(rendered)) = result.get("asset") {
            if !rendered.is_empty() {
                asset = rendered;
            }
        }
        let asset = asset.to_string();
        result.remove("asset");

        let sql = format!(
            "INSERT INTO {table} (id, asset, target, pipe, data) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING"
        );

        let outcome = sqlx::query(&sql)
            .bind(id)
            .bind(&asset)
            .bind(&data.target)
            .bind(pipe)
            .bind(Value::Object(result))
            .execute(&self.pool)
            .await?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn save_alert(
        &self,
        pipe: &str,
        ident: &str,
        message: &str,
        alert_type: AlertType,
    ) -> Result<()> {
        sqlx::query("INSERT INTO alerts (type, pipe, ident, message) VALUES ($1, $2, $3, $4)")
            .bind(alert_type.as_str())
            .bind(pipe)
            .bind(ident)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
