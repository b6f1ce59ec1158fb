//! SQLite document store
//!
//! A single `documents` table holds JSON bodies; filters and the sort key
//! are evaluated with `json_extract`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use super::{Filter, Mutation, Query, Store};
use crate::error::GatewayError;

pub struct SqliteStore {
    pool: SqlitePool,
}

enum Bind {
    Int(i64),
    Real(f64),
    Text(String),
}

impl SqliteStore {
    /// Open (creating if needed) the database at `database_url` and migrate it
    pub async fn connect(database_url: &str) -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatewayError::Store(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        // Shared in-memory databases cannot have two writers
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, GatewayError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| GatewayError::Store(format!("failed to run store migrations: {}", e)))?;

        tracing::info!("Document store migrations completed");
        Ok(Self { pool })
    }

    fn build_select(query: &Query) -> Result<(String, Vec<Bind>), GatewayError> {
        for field in query.fields() {
            validate_field(field)?;
        }

        let mut sql = String::from("SELECT body FROM documents WHERE collection = ?");
        let mut binds = Vec::new();

        for filter in &query.filters {
            match filter {
                Filter::Eq { field, value } => {
                    if value.is_null() {
                        sql.push_str(&format!(" AND json_extract(body, '$.{}') IS NULL", field));
                    } else {
                        sql.push_str(&format!(" AND json_extract(body, '$.{}') = ?", field));
                        binds.push(to_bind(value)?);
                    }
                }
                Filter::Range { field, min, max } => {
                    if let Some(min) = min {
                        sql.push_str(&format!(" AND json_extract(body, '$.{}') >= ?", field));
                        binds.push(to_bind(min)?);
                    }
                    if let Some(max) = max {
                        sql.push_str(&format!(" AND json_extract(body, '$.{}') <= ?", field));
                        binds.push(to_bind(max)?);
                    }
                }
            }
        }

        match &query.order_by {
            // Documents missing the key sort last
            Some(field) => sql.push_str(&format!(
                " ORDER BY json_extract(body, '$.{0}') IS NULL, json_extract(body, '$.{0}') ASC, id ASC",
                field
            )),
            None => sql.push_str(" ORDER BY id ASC"),
        }

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            binds.push(Bind::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        Ok((sql, binds))
    }

    async fn mutate_locked(
        conn: &mut SqliteConnection,
        collection: &str,
        id: &str,
        mutation: Mutation,
    ) -> Result<Value, GatewayError> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| GatewayError::Store(format!("{}/{} not found", collection, id)))?;

        let body: String = row.try_get("body")?;
        let mut doc: Value = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Store(format!("malformed {}/{}: {}", collection, id, e)))?;
        mutation(&mut doc)?;

        sqlx::query("UPDATE documents SET body = ?, updated_at = ? WHERE collection = ? AND id = ?")
            .bind(doc.to_string())
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(collection)
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(doc)
    }
}

fn validate_field(field: &str) -> Result<(), GatewayError> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest(format!("invalid query field: {}", field)))
    }
}

fn to_bind(value: &Value) -> Result<Bind, GatewayError> {
    match value {
        // json_extract yields 1/0 for JSON booleans
        Value::Bool(b) => Ok(Bind::Int(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Bind::Int(i)),
            None => Ok(Bind::Real(n.as_f64().unwrap_or(f64::NAN))),
        },
        Value::String(s) => Ok(Bind::Text(s.clone())),
        other => Err(GatewayError::InvalidRequest(format!(
            "unsupported filter value: {}",
            other
        ))),
    }
}

fn parse_body(row: &sqlx::sqlite::SqliteRow) -> Result<Value, GatewayError> {
    let body: String = row.try_get("body")?;
    serde_json::from_str(&body).map_err(|e| GatewayError::Store(format!("malformed document: {}", e)))
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, GatewayError> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(parse_body).transpose()
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Value>, GatewayError> {
        let (sql, binds) = Self::build_select(query)?;

        let mut statement = sqlx::query(&sql).bind(collection);
        for bind in binds {
            statement = match bind {
                Bind::Int(i) => statement.bind(i),
                Bind::Real(f) => statement.bind(f),
                Bind::Text(s) => statement.bind(s),
            };
        }

        let rows = statement.fetch_all(&self.pool).await?;
        rows.iter().map(parse_body).collect()
    }

    async fn put(&self, collection: &str, id: &str, value: &Value) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, body, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(value.to_string())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn run_atomic(
        &self,
        collection: &str,
        id: &str,
        mutation: Mutation,
    ) -> Result<Value, GatewayError> {
        // Detached so a dropped caller cannot leave the write lock held
        tokio::spawn(atomic_update(self.pool.clone(), collection.to_string(), id.to_string(), mutation))
            .await
            .map_err(|e| GatewayError::Store(format!("atomic mutation task failed: {}", e)))?
    }
}

async fn atomic_update(
    pool: SqlitePool,
    collection: String,
    id: String,
    mutation: Mutation,
) -> Result<Value, GatewayError> {
    // Rolled back on drop, including when COMMIT itself fails
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;
    let doc = SqliteStore::mutate_locked(&mut *tx, &collection, &id, mutation).await?;
    tx.commit().await?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    async fn memory_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::from_pool(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_overwrites_and_get_reads_back() {
        let store = memory_store().await;
        store.put("users", "u1", &json!({"balance": 1.5})).await.unwrap();
        store.put("users", "u1", &json!({"balance": 2.5})).await.unwrap();

        let doc = store.get_by_id("users", "u1").await.unwrap().unwrap();
        assert_eq!(doc["balance"], 2.5);
        assert!(store.get_by_id("users", "u2").await.unwrap().is_none());
        assert!(store.get_by_id("pricing_tiers", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_filters_sort_and_limit() {
        let store = memory_store().await;
        for (id, spend, active, custom) in [
            ("enterprise", 5000.0, true, true),
            ("pro", 100.0, true, false),
            ("starter", 0.0, true, false),
            ("legacy", 0.0, false, false),
        ] {
            store
                .put(
                    "pricing_tiers",
                    id,
                    &json!({"tier_id": id, "min_monthly_spend": spend, "is_active": active, "is_custom": custom}),
                )
                .await
                .unwrap();
        }

        let query = Query::new()
            .eq("is_active", true)
            .eq("is_custom", false)
            .order_by("min_monthly_spend")
            .limit(1);
        let docs = store.query("pricing_tiers", &query).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["tier_id"], "starter");

        let ranged = Query::new()
            .range("min_monthly_spend", Some(json!(50)), Some(json!(5000)))
            .order_by("min_monthly_spend");
        let docs = store.query("pricing_tiers", &ranged).await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d["tier_id"].as_str().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["pro", "enterprise"]);
    }

    #[tokio::test]
    async fn test_query_rejects_unsafe_field() {
        let store = memory_store().await;
        let query = Query::new().eq("x') OR 1=1 --", 1);
        assert!(matches!(
            store.query("users", &query).await,
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_run_atomic_commits_and_rolls_back() {
        let store = memory_store().await;
        store.put("users", "u1", &json!({"balance": 10.0})).await.unwrap();

        let doc = store
            .run_atomic(
                "users",
                "u1",
                Box::new(|doc| {
                    let balance = doc["balance"].as_f64().unwrap_or(0.0);
                    doc["balance"] = json!(balance - 25.0);
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(doc["balance"], -15.0);

        let failed = store
            .run_atomic(
                "users",
                "u1",
                Box::new(|doc| {
                    doc["balance"] = json!(0.0);
                    Err(GatewayError::Store("abort".into()))
                }),
            )
            .await;
        assert!(failed.is_err());
        let stored = store.get_by_id("users", "u1").await.unwrap().unwrap();
        assert_eq!(stored["balance"], -15.0);
    }

    #[tokio::test]
    async fn test_failed_mutations_release_the_connection() {
        // One pooled connection: a transaction left open would break the next write
        let store = memory_store().await;
        store.put("users", "u1", &json!({"balance": 1})).await.unwrap();

        let missing = store.run_atomic("users", "ghost", Box::new(|_| Ok(()))).await;
        assert!(matches!(missing, Err(GatewayError::Store(_))));
        let aborted = store
            .run_atomic("users", "u1", Box::new(|_| Err(GatewayError::Store("abort".into()))))
            .await;
        assert!(aborted.is_err());

        let doc = store
            .run_atomic("users", "u1", Box::new(|doc| {
                doc["balance"] = json!(2);
                Ok(())
            }))
            .await
            .unwrap();
        assert_eq!(doc["balance"], 2);
        store.put("users", "u2", &json!({"balance": 0})).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_atomic_adjustments_do_not_race() {
        let store = Arc::new(memory_store().await);
        store.put("users", "u1", &json!({"balance": 0})).await.unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .run_atomic(
                            "users",
                            "u1",
                            Box::new(|doc| {
                                let balance = doc["balance"].as_i64().unwrap_or(0);
                                doc["balance"] = json!(balance + 1);
                                Ok(())
                            }),
                        )
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = store.get_by_id("users", "u1").await.unwrap().unwrap();
        assert_eq!(stored["balance"], 20);
    }
}
