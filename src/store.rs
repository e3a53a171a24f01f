//! SQLite persistence: clients, enabled models, pricing, admin token,
//! billing cap, call logs and daily usage roll-ups.
//!
//! Call logs take the only asynchronous write path: `enqueue` is a
//! non-blocking send into a bounded channel drained by a single background
//! worker, which inserts the log row and both daily roll-ups in one
//! transaction. Overflow drops the record rather than stalling a request.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Row};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::config::ClientConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One completed (or failed) gateway call, as recorded by the request path.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub request_id: String,
    pub client_id: String,
    pub model: String,
    pub resolved_model_id: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub status_code: i64,
    pub error_message: String,
    pub request_content: String,
    pub response_content: String,
    pub is_stream: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogRow {
    pub request_id: String,
    pub client_id: String,
    pub model: String,
    pub resolved_model_id: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub status_code: i64,
    pub error_message: String,
    pub request_content: String,
    pub response_content: String,
    pub is_stream: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRow {
    pub client_id: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub request_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageByModelRow {
    pub client_id: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub request_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPricingRow {
    pub model_id: String,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingConfig {
    pub global_cost_limit_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsRuntimeConfig {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub default_model_id: String,
}

enum QueueCommand {
    Record(CallRecord),
    Shutdown,
}

pub struct Store {
    pool: SqlitePool,
    queue: mpsc::Sender<QueueCommand>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Store {
    pub async fn new(db_path: &str, queue_size: usize) -> Result<Store> {
        let queue_size = if queue_size == 0 { 10_000 } else { queue_size };

        let in_memory = db_path.contains(":memory:");
        if !in_memory {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Invalid(format!("create db dir: {err}")))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(|err| StoreError::Invalid(format!("invalid db path: {err}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .disable_statement_logging();

        // A pool against :memory: gives every connection its own database,
        // so in-memory stores (tests) are pinned to a single connection.
        let max_connections = if in_memory { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        ensure_schema(&pool).await?;

        let (queue, receiver) = mpsc::channel(queue_size);
        let worker = tokio::spawn(write_loop(pool.clone(), receiver));

        Ok(Store {
            pool,
            queue,
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }

    /// Non-blocking enqueue; false means the queue is full (or shut down)
    /// and the record was dropped.
    pub fn enqueue(&self, record: CallRecord) -> bool {
        self.queue.try_send(QueueCommand::Record(record)).is_ok()
    }

    /// Drain outstanding call records, stop the worker and release the pool.
    pub async fn close(&self) {
        let _ = self.queue.send(QueueCommand::Shutdown).await;
        let worker = self.worker.lock().expect("worker lock").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Seeds (first boot only)
    // ------------------------------------------------------------------

    pub async fn seed_clients_if_empty(&self, clients: &[ClientConfig]) -> Result<()> {
        if self.count_rows("admin_clients").await? > 0 {
            return Ok(());
        }
        for client in clients {
            self.upsert_client(client.clone()).await?;
        }
        Ok(())
    }

    pub async fn seed_aws_config_if_empty(&self, cfg: AwsRuntimeConfig) -> Result<()> {
        if self.count_rows("admin_aws_config").await? > 0 {
            return Ok(());
        }
        if cfg.region.trim().is_empty() {
            return Ok(());
        }
        self.upsert_aws_config(cfg).await
    }

    pub async fn seed_enabled_models_if_empty(&self, model_ids: &[String]) -> Result<()> {
        if self.count_rows("admin_enabled_models").await? > 0 {
            return Ok(());
        }
        self.replace_enabled_models(model_ids).await
    }

    pub async fn seed_admin_token_if_empty(&self, admin_token: &str) -> Result<()> {
        let admin_token = {
            let trimmed = admin_token.trim();
            if trimmed.is_empty() {
                "admin123"
            } else {
                trimmed
            }
        };
        if self.count_rows("admin_auth_config").await? > 0 {
            return Ok(());
        }
        self.upsert_admin_token(admin_token).await
    }

    // ------------------------------------------------------------------
    // AWS runtime config
    // ------------------------------------------------------------------

    pub async fn get_aws_config(&self) -> Result<Option<AwsRuntimeConfig>> {
        let row = sqlx::query(
            "SELECT region, access_key_id, secret_access_key, session_token, default_model_id \
             FROM admin_aws_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let mut cfg = AwsRuntimeConfig {
            region: row.try_get("region")?,
            access_key_id: row.try_get("access_key_id")?,
            secret_access_key: row.try_get("secret_access_key")?,
            session_token: row.try_get("session_token")?,
            default_model_id: row.try_get("default_model_id")?,
        };
        normalize_aws_runtime_config(&mut cfg);
        Ok(Some(cfg))
    }

    pub async fn upsert_aws_config(&self, mut cfg: AwsRuntimeConfig) -> Result<()> {
        normalize_aws_runtime_config(&mut cfg);
        if cfg.region.is_empty() {
            return Err(StoreError::Invalid("region is required".into()));
        }
        if cfg.access_key_id.is_empty() != cfg.secret_access_key.is_empty() {
            return Err(StoreError::Invalid(
                "access_key_id and secret_access_key must be set together".into(),
            ));
        }

        sqlx::query(
            "INSERT INTO admin_aws_config( \
               id, region, access_key_id, secret_access_key, session_token, default_model_id, updated_at \
             ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(id) DO UPDATE SET \
               region = excluded.region, \
               access_key_id = excluded.access_key_id, \
               secret_access_key = excluded.secret_access_key, \
               session_token = excluded.session_token, \
               default_model_id = excluded.default_model_id, \
               updated_at = excluded.updated_at",
        )
        .bind(&cfg.region)
        .bind(&cfg.access_key_id)
        .bind(&cfg.secret_access_key)
        .bind(&cfg.session_token)
        .bind(&cfg.default_model_id)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admin token & billing config
    // ------------------------------------------------------------------

    pub async fn get_admin_token(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT admin_token FROM admin_auth_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let token: String = row.try_get("admin_token")?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token))
    }

    pub async fn upsert_admin_token(&self, admin_token: &str) -> Result<()> {
        let admin_token = admin_token.trim();
        if admin_token.is_empty() {
            return Err(StoreError::Invalid("admin_token is required".into()));
        }
        sqlx::query(
            "INSERT INTO admin_auth_config(id, admin_token, updated_at) VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET \
               admin_token = excluded.admin_token, updated_at = excluded.updated_at",
        )
        .bind(admin_token)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_billing_config(&self) -> Result<Option<BillingConfig>> {
        let row = sqlx::query("SELECT global_cost_limit_usd FROM admin_billing_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let cfg = BillingConfig {
            global_cost_limit_usd: row.try_get("global_cost_limit_usd")?,
        };
        validate_billing_config(&cfg)?;
        Ok(Some(cfg))
    }

    pub async fn upsert_billing_config(&self, cfg: BillingConfig) -> Result<()> {
        validate_billing_config(&cfg)?;
        sqlx::query(
            "INSERT INTO admin_billing_config(id, global_cost_limit_usd, updated_at) \
             VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET \
               global_cost_limit_usd = excluded.global_cost_limit_usd, \
               updated_at = excluded.updated_at",
        )
        .bind(cfg.global_cost_limit_usd)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Enabled models & pricing
    // ------------------------------------------------------------------

    pub async fn list_enabled_models(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT model_id FROM admin_enabled_models ORDER BY model_id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let model_id: String = row.try_get("model_id")?;
            let model_id = model_id.trim().to_string();
            if model_id.is_empty() {
                continue;
            }
            out.push(model_id);
        }
        Ok(out)
    }

    pub async fn replace_enabled_models(&self, model_ids: &[String]) -> Result<()> {
        let model_ids = unique_non_empty(model_ids);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM admin_enabled_models")
            .execute(&mut *tx)
            .await?;
        let now = now_rfc3339();
        for model_id in &model_ids {
            sqlx::query("INSERT INTO admin_enabled_models(model_id, updated_at) VALUES (?1, ?2)")
                .bind(model_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_model_pricing(&self) -> Result<Vec<ModelPricingRow>> {
        let rows = sqlx::query(
            "SELECT model_id, input_price_per_1k, output_price_per_1k \
             FROM admin_model_pricing ORDER BY model_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut item = ModelPricingRow {
                model_id: row.try_get("model_id")?,
                input_price_per_1k: row.try_get("input_price_per_1k")?,
                output_price_per_1k: row.try_get("output_price_per_1k")?,
            };
            item.model_id = item.model_id.trim().to_string();
            if item.model_id.is_empty() {
                continue;
            }
            item.input_price_per_1k = item.input_price_per_1k.max(0.0);
            item.output_price_per_1k = item.output_price_per_1k.max(0.0);
            out.push(item);
        }
        Ok(out)
    }

    pub async fn replace_model_pricing(&self, pricing: &[ModelPricingRow]) -> Result<()> {
        let pricing = normalize_model_pricing(pricing)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM admin_model_pricing")
            .execute(&mut *tx)
            .await?;
        let now = now_rfc3339();
        for item in &pricing {
            sqlx::query(
                "INSERT INTO admin_model_pricing( \
                   model_id, input_price_per_1k, output_price_per_1k, updated_at \
                 ) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&item.model_id)
            .bind(item.input_price_per_1k)
            .bind(item.output_price_per_1k)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    pub async fn list_clients(&self) -> Result<Vec<ClientConfig>> {
        let rows = sqlx::query(
            "SELECT id, name, api_key, max_requests_per_minute, max_concurrent, \
                    allowed_models_json, is_disabled \
             FROM admin_clients ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let allowed_models_json: String = row.try_get("allowed_models_json")?;
            let disabled_flag: i64 = row.try_get("is_disabled")?;
            let mut client = ClientConfig {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                api_key: row.try_get("api_key")?,
                max_requests_per_minute: row.try_get("max_requests_per_minute")?,
                max_concurrent: row.try_get("max_concurrent")?,
                allowed_models: Vec::new(),
                disabled: disabled_flag == 1,
            };
            if !allowed_models_json.trim().is_empty() {
                client.allowed_models =
                    serde_json::from_str(&allowed_models_json).unwrap_or_default();
            }
            normalize_client_config(&mut client);
            out.push(client);
        }
        Ok(out)
    }

    pub async fn upsert_client(&self, mut client: ClientConfig) -> Result<()> {
        normalize_client_config(&mut client);
        if client.id.is_empty() {
            return Err(StoreError::Invalid("client id is required".into()));
        }
        if client.api_key.is_empty() {
            return Err(StoreError::Invalid("client api key is required".into()));
        }

        let allowed_models_json = if client.allowed_models.is_empty() {
            "[]".to_string()
        } else {
            serde_json::to_string(&client.allowed_models)
                .map_err(|err| StoreError::Invalid(err.to_string()))?
        };

        sqlx::query(
            "INSERT INTO admin_clients( \
               id, name, api_key, max_requests_per_minute, max_concurrent, \
               allowed_models_json, is_disabled, updated_at \
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO UPDATE SET \
               name = excluded.name, \
               api_key = excluded.api_key, \
               max_requests_per_minute = excluded.max_requests_per_minute, \
               max_concurrent = excluded.max_concurrent, \
               allowed_models_json = excluded.allowed_models_json, \
               is_disabled = excluded.is_disabled, \
               updated_at = excluded.updated_at",
        )
        .bind(&client.id)
        .bind(&client.name)
        .bind(&client.api_key)
        .bind(client.max_requests_per_minute)
        .bind(client.max_concurrent)
        .bind(&allowed_models_json)
        .bind(if client.disabled { 1i64 } else { 0i64 })
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_client(&self, client_id: &str) -> Result<()> {
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return Err(StoreError::Invalid("client_id is required".into()));
        }
        sqlx::query("DELETE FROM admin_clients WHERE id = ?1")
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Usage & call-log readers
    // ------------------------------------------------------------------

    pub async fn get_usage(
        &self,
        from_date: &str,
        to_date: &str,
        client_id: &str,
    ) -> Result<Vec<UsageRow>> {
        let mut sql = String::from(
            "SELECT client_id, SUM(input_tokens) AS input_tokens, \
                    SUM(output_tokens) AS output_tokens, SUM(total_tokens) AS total_tokens, \
                    SUM(request_count) AS request_count \
             FROM usage_daily WHERE usage_date BETWEEN ?1 AND ?2 ",
        );
        if !client_id.is_empty() {
            sql.push_str("AND client_id = ?3 ");
        }
        sql.push_str("GROUP BY client_id ORDER BY SUM(total_tokens) DESC");

        let mut query = sqlx::query(&sql).bind(from_date).bind(to_date);
        if !client_id.is_empty() {
            query = query.bind(client_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(UsageRow {
                client_id: row.try_get("client_id")?,
                input_tokens: row.try_get("input_tokens")?,
                output_tokens: row.try_get("output_tokens")?,
                total_tokens: row.try_get("total_tokens")?,
                request_count: row.try_get("request_count")?,
            });
        }
        Ok(out)
    }

    pub async fn get_usage_by_model(
        &self,
        from_date: &str,
        to_date: &str,
        client_id: &str,
    ) -> Result<Vec<UsageByModelRow>> {
        let mut sql = String::from(
            "SELECT client_id, model, SUM(input_tokens) AS input_tokens, \
                    SUM(output_tokens) AS output_tokens, SUM(total_tokens) AS total_tokens, \
                    SUM(request_count) AS request_count \
             FROM usage_model_daily WHERE usage_date BETWEEN ?1 AND ?2 ",
        );
        if !client_id.is_empty() {
            sql.push_str("AND client_id = ?3 ");
        }
        sql.push_str("GROUP BY client_id, model ORDER BY SUM(total_tokens) DESC");

        let mut query = sqlx::query(&sql).bind(from_date).bind(to_date);
        if !client_id.is_empty() {
            query = query.bind(client_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(UsageByModelRow {
                client_id: row.try_get("client_id")?,
                model: row.try_get("model")?,
                input_tokens: row.try_get("input_tokens")?,
                output_tokens: row.try_get("output_tokens")?,
                total_tokens: row.try_get("total_tokens")?,
                request_count: row.try_get("request_count")?,
            });
        }
        Ok(out)
    }

    /// Total accumulated cost: Σ over usage_model_daily of token counts at
    /// current prices, with unknown models contributing zero.
    pub async fn get_total_cost(&self) -> Result<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM( \
               ( CAST(umd.input_tokens AS REAL) * COALESCE(mp.input_price_per_1k, 0) + \
                 CAST(umd.output_tokens AS REAL) * COALESCE(mp.output_price_per_1k, 0) \
               ) / 1000.0 \
             ), 0.0) AS total_cost \
             FROM usage_model_daily AS umd \
             LEFT JOIN admin_model_pricing AS mp ON mp.model_id = umd.model",
        )
        .fetch_one(&self.pool)
        .await?;

        let total_cost: f64 = row.try_get("total_cost")?;
        if total_cost.is_nan() || total_cost.is_infinite() || total_cost < 0.0 {
            return Ok(0.0);
        }
        Ok(total_cost)
    }

    pub async fn count_calls(&self, client_id: &str) -> Result<i64> {
        let mut sql = String::from("SELECT COUNT(1) AS n FROM call_logs");
        if !client_id.is_empty() {
            sql.push_str(" WHERE client_id = ?1");
        }
        let mut query = sqlx::query(&sql);
        if !client_id.is_empty() {
            query = query.bind(client_id);
        }
        let row = query.fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("n")?;
        Ok(count.max(0))
    }

    pub async fn get_calls(
        &self,
        limit: i64,
        offset: i64,
        client_id: &str,
    ) -> Result<Vec<CallLogRow>> {
        let limit = if limit <= 0 { 100 } else { limit };
        let offset = offset.max(0);

        let mut sql = String::from(
            "SELECT request_id, client_id, model, resolved_model_id, input_tokens, \
                    output_tokens, total_tokens, latency_ms, status_code, error_message, \
                    request_content, response_content, is_stream, created_at \
             FROM call_logs ",
        );
        if !client_id.is_empty() {
            sql.push_str("WHERE client_id = ?3 ");
        }
        sql.push_str("ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2");

        let mut query = sqlx::query(&sql).bind(limit).bind(offset);
        if !client_id.is_empty() {
            query = query.bind(client_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let stream_flag: i64 = row.try_get("is_stream")?;
            out.push(CallLogRow {
                request_id: row.try_get("request_id")?,
                client_id: row.try_get("client_id")?,
                model: row.try_get("model")?,
                resolved_model_id: row.try_get("resolved_model_id")?,
                input_tokens: row.try_get("input_tokens")?,
                output_tokens: row.try_get("output_tokens")?,
                total_tokens: row.try_get("total_tokens")?,
                latency_ms: row.try_get("latency_ms")?,
                status_code: row.try_get("status_code")?,
                error_message: row.try_get("error_message")?,
                request_content: row.try_get("request_content")?,
                response_content: row.try_get("response_content")?,
                is_stream: stream_flag == 1,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn count_rows(&self, table: &str) -> Result<i64> {
        let row = sqlx::query(&format!("SELECT COUNT(1) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    #[cfg(test)]
    async fn insert_record_now(&self, record: &CallRecord) -> Result<()> {
        insert_record(&self.pool, record).await
    }
}

async fn write_loop(pool: SqlitePool, mut receiver: mpsc::Receiver<QueueCommand>) {
    while let Some(command) = receiver.recv().await {
        match command {
            QueueCommand::Record(record) => {
                if let Err(err) = insert_record(&pool, &record).await {
                    tracing::warn!(
                        request_id = %record.request_id,
                        error = %err,
                        "failed to persist call record"
                    );
                }
            }
            QueueCommand::Shutdown => {
                while let Ok(command) = receiver.try_recv() {
                    if let QueueCommand::Record(record) = command {
                        if let Err(err) = insert_record(&pool, &record).await {
                            tracing::warn!(
                                request_id = %record.request_id,
                                error = %err,
                                "failed to persist call record during drain"
                            );
                        }
                    }
                }
                break;
            }
        }
    }
}

/// Insert the call log row and update both daily roll-ups in one
/// transaction.
async fn insert_record(pool: &SqlitePool, record: &CallRecord) -> Result<()> {
    let model = {
        let model = record.model.trim();
        if model.is_empty() {
            "default"
        } else {
            model
        }
    };
    let created_at = format_rfc3339(record.created_at);
    let usage_date = format_usage_date(record.created_at);

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO call_logs( \
           request_id, client_id, model, resolved_model_id, input_tokens, output_tokens, \
           total_tokens, latency_ms, status_code, error_message, request_content, \
           response_content, is_stream, created_at \
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )
    .bind(&record.request_id)
    .bind(&record.client_id)
    .bind(model)
    .bind(&record.resolved_model_id)
    .bind(record.input_tokens)
    .bind(record.output_tokens)
    .bind(record.total_tokens)
    .bind(record.latency_ms)
    .bind(record.status_code)
    .bind(&record.error_message)
    .bind(&record.request_content)
    .bind(&record.response_content)
    .bind(if record.is_stream { 1i64 } else { 0i64 })
    .bind(&created_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO usage_daily( \
           client_id, usage_date, input_tokens, output_tokens, total_tokens, request_count, last_seen_at \
         ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6) \
         ON CONFLICT(client_id, usage_date) DO UPDATE SET \
           input_tokens = input_tokens + excluded.input_tokens, \
           output_tokens = output_tokens + excluded.output_tokens, \
           total_tokens = total_tokens + excluded.total_tokens, \
           request_count = request_count + 1, \
           last_seen_at = excluded.last_seen_at",
    )
    .bind(&record.client_id)
    .bind(&usage_date)
    .bind(record.input_tokens)
    .bind(record.output_tokens)
    .bind(record.total_tokens)
    .bind(&created_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO usage_model_daily( \
           client_id, model, usage_date, input_tokens, output_tokens, total_tokens, request_count, last_seen_at \
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7) \
         ON CONFLICT(client_id, model, usage_date) DO UPDATE SET \
           input_tokens = input_tokens + excluded.input_tokens, \
           output_tokens = output_tokens + excluded.output_tokens, \
           total_tokens = total_tokens + excluded.total_tokens, \
           request_count = request_count + 1, \
           last_seen_at = excluded.last_seen_at",
    )
    .bind(&record.client_id)
    .bind(model)
    .bind(&usage_date)
    .bind(record.input_tokens)
    .bind(record.output_tokens)
    .bind(record.total_tokens)
    .bind(&created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS call_logs ( \
           id INTEGER PRIMARY KEY AUTOINCREMENT, \
           request_id TEXT NOT NULL, \
           client_id TEXT NOT NULL, \
           model TEXT NOT NULL, \
           resolved_model_id TEXT NOT NULL, \
           input_tokens INTEGER NOT NULL DEFAULT 0, \
           output_tokens INTEGER NOT NULL DEFAULT 0, \
           total_tokens INTEGER NOT NULL DEFAULT 0, \
           latency_ms INTEGER NOT NULL DEFAULT 0, \
           status_code INTEGER NOT NULL DEFAULT 0, \
           error_message TEXT NOT NULL DEFAULT '', \
           request_content TEXT NOT NULL DEFAULT '', \
           response_content TEXT NOT NULL DEFAULT '', \
           is_stream INTEGER NOT NULL DEFAULT 0, \
           created_at TEXT NOT NULL \
         )",
        "CREATE INDEX IF NOT EXISTS idx_call_logs_client_created \
         ON call_logs(client_id, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_call_logs_created ON call_logs(created_at DESC)",
        "CREATE TABLE IF NOT EXISTS usage_daily ( \
           client_id TEXT NOT NULL, \
           usage_date TEXT NOT NULL, \
           input_tokens INTEGER NOT NULL DEFAULT 0, \
           output_tokens INTEGER NOT NULL DEFAULT 0, \
           total_tokens INTEGER NOT NULL DEFAULT 0, \
           request_count INTEGER NOT NULL DEFAULT 0, \
           last_seen_at TEXT NOT NULL, \
           PRIMARY KEY (client_id, usage_date) \
         )",
        "CREATE TABLE IF NOT EXISTS usage_model_daily ( \
           client_id TEXT NOT NULL, \
           model TEXT NOT NULL, \
           usage_date TEXT NOT NULL, \
           input_tokens INTEGER NOT NULL DEFAULT 0, \
           output_tokens INTEGER NOT NULL DEFAULT 0, \
           total_tokens INTEGER NOT NULL DEFAULT 0, \
           request_count INTEGER NOT NULL DEFAULT 0, \
           last_seen_at TEXT NOT NULL, \
           PRIMARY KEY (client_id, model, usage_date) \
         )",
        "CREATE INDEX IF NOT EXISTS idx_usage_model_daily_client_date \
         ON usage_model_daily(client_id, usage_date)",
        "CREATE TABLE IF NOT EXISTS admin_clients ( \
           id TEXT PRIMARY KEY, \
           name TEXT NOT NULL, \
           api_key TEXT NOT NULL UNIQUE, \
           max_requests_per_minute INTEGER NOT NULL, \
           max_concurrent INTEGER NOT NULL, \
           allowed_models_json TEXT NOT NULL DEFAULT '[]', \
           is_disabled INTEGER NOT NULL DEFAULT 0, \
           updated_at TEXT NOT NULL \
         )",
        "CREATE TABLE IF NOT EXISTS admin_aws_config ( \
           id INTEGER PRIMARY KEY CHECK (id = 1), \
           region TEXT NOT NULL, \
           access_key_id TEXT NOT NULL DEFAULT '', \
           secret_access_key TEXT NOT NULL DEFAULT '', \
           session_token TEXT NOT NULL DEFAULT '', \
           default_model_id TEXT NOT NULL DEFAULT '', \
           updated_at TEXT NOT NULL \
         )",
        "CREATE TABLE IF NOT EXISTS admin_enabled_models ( \
           model_id TEXT PRIMARY KEY, \
           updated_at TEXT NOT NULL \
         )",
        "CREATE TABLE IF NOT EXISTS admin_model_pricing ( \
           model_id TEXT PRIMARY KEY, \
           input_price_per_1k REAL NOT NULL DEFAULT 0, \
           output_price_per_1k REAL NOT NULL DEFAULT 0, \
           updated_at TEXT NOT NULL \
         )",
        "CREATE TABLE IF NOT EXISTS admin_auth_config ( \
           id INTEGER PRIMARY KEY CHECK (id = 1), \
           admin_token TEXT NOT NULL, \
           updated_at TEXT NOT NULL \
         )",
        "CREATE TABLE IF NOT EXISTS admin_billing_config ( \
           id INTEGER PRIMARY KEY CHECK (id = 1), \
           global_cost_limit_usd REAL NOT NULL DEFAULT 0, \
           updated_at TEXT NOT NULL \
         )",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    migrate_admin_client_columns(pool).await?;
    migrate_model_pricing_columns(pool).await?;
    Ok(())
}

/// Schema evolution is additive: new columns are added with defaults so old
/// databases keep working.
async fn migrate_admin_client_columns(pool: &SqlitePool) -> Result<()> {
    let columns = table_columns(pool, "admin_clients").await?;
    if !columns.contains(&"is_disabled".to_string()) {
        sqlx::query("ALTER TABLE admin_clients ADD COLUMN is_disabled INTEGER NOT NULL DEFAULT 0")
            .execute(pool)
            .await?;
    }
    Ok(())
}

async fn migrate_model_pricing_columns(pool: &SqlitePool) -> Result<()> {
    let columns = table_columns(pool, "admin_model_pricing").await?;

    if !columns.contains(&"input_price_per_1k".to_string()) {
        sqlx::query(
            "ALTER TABLE admin_model_pricing ADD COLUMN input_price_per_1k REAL NOT NULL DEFAULT 0",
        )
        .execute(pool)
        .await?;
    }
    if !columns.contains(&"output_price_per_1k".to_string()) {
        sqlx::query(
            "ALTER TABLE admin_model_pricing ADD COLUMN output_price_per_1k REAL NOT NULL DEFAULT 0",
        )
        .execute(pool)
        .await?;
    }

    // Legacy per-million columns backfill the per-1k values once.
    if columns.contains(&"input_price_per_million".to_string()) {
        sqlx::query(
            "UPDATE admin_model_pricing SET input_price_per_1k = \
               CASE WHEN input_price_per_1k <= 0 THEN input_price_per_million / 1000.0 \
                    ELSE input_price_per_1k END",
        )
        .execute(pool)
        .await?;
    }
    if columns.contains(&"output_price_per_million".to_string()) {
        sqlx::query(
            "UPDATE admin_model_pricing SET output_price_per_1k = \
               CASE WHEN output_price_per_1k <= 0 THEN output_price_per_million / 1000.0 \
                    ELSE output_price_per_1k END",
        )
        .execute(pool)
        .await?;
    }
    Ok(())
}

async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name")?;
        let name = name.trim().to_ascii_lowercase();
        if !name.is_empty() {
            columns.push(name);
        }
    }
    Ok(columns)
}

fn normalize_client_config(client: &mut ClientConfig) {
    client.id = client.id.trim().to_string();
    client.name = client.name.trim().to_string();
    client.api_key = client.api_key.trim().to_string();
    if client.name.is_empty() {
        client.name = client.id.clone();
    }
    if client.max_requests_per_minute <= 0 {
        client.max_requests_per_minute = 1200;
    }
    if client.max_concurrent <= 0 {
        client.max_concurrent = 64;
    }
    let models: Vec<String> = client
        .allowed_models
        .iter()
        .map(|model| model.trim().to_ascii_lowercase())
        .collect();
    client.allowed_models = unique_non_empty(&models);
}

fn normalize_aws_runtime_config(cfg: &mut AwsRuntimeConfig) {
    cfg.region = cfg.region.trim().to_string();
    cfg.access_key_id = cfg.access_key_id.trim().to_string();
    cfg.secret_access_key = cfg.secret_access_key.trim().to_string();
    cfg.session_token = cfg.session_token.trim().to_string();
    cfg.default_model_id = cfg.default_model_id.trim().to_string();
}

fn validate_billing_config(cfg: &BillingConfig) -> Result<()> {
    if cfg.global_cost_limit_usd.is_nan() || cfg.global_cost_limit_usd.is_infinite() {
        return Err(StoreError::Invalid("invalid global_cost_limit_usd".into()));
    }
    if cfg.global_cost_limit_usd < 0.0 {
        return Err(StoreError::Invalid(
            "global_cost_limit_usd must be >= 0".into(),
        ));
    }
    Ok(())
}

fn normalize_model_pricing(items: &[ModelPricingRow]) -> Result<Vec<ModelPricingRow>> {
    let mut by_model: std::collections::BTreeMap<String, ModelPricingRow> = Default::default();
    for item in items {
        let model_id = item.model_id.trim().to_string();
        if model_id.is_empty() {
            continue;
        }
        if item.input_price_per_1k.is_nan() || item.input_price_per_1k.is_infinite() {
            return Err(StoreError::Invalid(format!(
                "invalid input_price_per_1k for model {model_id:?}"
            )));
        }
        if item.output_price_per_1k.is_nan() || item.output_price_per_1k.is_infinite() {
            return Err(StoreError::Invalid(format!(
                "invalid output_price_per_1k for model {model_id:?}"
            )));
        }
        if item.input_price_per_1k < 0.0 {
            return Err(StoreError::Invalid(format!(
                "input_price_per_1k must be >= 0 for model {model_id:?}"
            )));
        }
        if item.output_price_per_1k < 0.0 {
            return Err(StoreError::Invalid(format!(
                "output_price_per_1k must be >= 0 for model {model_id:?}"
            )));
        }
        by_model.insert(
            model_id.clone(),
            ModelPricingRow {
                model_id,
                input_price_per_1k: item.input_price_per_1k,
                output_price_per_1k: item.output_price_per_1k,
            },
        );
    }
    Ok(by_model.into_values().collect())
}

fn unique_non_empty(items: &[String]) -> Vec<String> {
    let mut set: std::collections::BTreeSet<String> = Default::default();
    for item in items {
        let item = item.trim().to_string();
        if item.is_empty() {
            continue;
        }
        set.insert(item);
    }
    set.into_iter().collect()
}

fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

fn format_rfc3339(timestamp: OffsetDateTime) -> String {
    timestamp.format(&Rfc3339).unwrap_or_default()
}

fn format_usage_date(timestamp: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]");
    timestamp.format(&format).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::new(":memory:", 16).await.expect("store opens")
    }

    fn record(request_id: &str, client_id: &str, model: &str) -> CallRecord {
        CallRecord {
            request_id: request_id.into(),
            client_id: client_id.into(),
            model: model.into(),
            resolved_model_id: format!("us.{model}"),
            input_tokens: 100,
            output_tokens: 50,
            total_tokens: 150,
            latency_ms: 12,
            status_code: 200,
            error_message: String::new(),
            request_content: "user: hello".into(),
            response_content: "hi".into(),
            is_stream: false,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let store = memory_store().await;
        ensure_schema(&store.pool).await.expect("second run is fine");
        store.close().await;
    }

    #[tokio::test]
    async fn client_round_trip_with_defaults() {
        let store = memory_store().await;

        store
            .upsert_client(ClientConfig {
                id: " c1 ".into(),
                api_key: " sk-test ".into(),
                allowed_models: vec!["Model-A".into(), "model-a".into(), "".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let clients = store.list_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        let client = &clients[0];
        assert_eq!(client.id, "c1");
        assert_eq!(client.name, "c1");
        assert_eq!(client.api_key, "sk-test");
        assert_eq!(client.max_requests_per_minute, 1200);
        assert_eq!(client.max_concurrent, 64);
        assert_eq!(client.allowed_models, vec!["model-a".to_string()]);
        assert!(!client.disabled);

        store.delete_client("c1").await.unwrap();
        assert!(store.list_clients().await.unwrap().is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn call_record_updates_daily_rollups() {
        let store = memory_store().await;

        store
            .insert_record_now(&record("req-1", "c1", "claude"))
            .await
            .unwrap();
        store
            .insert_record_now(&record("req-2", "c1", "claude"))
            .await
            .unwrap();

        let usage = store
            .get_usage("1970-01-01", "9999-12-31", "")
            .await
            .unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].client_id, "c1");
        assert_eq!(usage[0].input_tokens, 200);
        assert_eq!(usage[0].request_count, 2);

        let by_model = store
            .get_usage_by_model("1970-01-01", "9999-12-31", "c1")
            .await
            .unwrap();
        assert_eq!(by_model.len(), 1);
        assert_eq!(by_model[0].model, "claude");
        assert_eq!(by_model[0].total_tokens, 300);

        let calls = store.get_calls(10, 0, "").await.unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(store.count_calls("c1").await.unwrap(), 2);
        assert_eq!(store.count_calls("other").await.unwrap(), 0);
        store.close().await;
    }

    #[tokio::test]
    async fn blank_model_is_logged_as_default() {
        let store = memory_store().await;
        store
            .insert_record_now(&record("req-1", "c1", "  "))
            .await
            .unwrap();
        let calls = store.get_calls(1, 0, "").await.unwrap();
        assert_eq!(calls[0].model, "default");
        store.close().await;
    }

    #[tokio::test]
    async fn total_cost_joins_pricing_and_normalizes() {
        let store = memory_store().await;
        assert_eq!(store.get_total_cost().await.unwrap(), 0.0);

        store
            .replace_model_pricing(&[ModelPricingRow {
                model_id: "claude".into(),
                input_price_per_1k: 3.0,
                output_price_per_1k: 15.0,
            }])
            .await
            .unwrap();
        store
            .insert_record_now(&record("req-1", "c1", "claude"))
            .await
            .unwrap();
        // Unpriced model contributes zero via the left join.
        store
            .insert_record_now(&record("req-2", "c1", "mystery"))
            .await
            .unwrap();

        let total = store.get_total_cost().await.unwrap();
        // 100 in * $3/1k + 50 out * $15/1k = 0.3 + 0.75.
        assert!((total - 1.05).abs() < 1e-9);
        store.close().await;
    }

    #[tokio::test]
    async fn queue_worker_persists_and_close_drains() {
        let store = memory_store().await;
        assert!(store.enqueue(record("req-1", "c1", "claude")));
        assert!(store.enqueue(record("req-2", "c1", "claude")));
        store.close().await;

        // The pool is closed, but before that the drain must have flushed
        // both records; reopen a view through a second store on the same
        // database is impossible for :memory:, so assert indirectly: close
        // returned without panicking and enqueue after close fails.
        assert!(!store.enqueue(record("req-3", "c1", "claude")));
    }

    #[tokio::test]
    async fn queue_overflow_drops_records() {
        let store = Store::new(":memory:", 1).await.unwrap();
        // Stall the worker by flooding more records than capacity; at least
        // one try_send must report a drop once the buffer is full.
        let mut results = Vec::new();
        for index in 0..64 {
            results.push(store.enqueue(record(&format!("req-{index}"), "c1", "m")));
        }
        assert!(results.iter().any(|ok| !ok), "bounded queue must drop on overflow");
        store.close().await;
    }

    #[tokio::test]
    async fn seeds_only_apply_to_empty_tables() {
        let store = memory_store().await;

        store.seed_admin_token_if_empty("").await.unwrap();
        assert_eq!(store.get_admin_token().await.unwrap().unwrap(), "admin123");
        store.seed_admin_token_if_empty("other").await.unwrap();
        assert_eq!(store.get_admin_token().await.unwrap().unwrap(), "admin123");

        let models = vec!["model-b".to_string(), "model-a".to_string()];
        store.seed_enabled_models_if_empty(&models).await.unwrap();
        assert_eq!(
            store.list_enabled_models().await.unwrap(),
            vec!["model-a".to_string(), "model-b".to_string()]
        );
        store
            .seed_enabled_models_if_empty(&vec!["model-c".to_string()])
            .await
            .unwrap();
        assert_eq!(store.list_enabled_models().await.unwrap().len(), 2);

        store
            .seed_aws_config_if_empty(AwsRuntimeConfig {
                region: "us-east-1".into(),
                default_model_id: "claude".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let cfg = store.get_aws_config().await.unwrap().unwrap();
        assert_eq!(cfg.region, "us-east-1");

        store.close().await;
    }

    #[tokio::test]
    async fn billing_config_round_trip_and_validation() {
        let store = memory_store().await;
        assert!(store.get_billing_config().await.unwrap().is_none());

        store
            .upsert_billing_config(BillingConfig {
                global_cost_limit_usd: 12.5,
            })
            .await
            .unwrap();
        let cfg = store.get_billing_config().await.unwrap().unwrap();
        assert_eq!(cfg.global_cost_limit_usd, 12.5);

        assert!(store
            .upsert_billing_config(BillingConfig {
                global_cost_limit_usd: -1.0,
            })
            .await
            .is_err());
        store.close().await;
    }

    #[tokio::test]
    async fn pricing_replacement_validates_and_sorts() {
        let store = memory_store().await;
        store
            .replace_model_pricing(&[
                ModelPricingRow {
                    model_id: "b-model".into(),
                    input_price_per_1k: 1.0,
                    output_price_per_1k: 2.0,
                },
                ModelPricingRow {
                    model_id: "a-model".into(),
                    input_price_per_1k: 3.0,
                    output_price_per_1k: 4.0,
                },
            ])
            .await
            .unwrap();
        let pricing = store.list_model_pricing().await.unwrap();
        assert_eq!(pricing.len(), 2);
        assert_eq!(pricing[0].model_id, "a-model");

        assert!(store
            .replace_model_pricing(&[ModelPricingRow {
                model_id: "bad".into(),
                input_price_per_1k: f64::NAN,
                output_price_per_1k: 0.0,
            }])
            .await
            .is_err());
        store.close().await;
    }
}
