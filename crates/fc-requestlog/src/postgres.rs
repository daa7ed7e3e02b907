//! PostgreSQL-backed `RequestLogStore`, with cross-instance fan-out via
//! `LISTEN`/`NOTIFY`, matching the donor's `PostgresOutboxRepository`'s
//! one-table-per-concern, dynamic-WHERE style.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fc_common::{RequestLog, RequestLogStatus};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::debug_log::DebugLogEntry;
use crate::error::Result;
use crate::sse::{LogEvent, LogEventBroadcaster};
use crate::store::{bucket_width_for_window, excluded_from_totals, HistoryBucket, RequestLogFilter, RequestLogStats, RequestLogStore};

const NOTIFY_CHANNEL: &str = "request_log_events";
const LISTEN_READ_DELAY: Duration = Duration::from_millis(10);
const LISTEN_PING_INTERVAL: Duration = Duration::from_secs(90);

pub struct PostgresRequestLogStore {
    pool: PgPool,
    broadcaster: Arc<LogEventBroadcaster>,
}

impl PostgresRequestLogStore {
    pub async fn connect(database_url: &str, max_subscribers: usize) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Self::init_schema(&pool).await?;
        Ok(Self {
            pool,
            broadcaster: Arc::new(LogEventBroadcaster::new(max_subscribers)),
        })
    }

    async fn init_schema(pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_log (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                initial_time TIMESTAMPTZ NOT NULL,
                complete_time TIMESTAMPTZ,
                duration_ms BIGINT,
                input_tokens BIGINT,
                output_tokens BIGINT,
                cache_creation_tokens BIGINT,
                cache_read_tokens BIGINT,
                total_tokens BIGINT,
                input_cost DOUBLE PRECISION,
                output_cost DOUBLE PRECISION,
                total_cost DOUBLE PRECISION,
                channel_id BIGINT,
                channel_uid TEXT,
                channel_name TEXT,
                endpoint TEXT NOT NULL,
                client_id TEXT,
                session_id TEXT,
                api_key_id BIGINT,
                failover_info TEXT,
                error TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_log_time ON request_log (initial_time)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_log_status ON request_log (status)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_log_endpoint ON request_log (endpoint)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_debug_log (
                request_id TEXT PRIMARY KEY,
                request_headers JSONB NOT NULL,
                request_body BYTEA NOT NULL,
                response_headers JSONB NOT NULL,
                response_body BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Spawns the per-instance `LISTEN` task that re-broadcasts sibling
    /// writes to this process's own SSE subscribers.
    pub fn spawn_listener(self: &Arc<Self>, shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
        let pool = self.pool.clone();
        let store = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(l) => l,
                Err(err) => {
                    error!(%err, "failed to establish request_log LISTEN connection");
                    return;
                }
            };
            if let Err(err) = listener.listen(NOTIFY_CHANNEL).await {
                error!(%err, "failed to LISTEN on request_log_events");
                return;
            }

            loop {
                tokio::select! {
                    notification = listener.recv() => {
                        match notification {
                            Ok(notification) => {
                                tokio::time::sleep(LISTEN_READ_DELAY).await;
                                if let Err(err) = store.handle_notification(notification.payload()).await {
                                    error!(%err, "failed to handle request_log notification");
                                }
                            }
                            Err(err) => {
                                error!(%err, "request_log LISTEN connection dropped");
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep(LISTEN_PING_INTERVAL) => {
                        debug!("request_log LISTEN ping");
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    async fn handle_notification(&self, payload: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(payload)?;
        let kind = value.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        let id = value.get("id").and_then(|v| v.as_str()).unwrap_or("");
        if id.is_empty() {
            return Ok(());
        }

        let Some(row) = sqlx::query(SELECT_COLUMNS).bind(id).fetch_optional(&self.pool).await? else {
            return Ok(());
        };
        let log = parse_row(&row)?;

        match kind {
            "created" => self.broadcaster.publish(LogEvent::Created(log)),
            "updated" => self.broadcaster.publish(LogEvent::Updated(log)),
            _ => {}
        }
        Ok(())
    }

    fn build_where(filter: &RequestLogFilter) -> (String, Vec<Box<dyn SqlBind>>) {
        let mut clauses = Vec::new();
        let mut binds: Vec<Box<dyn SqlBind>> = Vec::new();

        if let Some(since) = filter.since {
            clauses.push(format!("initial_time >= ${}", binds.len() + 1));
            binds.push(Box::new(since));
        }
        if let Some(until) = filter.until {
            clauses.push(format!("initial_time <= ${}", binds.len() + 1));
            binds.push(Box::new(until));
        }
        if let Some(endpoint) = &filter.endpoint {
            clauses.push(format!("endpoint = ${}", binds.len() + 1));
            binds.push(Box::new(endpoint.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push(format!("status = ${}", binds.len() + 1));
            binds.push(Box::new(status_to_str(status).to_string()));
        }
        if let Some(channel_name) = &filter.channel_name {
            clauses.push(format!("channel_name = ${}", binds.len() + 1));
            binds.push(Box::new(channel_name.clone()));
        }
        if let Some(client_id) = &filter.client_id {
            clauses.push(format!("client_id = ${}", binds.len() + 1));
            binds.push(Box::new(client_id.clone()));
        }
        if let Some(session_id) = &filter.session_id {
            clauses.push(format!("session_id = ${}", binds.len() + 1));
            binds.push(Box::new(session_id.clone()));
        }

        let where_clause = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
        (where_clause, binds)
    }
}

// A tiny type-erased bind helper so `build_where` can return a homogeneous
// Vec despite sqlx's bind types differing per Rust type.
trait SqlBind: Send + Sync {
    fn bind_to<'q>(
        self: Box<Self>,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;
}

impl SqlBind for String {
    fn bind_to<'q>(
        self: Box<Self>,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        query.bind(*self)
    }
}

impl SqlBind for DateTime<Utc> {
    fn bind_to<'q>(
        self: Box<Self>,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        query.bind(*self)
    }
}

const SELECT_COLUMNS: &str = "SELECT id, status, initial_time, complete_time, duration_ms, input_tokens, \
     output_tokens, cache_creation_tokens, cache_read_tokens, total_tokens, input_cost, output_cost, \
     total_cost, channel_id, channel_uid, channel_name, endpoint, client_id, session_id, api_key_id, \
     failover_info, error FROM request_log WHERE id = $1";

fn status_to_str(status: RequestLogStatus) -> &'static str {
    match status {
        RequestLogStatus::Pending => "pending",
        RequestLogStatus::Completed => "completed",
        RequestLogStatus::Error => "error",
        RequestLogStatus::Timeout => "timeout",
        RequestLogStatus::Failover => "failover",
        RequestLogStatus::RetryWait => "retry_wait",
    }
}

fn status_from_str(s: &str) -> RequestLogStatus {
    match s {
        "completed" => RequestLogStatus::Completed,
        "error" => RequestLogStatus::Error,
        "timeout" => RequestLogStatus::Timeout,
        "failover" => RequestLogStatus::Failover,
        "retry_wait" => RequestLogStatus::RetryWait,
        _ => RequestLogStatus::Pending,
    }
}

fn parse_row(row: &sqlx::postgres::PgRow) -> Result<RequestLog> {
    let channel_id: Option<i64> = row.try_get("channel_id").ok().flatten();
    Ok(RequestLog {
        id: row.get("id"),
        status: status_from_str(row.get::<String, _>("status").as_str()),
        initial_time: row.get("initial_time"),
        complete_time: row.try_get("complete_time").ok(),
        duration_ms: row.try_get::<Option<i64>, _>("duration_ms").ok().flatten().map(|v| v as u64),
        input_tokens: row.try_get::<Option<i64>, _>("input_tokens").ok().flatten().map(|v| v as u64),
        output_tokens: row.try_get::<Option<i64>, _>("output_tokens").ok().flatten().map(|v| v as u64),
        cache_creation_tokens: row.try_get::<Option<i64>, _>("cache_creation_tokens").ok().flatten().map(|v| v as u64),
        cache_read_tokens: row.try_get::<Option<i64>, _>("cache_read_tokens").ok().flatten().map(|v| v as u64),
        total_tokens: row.try_get::<Option<i64>, _>("total_tokens").ok().flatten().map(|v| v as u64),
        input_cost: row.try_get("input_cost").ok().flatten(),
        output_cost: row.try_get("output_cost").ok().flatten(),
        total_cost: row.try_get("total_cost").ok().flatten(),
        channel_id: channel_id.map(|v| v as usize),
        channel_uid: row.try_get("channel_uid").ok().flatten(),
        channel_name: row.try_get("channel_name").ok().flatten(),
        endpoint: row.get("endpoint"),
        client_id: row.try_get("client_id").ok().flatten(),
        session_id: row.try_get("session_id").ok().flatten(),
        api_key_id: row.try_get("api_key_id").ok().flatten(),
        failover_info: row.try_get("failover_info").ok().flatten(),
        error: row.try_get("error").ok().flatten(),
    })
}

#[async_trait]
impl RequestLogStore for PostgresRequestLogStore {
    async fn add(&self, mut log: RequestLog) -> Result<RequestLog> {
        if log.id.is_empty() {
            log.id = fc_common::generate_request_log_id();
        }
        log.total_tokens = match (log.input_tokens, log.output_tokens) {
            (Some(i), Some(o)) => Some(i + o),
            _ => log.total_tokens,
        };

        sqlx::query(
            "INSERT INTO request_log (id, status, initial_time, complete_time, duration_ms, input_tokens, \
             output_tokens, cache_creation_tokens, cache_read_tokens, total_tokens, input_cost, output_cost, \
             total_cost, channel_id, channel_uid, channel_name, endpoint, client_id, session_id, api_key_id, \
             failover_info, error) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22)",
        )
        .bind(&log.id)
        .bind(status_to_str(log.status))
        .bind(log.initial_time)
        .bind(log.complete_time)
        .bind(log.duration_ms.map(|v| v as i64))
        .bind(log.input_tokens.map(|v| v as i64))
        .bind(log.output_tokens.map(|v| v as i64))
        .bind(log.cache_creation_tokens.map(|v| v as i64))
        .bind(log.cache_read_tokens.map(|v| v as i64))
        .bind(log.total_tokens.map(|v| v as i64))
        .bind(log.input_cost)
        .bind(log.output_cost)
        .bind(log.total_cost)
        .bind(log.channel_id.map(|v| v as i64))
        .bind(&log.channel_uid)
        .bind(&log.channel_name)
        .bind(&log.endpoint)
        .bind(&log.client_id)
        .bind(&log.session_id)
        .bind(log.api_key_id)
        .bind(&log.failover_info)
        .bind(&log.error)
        .execute(&self.pool)
        .await?;

        let payload = serde_json::json!({"kind": "created", "id": log.id}).to_string();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        self.broadcaster.publish(LogEvent::Created(log.clone()));

        Ok(log)
    }

    async fn update(&self, id: &str, log: RequestLog) -> Result<()> {
        sqlx::query(
            "UPDATE request_log SET status = $1, complete_time = $2, duration_ms = $3, input_tokens = $4, \
             output_tokens = $5, cache_creation_tokens = $6, cache_read_tokens = $7, total_tokens = $8, \
             input_cost = $9, output_cost = $10, total_cost = $11, failover_info = $12, error = $13 \
             WHERE id = $14",
        )
        .bind(status_to_str(log.status))
        .bind(log.complete_time)
        .bind(log.duration_ms.map(|v| v as i64))
        .bind(log.input_tokens.map(|v| v as i64))
        .bind(log.output_tokens.map(|v| v as i64))
        .bind(log.cache_creation_tokens.map(|v| v as i64))
        .bind(log.cache_read_tokens.map(|v| v as i64))
        .bind(log.total_tokens.map(|v| v as i64))
        .bind(log.input_cost)
        .bind(log.output_cost)
        .bind(log.total_cost)
        .bind(&log.failover_info)
        .bind(&log.error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let payload = serde_json::json!({"kind": "updated", "id": id}).to_string();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        self.broadcaster.publish(LogEvent::Updated(log));

        Ok(())
    }

    async fn get_recent(&self, filter: RequestLogFilter) -> Result<Vec<RequestLog>> {
        let (where_clause, binds) = Self::build_where(&filter);
        let limit_placeholder = binds.len() + 1;
        let sql = format!(
            "SELECT id, status, initial_time, complete_time, duration_ms, input_tokens, output_tokens, \
             cache_creation_tokens, cache_read_tokens, total_tokens, input_cost, output_cost, total_cost, \
             channel_id, channel_uid, channel_name, endpoint, client_id, session_id, api_key_id, \
             failover_info, error FROM request_log {where_clause} \
             ORDER BY initial_time DESC LIMIT ${limit_placeholder}"
        );

        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = bind.bind_to(query);
        }
        query = query.bind(filter.effective_limit() as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(parse_row).collect()
    }

    async fn get_stats(&self, filter: RequestLogFilter) -> Result<RequestLogStats> {
        let logs = self.get_recent(RequestLogFilter { limit: Some(MAX_STATS_SAMPLE), ..filter }).await?;

        let mut stats = RequestLogStats::default();
        let mut durations: Vec<u64> = Vec::new();
        let window = chrono::Duration::hours(1);
        let bucket_width = bucket_width_for_window(window);
        let mut buckets: std::collections::BTreeMap<DateTime<Utc>, Vec<u64>> = std::collections::BTreeMap::new();

        for log in &logs {
            if excluded_from_totals(log.status) {
                continue;
            }
            stats.total_requests += 1;
            if matches!(log.status, RequestLogStatus::Completed) {
                stats.successful_requests += 1;
            } else {
                stats.failed_requests += 1;
            }
            stats.total_input_tokens += log.input_tokens.unwrap_or(0);
            stats.total_output_tokens += log.output_tokens.unwrap_or(0);
            stats.total_cost += log.total_cost.unwrap_or(0.0);

            if let Some(duration) = log.duration_ms {
                durations.push(duration);
                let bucket_start = bucket_floor(log.initial_time, bucket_width);
                buckets.entry(bucket_start).or_default().push(duration);
            }
        }

        stats.history = buckets
            .into_iter()
            .map(|(bucket_start, mut values)| {
                values.sort_unstable();
                HistoryBucket {
                    bucket_start,
                    count: values.len() as u64,
                    p50_latency_ms: percentile(&values, 0.50),
                    p95_latency_ms: percentile(&values, 0.95),
                    avg_latency_ms: if values.is_empty() {
                        None
                    } else {
                        Some(values.iter().sum::<u64>() as f64 / values.len() as f64)
                    },
                }
            })
            .collect();

        Ok(stats)
    }

    async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);
        let result = sqlx::query("DELETE FROM request_log WHERE initial_time < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_stale_pending(&self, older_than_seconds: u64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than_seconds as i64);
        let result = sqlx::query(
            "UPDATE request_log SET status = 'timeout', error = 'request timed out' \
             WHERE status = 'pending' AND initial_time < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_debug_log(&self, entry: DebugLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO request_debug_log (request_id, request_headers, request_body, response_headers, \
             response_body, created_at) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (request_id) DO UPDATE SET \
             request_headers = EXCLUDED.request_headers, request_body = EXCLUDED.request_body, \
             response_headers = EXCLUDED.response_headers, response_body = EXCLUDED.response_body",
        )
        .bind(&entry.request_id)
        .bind(serde_json::to_value(&entry.request_headers)?)
        .bind(&entry.request_body)
        .bind(serde_json::to_value(&entry.response_headers)?)
        .bind(&entry.response_body)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_debug_log(&self, request_id: &str) -> Result<Option<DebugLogEntry>> {
        let row = sqlx::query(
            "SELECT request_id, request_headers, request_body, response_headers, response_body, created_at \
             FROM request_debug_log WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let request_headers: serde_json::Value = row.get("request_headers");
        let response_headers: serde_json::Value = row.get("response_headers");
        Ok(Some(DebugLogEntry {
            request_id: row.get("request_id"),
            request_headers: serde_json::from_value(request_headers)?,
            request_body: row.get("request_body"),
            response_headers: serde_json::from_value(response_headers)?,
            response_body: row.get("response_body"),
            created_at: row.get("created_at"),
        }))
    }

    fn broadcaster(&self) -> &Arc<LogEventBroadcaster> {
        &self.broadcaster
    }
}

const MAX_STATS_SAMPLE: usize = 1000;

fn bucket_floor(at: DateTime<Utc>, width: chrono::Duration) -> DateTime<Utc> {
    let width_secs = width.num_seconds().max(1);
    let epoch_secs = at.timestamp();
    let floored = epoch_secs - epoch_secs.rem_euclid(width_secs);
    DateTime::from_timestamp(floored, 0).unwrap_or(at)
}

fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted.get(idx).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_floor_aligns_to_width() {
        let width = chrono::Duration::minutes(5);
        let at = DateTime::from_timestamp(1_700_000_137, 0).unwrap();
        let floored = bucket_floor(at, width);
        assert_eq!(floored.timestamp() % 300, 0);
    }

    #[test]
    fn percentile_picks_sorted_index() {
        let values = vec![10, 20, 30, 40, 50];
        assert_eq!(percentile(&values, 0.50), Some(30));
        assert_eq!(percentile(&values, 0.0), Some(10));
    }
}
