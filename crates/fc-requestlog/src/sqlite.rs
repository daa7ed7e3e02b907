//! SQLite-backed `RequestLogStore`, for single-instance deployments. No
//! cross-instance notification — SSE subscribers only ever see events
//! published by this process's own writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fc_common::{RequestLog, RequestLogStatus};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::sync::Arc;

use crate::debug_log::DebugLogEntry;
use crate::error::Result;
use crate::sse::{LogEvent, LogEventBroadcaster};
use crate::store::{bucket_width_for_window, excluded_from_totals, HistoryBucket, RequestLogFilter, RequestLogStats, RequestLogStore};

const MAX_STATS_SAMPLE: usize = 1000;

pub struct SqliteRequestLogStore {
    pool: SqlitePool,
    broadcaster: Arc<LogEventBroadcaster>,
}

impl SqliteRequestLogStore {
    pub async fn connect(database_url: &str, max_subscribers: usize) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        Self::init_schema(&pool).await?;
        Ok(Self {
            pool,
            broadcaster: Arc::new(LogEventBroadcaster::new(max_subscribers)),
        })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_log (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                initial_time TEXT NOT NULL,
                complete_time TEXT,
                duration_ms INTEGER,
                input_tokens INTEGER,
                output_tokens INTEGER,
                cache_creation_tokens INTEGER,
                cache_read_tokens INTEGER,
                total_tokens INTEGER,
                input_cost REAL,
                output_cost REAL,
                total_cost REAL,
                channel_id INTEGER,
                channel_uid TEXT,
                channel_name TEXT,
                endpoint TEXT NOT NULL,
                client_id TEXT,
                session_id TEXT,
                api_key_id INTEGER,
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

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_debug_log (
                request_id TEXT PRIMARY KEY,
                request_headers TEXT NOT NULL,
                request_body BLOB NOT NULL,
                response_headers TEXT NOT NULL,
                response_body BLOB NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

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

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<RequestLog> {
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
        channel_id: row.try_get::<Option<i64>, _>("channel_id").ok().flatten().map(|v| v as usize),
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

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a RequestLogFilter) {
    let mut first = true;
    let mut and_or_where = |builder: &mut QueryBuilder<'a, Sqlite>, first: &mut bool| {
        builder.push(if *first { " WHERE " } else { " AND " });
        *first = false;
    };

    if let Some(since) = &filter.since {
        and_or_where(builder, &mut first);
        builder.push("initial_time >= ").push_bind(since.to_rfc3339());
    }
    if let Some(until) = &filter.until {
        and_or_where(builder, &mut first);
        builder.push("initial_time <= ").push_bind(until.to_rfc3339());
    }
    if let Some(endpoint) = &filter.endpoint {
        and_or_where(builder, &mut first);
        builder.push("endpoint = ").push_bind(endpoint.as_str());
    }
    if let Some(status) = filter.status {
        and_or_where(builder, &mut first);
        builder.push("status = ").push_bind(status_to_str(status));
    }
    if let Some(channel_name) = &filter.channel_name {
        and_or_where(builder, &mut first);
        builder.push("channel_name = ").push_bind(channel_name.as_str());
    }
    if let Some(client_id) = &filter.client_id {
        and_or_where(builder, &mut first);
        builder.push("client_id = ").push_bind(client_id.as_str());
    }
    if let Some(session_id) = &filter.session_id {
        and_or_where(builder, &mut first);
        builder.push("session_id = ").push_bind(session_id.as_str());
    }
}

#[async_trait]
impl RequestLogStore for SqliteRequestLogStore {
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
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&log.id)
        .bind(status_to_str(log.status))
        .bind(log.initial_time.to_rfc3339())
        .bind(log.complete_time.map(|t| t.to_rfc3339()))
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

        self.broadcaster.publish(LogEvent::Created(log.clone()));
        Ok(log)
    }

    async fn update(&self, id: &str, log: RequestLog) -> Result<()> {
        sqlx::query(
            "UPDATE request_log SET status = ?, complete_time = ?, duration_ms = ?, input_tokens = ?, \
             output_tokens = ?, cache_creation_tokens = ?, cache_read_tokens = ?, total_tokens = ?, \
             input_cost = ?, output_cost = ?, total_cost = ?, failover_info = ?, error = ? WHERE id = ?",
        )
        .bind(status_to_str(log.status))
        .bind(log.complete_time.map(|t| t.to_rfc3339()))
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

        self.broadcaster.publish(LogEvent::Updated(log));
        Ok(())
    }

    async fn get_recent(&self, filter: RequestLogFilter) -> Result<Vec<RequestLog>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, status, initial_time, complete_time, duration_ms, input_tokens, output_tokens, \
             cache_creation_tokens, cache_read_tokens, total_tokens, input_cost, output_cost, total_cost, \
             channel_id, channel_uid, channel_name, endpoint, client_id, session_id, api_key_id, \
             failover_info, error FROM request_log",
        );
        push_filters(&mut builder, &filter);
        builder.push(" ORDER BY initial_time DESC LIMIT ").push_bind(filter.effective_limit() as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(parse_row).collect()
    }

    async fn get_stats(&self, filter: RequestLogFilter) -> Result<RequestLogStats> {
        let logs = self.get_recent(RequestLogFilter { limit: Some(MAX_STATS_SAMPLE), ..filter }).await?;

        let mut stats = RequestLogStats::default();
        let bucket_width = bucket_width_for_window(chrono::Duration::hours(1));
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
                let width_secs = bucket_width.num_seconds().max(1);
                let epoch = log.initial_time.timestamp();
                let floored = epoch - epoch.rem_euclid(width_secs);
                let bucket_start = DateTime::from_timestamp(floored, 0).unwrap_or(log.initial_time);
                buckets.entry(bucket_start).or_default().push(duration);
            }
        }

        stats.history = buckets
            .into_iter()
            .map(|(bucket_start, mut values)| {
                values.sort_unstable();
                let p = |pct: f64| {
                    let idx = ((values.len() as f64 - 1.0) * pct).round() as usize;
                    values.get(idx).copied()
                };
                HistoryBucket {
                    bucket_start,
                    count: values.len() as u64,
                    p50_latency_ms: p(0.50),
                    p95_latency_ms: p(0.95),
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
        let cutoff = (Utc::now() - chrono::Duration::days(older_than_days as i64)).to_rfc3339();
        let result = sqlx::query("DELETE FROM request_log WHERE initial_time < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_stale_pending(&self, older_than_seconds: u64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(older_than_seconds as i64)).to_rfc3339();
        let result = sqlx::query(
            "UPDATE request_log SET status = 'timeout', error = 'request timed out' \
             WHERE status = 'pending' AND initial_time < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_debug_log(&self, entry: DebugLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO request_debug_log (request_id, request_headers, request_body, response_headers, \
             response_body, created_at) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (request_id) DO UPDATE SET \
             request_headers = excluded.request_headers, request_body = excluded.request_body, \
             response_headers = excluded.response_headers, response_body = excluded.response_body",
        )
        .bind(&entry.request_id)
        .bind(serde_json::to_string(&entry.request_headers)?)
        .bind(&entry.request_body)
        .bind(serde_json::to_string(&entry.response_headers)?)
        .bind(&entry.response_body)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_debug_log(&self, request_id: &str) -> Result<Option<DebugLogEntry>> {
        let row = sqlx::query(
            "SELECT request_id, request_headers, request_body, response_headers, response_body, created_at \
             FROM request_debug_log WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let request_headers: String = row.get("request_headers");
        let response_headers: String = row.get("response_headers");
        let created_at: String = row.get("created_at");
        Ok(Some(DebugLogEntry {
            request_id: row.get("request_id"),
            request_headers: serde_json::from_str(&request_headers)?,
            request_body: row.get("request_body"),
            response_headers: serde_json::from_str(&response_headers)?,
            response_body: row.get("response_body"),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    fn broadcaster(&self) -> &Arc<LogEventBroadcaster> {
        &self.broadcaster
    }
}
