//! SQLite 持久化。对外以 TokenStore / ChannelStore / UsageStore 三个
//! trait 暴露，DatabaseLogger 是默认实现；持久化属于外部协作方，
//! 引擎只在请求时读取当前状态并提交原子扣减。

mod tokens;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::channels::Channel;
use crate::config::ChannelKind;
use crate::error::{GatewayError, Result};

pub use tokens::{ApiToken, CreateTokenPayload, TokenStore};

pub const REQ_TYPE_CHAT: &str = "chat";
pub const REQ_TYPE_CHAT_STREAM: &str = "chat_stream";

/// 每次触达后端的请求产生一条，只追加不修改。
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub request_type: String,
    pub token_id: Option<String>,
    pub channel_id: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub quota_charged: Option<i64>,
    pub status_code: u16,
    pub response_time_ms: i64,
    pub finish_reason: Option<String>,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn log_usage(&self, record: UsageRecord) -> Result<i64>;
    async fn recent_usage(&self, limit: i32) -> Result<Vec<UsageRecord>>;
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// 以 name 为键写入通道配置。已有通道保留剩余额度，
    /// 除非额度上限发生变化（此时重置为新上限）。
    async fn upsert_channel(&self, channel: &Channel, enabled: bool) -> Result<()>;
    async fn load_channels(&self) -> Result<Vec<(Channel, i64, bool)>>;
    async fn set_channel_remaining(&self, channel_id: &str, remaining: i64) -> Result<()>;
}

#[derive(Clone)]
pub struct DatabaseLogger {
    connection: Arc<Mutex<Connection>>,
}

impl DatabaseLogger {
    pub async fn new(database_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(database_path).parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created database directory: {}", parent.display());
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Database initialized at: {}", database_path);

        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_tokens (
                id TEXT PRIMARY KEY,
                secret TEXT NOT NULL UNIQUE,
                owner TEXT,
                quota_limit INTEGER,
                quota_used INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                expires_at TEXT,
                created_at TEXT NOT NULL,
                last_used_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_key TEXT NOT NULL,
                models TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                quota_limit INTEGER,
                quota_remaining INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                model_dir TEXT,
                context_size INTEGER,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                request_type TEXT NOT NULL,
                token_id TEXT,
                channel_id TEXT,
                model TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                quota_charged INTEGER,
                status_code INTEGER NOT NULL,
                response_time_ms INTEGER NOT NULL,
                finish_reason TEXT,
                error_message TEXT
            )",
            [],
        )?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.connection
    }
}

fn join_models(models: &[String]) -> String {
    models.join(",")
}

fn split_models(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|x| !x.trim().is_empty())
        .map(|x| x.trim().to_string())
        .collect()
}

fn kind_to_str(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Hosted => "hosted",
        ChannelKind::Local => "local",
    }
}

fn kind_from_str(s: &str) -> Result<ChannelKind> {
    match s {
        "hosted" => Ok(ChannelKind::Hosted),
        "local" => Ok(ChannelKind::Local),
        other => Err(GatewayError::Config(format!(
            "unknown channel kind in database: {}",
            other
        ))),
    }
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl ChannelStore for DatabaseLogger {
    async fn upsert_channel(&self, channel: &Channel, enabled: bool) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO channels (
                id, name, kind, base_url, api_key, models, priority,
                quota_limit, quota_remaining, enabled, model_dir, context_size, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(name) DO UPDATE SET
                kind = excluded.kind,
                base_url = excluded.base_url,
                api_key = excluded.api_key,
                models = excluded.models,
                priority = excluded.priority,
                quota_remaining = CASE
                    WHEN excluded.quota_limit IS NOT channels.quota_limit
                        THEN COALESCE(excluded.quota_limit, 0)
                    ELSE channels.quota_remaining
                END,
                quota_limit = excluded.quota_limit,
                enabled = excluded.enabled,
                model_dir = excluded.model_dir,
                context_size = excluded.context_size,
                updated_at = excluded.updated_at",
            (
                &channel.id,
                &channel.name,
                kind_to_str(channel.kind),
                &channel.base_url,
                &channel.api_key,
                join_models(&channel.models),
                channel.priority,
                channel.quota_limit,
                channel.quota_limit.unwrap_or(0),
                enabled,
                &channel.model_dir,
                channel.context_size,
                Utc::now().to_rfc3339(),
            ),
        )?;
        Ok(())
    }

    async fn load_channels(&self) -> Result<Vec<(Channel, i64, bool)>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, base_url, api_key, models, priority,
                    quota_limit, quota_remaining, enabled, model_dir, context_size
             FROM channels
             ORDER BY priority, name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i32>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, bool>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<u32>>(11)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (
                id,
                name,
                kind,
                base_url,
                api_key,
                models,
                priority,
                quota_limit,
                quota_remaining,
                enabled,
                model_dir,
                context_size,
            ) = row?;
            out.push((
                Channel {
                    id,
                    name,
                    kind: kind_from_str(&kind)?,
                    base_url,
                    api_key,
                    models: split_models(&models),
                    priority,
                    quota_limit,
                    model_dir,
                    context_size,
                },
                quota_remaining,
                enabled,
            ));
        }
        Ok(out)
    }

    async fn set_channel_remaining(&self, channel_id: &str, remaining: i64) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE channels SET quota_remaining = ?2 WHERE id = ?1",
            (channel_id, remaining),
        )?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for DatabaseLogger {
    async fn log_usage(&self, record: UsageRecord) -> Result<i64> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO usage_log (
                timestamp, request_type, token_id, channel_id, model,
                prompt_tokens, completion_tokens, total_tokens, quota_charged,
                status_code, response_time_ms, finish_reason, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            (
                record.timestamp.to_rfc3339(),
                &record.request_type,
                &record.token_id,
                &record.channel_id,
                &record.model,
                record.prompt_tokens,
                record.completion_tokens,
                record.total_tokens,
                record.quota_charged,
                record.status_code,
                record.response_time_ms,
                &record.finish_reason,
                &record.error_message,
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn recent_usage(&self, limit: i32) -> Result<Vec<UsageRecord>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, request_type, token_id, channel_id, model,
                    prompt_tokens, completion_tokens, total_tokens, quota_charged,
                    status_code, response_time_ms, finish_reason, error_message
             FROM usage_log
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(UsageRecord {
                id: Some(row.get(0)?),
                timestamp: parse_timestamp(&row.get::<_, String>(1)?),
                request_type: row.get(2)?,
                token_id: row.get(3)?,
                channel_id: row.get(4)?,
                model: row.get(5)?,
                prompt_tokens: row.get(6)?,
                completion_tokens: row.get(7)?,
                total_tokens: row.get(8)?,
                quota_charged: row.get(9)?,
                status_code: row.get(10)?,
                response_time_ms: row.get(11)?,
                finish_reason: row.get(12)?,
                error_message: row.get(13)?,
            })
        })?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn channel(name: &str, quota: Option<i64>) -> Channel {
        Channel {
            id: format!("ch-{}", name),
            name: name.to_string(),
            kind: ChannelKind::Hosted,
            base_url: "http://localhost".into(),
            api_key: "sk-test".into(),
            models: vec!["m1".into(), "m2".into()],
            priority: 3,
            quota_limit: quota,
            model_dir: None,
            context_size: None,
        }
    }

    #[tokio::test]
    async fn channel_upsert_preserves_remaining_until_limit_changes() {
        let dir = tempdir().unwrap();
        let db = DatabaseLogger::new(dir.path().join("gw.db").to_str().unwrap())
            .await
            .unwrap();

        let c = channel("p1", Some(100));
        db.upsert_channel(&c, true).await.unwrap();
        db.set_channel_remaining(&c.id, 40).await.unwrap();

        // 同样的上限：剩余额度保留
        db.upsert_channel(&c, true).await.unwrap();
        let loaded = db.load_channels().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1, 40);
        assert_eq!(loaded[0].0.models, vec!["m1", "m2"]);

        // 上限变化：剩余额度重置
        let mut c2 = c.clone();
        c2.quota_limit = Some(500);
        db.upsert_channel(&c2, false).await.unwrap();
        let loaded = db.load_channels().await.unwrap();
        assert_eq!(loaded[0].1, 500);
        assert!(!loaded[0].2);
    }

    #[tokio::test]
    async fn usage_log_round_trip() {
        let dir = tempdir().unwrap();
        let db = DatabaseLogger::new(dir.path().join("gw.db").to_str().unwrap())
            .await
            .unwrap();

        let id = db
            .log_usage(UsageRecord {
                id: None,
                timestamp: Utc::now(),
                request_type: REQ_TYPE_CHAT.into(),
                token_id: Some("tok-1".into()),
                channel_id: Some("ch-1".into()),
                model: Some("m1".into()),
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
                total_tokens: Some(15),
                quota_charged: Some(15),
                status_code: 200,
                response_time_ms: 12,
                finish_reason: Some("stop".into()),
                error_message: None,
            })
            .await
            .unwrap();
        assert!(id > 0);

        let records = db.recent_usage(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].quota_charged, Some(15));
        assert_eq!(records[0].finish_reason.as_deref(), Some("stop"));
    }
}
