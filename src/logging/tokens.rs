use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::{DatabaseLogger, parse_timestamp};

/// 调用方凭证。引擎在每次请求时更新 quota_used 与 last_used_at，
/// 其余字段由外部管理面维护。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: String,
    pub secret: String,
    pub owner: Option<String>,
    /// None 表示不限额
    pub quota_limit: Option<i64>,
    pub quota_used: i64,
    pub enabled: bool,
    /// None 表示永不过期
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTokenPayload {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub quota_limit: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled_true")]
    pub enabled: bool,
}

// serde 的字段默认只作用于反序列化，Default 需要与之保持一致
impl Default for CreateTokenPayload {
    fn default() -> Self {
        Self {
            owner: None,
            quota_limit: None,
            expires_at: None,
            enabled: true,
        }
    }
}

fn default_enabled_true() -> bool {
    true
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn create_token(&self, payload: CreateTokenPayload) -> Result<ApiToken>;
    async fn get_token(&self, secret: &str) -> Result<Option<ApiToken>>;
    async fn touch_last_used(&self, secret: &str) -> Result<()>;
    async fn set_enabled(&self, secret: &str, enabled: bool) -> Result<bool>;
    /// 将一次请求的配额扣减同时落到令牌与通道两行上。
    /// 两个更新在同一事务内提交，崩溃时要么都生效要么都不生效。
    async fn settle_debit(&self, secret: &str, channel_id: &str, charge: i64) -> Result<()>;
    async fn list_tokens(&self) -> Result<Vec<ApiToken>>;
}

const TOKEN_COLUMNS: &str =
    "id, secret, owner, quota_limit, quota_used, enabled, expires_at, created_at, last_used_at";

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiToken> {
    Ok(ApiToken {
        id: row.get(0)?,
        secret: row.get(1)?,
        owner: row.get(2)?,
        quota_limit: row.get(3)?,
        quota_used: row.get(4)?,
        enabled: row.get(5)?,
        expires_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_timestamp(&s)),
        created_at: parse_timestamp(&row.get::<_, String>(7)?),
        last_used_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_timestamp(&s)),
    })
}

fn generate_secret() -> String {
    use rand::Rng;
    use rand::distr::Alphanumeric;
    let rng = rand::rng();
    let body: String = rng.sample_iter(&Alphanumeric).take(40).map(char::from).collect();
    format!("mg-{}", body)
}

#[async_trait]
impl TokenStore for DatabaseLogger {
    async fn create_token(&self, payload: CreateTokenPayload) -> Result<ApiToken> {
        // 始终生成随机密钥
        let secret = generate_secret();
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.connection().lock().await;
        conn.execute(
            "INSERT INTO api_tokens (
                id, secret, owner, quota_limit, quota_used, enabled, expires_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
            (
                &id,
                &secret,
                &payload.owner,
                payload.quota_limit,
                payload.enabled,
                payload.expires_at.map(|t| t.to_rfc3339()),
                now.to_rfc3339(),
            ),
        )?;

        Ok(ApiToken {
            id,
            secret,
            owner: payload.owner,
            quota_limit: payload.quota_limit,
            quota_used: 0,
            enabled: payload.enabled,
            expires_at: payload.expires_at,
            created_at: now,
            last_used_at: None,
        })
    }

    async fn get_token(&self, secret: &str) -> Result<Option<ApiToken>> {
        let conn = self.connection().lock().await;
        let token = conn
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE secret = ?1"),
                [secret],
                row_to_token,
            )
            .optional()?;
        Ok(token)
    }

    async fn touch_last_used(&self, secret: &str) -> Result<()> {
        let conn = self.connection().lock().await;
        conn.execute(
            "UPDATE api_tokens SET last_used_at = ?2 WHERE secret = ?1",
            (secret, Utc::now().to_rfc3339()),
        )?;
        Ok(())
    }

    async fn set_enabled(&self, secret: &str, enabled: bool) -> Result<bool> {
        let conn = self.connection().lock().await;
        let n = conn.execute(
            "UPDATE api_tokens SET enabled = ?2 WHERE secret = ?1",
            (secret, enabled),
        )?;
        Ok(n > 0)
    }

    async fn settle_debit(&self, secret: &str, channel_id: &str, charge: i64) -> Result<()> {
        let mut conn = self.connection().lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE api_tokens SET quota_used = quota_used + ?2 WHERE secret = ?1",
            (secret, charge),
        )?;
        tx.execute(
            "UPDATE channels SET quota_remaining = quota_remaining - ?2
             WHERE id = ?1 AND quota_limit IS NOT NULL",
            (channel_id, charge),
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn list_tokens(&self) -> Result<Vec<ApiToken>> {
        let conn = self.connection().lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM api_tokens ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], row_to_token)?;
        let mut tokens = Vec::new();
        for token in rows {
            tokens.push(token?);
        }
        Ok(tokens)
    }
}
