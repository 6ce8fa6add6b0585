//! 配额账本：后端调用前的准入检查，调用后的按量扣减。

use std::sync::Arc;

use chrono::Utc;

use crate::channels::ChannelEntry;
use crate::config::PricingConfig;
use crate::error::{GatewayError, Result};
use crate::logging::{ApiToken, TokenStore};

/// 定价策略：(model, prompt_tokens, completion_tokens) -> 配额扣减量。
/// 具体费率属于外部策略，这里只保证按量、可替换。
pub type PricingPolicy = Arc<dyn Fn(&str, u32, u32) -> i64 + Send + Sync>;

pub fn weighted_pricing(config: &PricingConfig) -> PricingPolicy {
    let prompt_weight = config.prompt_weight;
    let completion_weight = config.completion_weight;
    Arc::new(move |_model, prompt, completion| {
        prompt as i64 * prompt_weight + completion as i64 * completion_weight
    })
}

/// 通过准入检查的请求凭据，持有检查时刻的令牌快照。
#[derive(Debug, Clone)]
pub struct Admission {
    pub token: ApiToken,
}

pub struct QuotaLedger {
    store: Arc<dyn TokenStore>,
    pricing: PricingPolicy,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn TokenStore>, pricing: PricingPolicy) -> Self {
        Self { store, pricing }
    }

    /// 在触达任何后端之前调用。禁用、过期、额度用尽的令牌在这里拒绝。
    pub async fn reserve(&self, secret: &str) -> Result<Admission> {
        let token = self
            .store
            .get_token(secret)
            .await?
            .ok_or_else(|| GatewayError::UnauthorizedCaller("invalid token".into()))?;

        if !token.enabled {
            return Err(GatewayError::UnauthorizedCaller("token disabled".into()));
        }
        if let Some(expires_at) = token.expires_at
            && Utc::now() > expires_at
        {
            return Err(GatewayError::UnauthorizedCaller("token expired".into()));
        }
        if let Some(limit) = token.quota_limit
            && token.quota_used >= limit
        {
            return Err(GatewayError::QuotaExhausted(format!(
                "token quota used {} of {}",
                token.quota_used, limit
            )));
        }

        if let Err(e) = self.store.touch_last_used(secret).await {
            tracing::warn!("Failed to touch token last_used_at: {}", e);
        }

        Ok(Admission { token })
    }

    /// 请求结束后调用（成功或已消耗后端算力的失败）。
    /// 令牌与通道的持久化扣减在一个事务里提交；内存中的通道余额
    /// 随后原子更新，供选择器立即看到。
    pub async fn settle(
        &self,
        admission: &Admission,
        channel: &ChannelEntry,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<i64> {
        let charge = (self.pricing)(model, prompt_tokens, completion_tokens);
        self.store
            .settle_debit(&admission.token.secret, &channel.channel.id, charge)
            .await?;
        channel.debit(charge);
        Ok(charge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channel;
    use crate::config::ChannelKind;
    use crate::logging::{ChannelStore, CreateTokenPayload, DatabaseLogger};
    use chrono::Duration;
    use tempfile::tempdir;

    fn test_channel(quota: Option<i64>) -> ChannelEntry {
        ChannelEntry::new(
            Channel {
                id: "ch-1".into(),
                name: "p1".into(),
                kind: ChannelKind::Hosted,
                base_url: "http://localhost".into(),
                api_key: "k".into(),
                models: vec!["m1".into()],
                priority: 0,
                quota_limit: quota,
                model_dir: None,
                context_size: None,
            },
            quota.unwrap_or(0),
            true,
        )
    }

    async fn ledger() -> (tempfile::TempDir, Arc<DatabaseLogger>, QuotaLedger) {
        let dir = tempdir().unwrap();
        let db = Arc::new(
            DatabaseLogger::new(dir.path().join("gw.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let ledger = QuotaLedger::new(
            db.clone(),
            weighted_pricing(&PricingConfig::default()),
        );
        (dir, db, ledger)
    }

    #[tokio::test]
    async fn rejects_unknown_disabled_and_expired_tokens() {
        let (_dir, db, ledger) = ledger().await;

        let err = ledger.reserve("mg-nope").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnauthorizedCaller(_)));

        let disabled = db
            .create_token(CreateTokenPayload {
                enabled: false,
                ..Default::default()
            })
            .await
            .unwrap();
        let err = ledger.reserve(&disabled.secret).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnauthorizedCaller(_)));

        let expired = db
            .create_token(CreateTokenPayload {
                expires_at: Some(Utc::now() - Duration::hours(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = ledger.reserve(&expired.secret).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnauthorizedCaller(_)));
    }

    #[tokio::test]
    async fn quota_scenario_30_then_80_is_rejected() {
        let (_dir, db, ledger) = ledger().await;
        let channel = test_channel(None);
        db.upsert_channel(&channel.channel, true).await.unwrap();
        let token = db
            .create_token(CreateTokenPayload {
                quota_limit: Some(100),
                ..Default::default()
            })
            .await
            .unwrap();

        // 第一次请求消耗 30
        let admission = ledger.reserve(&token.secret).await.unwrap();
        let charge = ledger
            .settle(&admission, &channel, "m1", 10, 20)
            .await
            .unwrap();
        assert_eq!(charge, 30);
        let after = db.get_token(&token.secret).await.unwrap().unwrap();
        assert_eq!(after.quota_used, 30);

        // 第二次消耗 80 后，第三次准入被拒，且 used 不变
        let admission = ledger.reserve(&token.secret).await.unwrap();
        ledger
            .settle(&admission, &channel, "m1", 40, 40)
            .await
            .unwrap();
        let err = ledger.reserve(&token.secret).await.unwrap_err();
        assert!(matches!(err, GatewayError::QuotaExhausted(_)));
        let after = db.get_token(&token.secret).await.unwrap().unwrap();
        assert_eq!(after.quota_used, 110);
    }

    #[tokio::test]
    async fn concurrent_settles_sum_exactly() {
        let (_dir, db, ledger) = ledger().await;
        let ledger = Arc::new(ledger);
        let channel = Arc::new(test_channel(Some(10_000)));
        db.upsert_channel(&channel.channel, true).await.unwrap();
        let token = db.create_token(CreateTokenPayload::default()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            let channel = channel.clone();
            let secret = token.secret.clone();
            handles.push(tokio::spawn(async move {
                let admission = ledger.reserve(&secret).await.unwrap();
                ledger
                    .settle(&admission, &channel, "m1", 3, 4)
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let after = db.get_token(&token.secret).await.unwrap().unwrap();
        assert_eq!(after.quota_used, 20 * 7);
        assert_eq!(channel.quota_remaining(), Some(10_000 - 20 * 7));
        let channels = db.load_channels().await.unwrap();
        assert_eq!(channels[0].1, 10_000 - 20 * 7);
    }

    #[tokio::test]
    async fn unlimited_token_is_never_exhausted() {
        let (_dir, db, ledger) = ledger().await;
        let channel = test_channel(None);
        db.upsert_channel(&channel.channel, true).await.unwrap();
        let token = db.create_token(CreateTokenPayload::default()).await.unwrap();

        let admission = ledger.reserve(&token.secret).await.unwrap();
        ledger
            .settle(&admission, &channel, "m1", 1_000_000, 1_000_000)
            .await
            .unwrap();
        assert!(ledger.reserve(&token.secret).await.is_ok());
    }
}
