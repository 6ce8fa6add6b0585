//! HTTP 入口：装配存储、通道注册表、配额账本与后端适配器，
//! 暴露 OpenAI 兼容的两个路由。

pub mod chat;
pub mod dispatch;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tower_http::cors::{Any, CorsLayer};

use crate::api::{Model, ModelListResponse};
use crate::backends::{BackendAdapter, LocalAdapter, LocalRuntime, OpenAiAdapter};
use crate::channels::{Channel, ChannelEntry, ChannelRegistry};
use crate::config::{ChannelConfig, ChannelKind, Settings};
use crate::error::{GatewayError, Result};
use crate::logging::{ChannelStore, DatabaseLogger, TokenStore, UsageStore};
use crate::quota::{QuotaLedger, weighted_pricing};

pub struct AppState {
    pub settings: Settings,
    pub registry: ChannelRegistry,
    pub ledger: QuotaLedger,
    pub tokens: Arc<dyn TokenStore>,
    pub usage: Arc<dyn UsageStore>,
    hosted: Arc<dyn BackendAdapter>,
    local: Option<Arc<dyn BackendAdapter>>,
}

impl AppState {
    pub fn adapter_for(&self, kind: ChannelKind) -> Option<Arc<dyn BackendAdapter>> {
        match kind {
            ChannelKind::Hosted => Some(self.hosted.clone()),
            ChannelKind::Local => self.local.clone(),
        }
    }
}

fn channel_from_config(config: &ChannelConfig, existing_id: Option<String>) -> Result<Channel> {
    if config.models.is_empty() {
        return Err(GatewayError::Config(format!(
            "channel '{}' declares no models",
            config.name
        )));
    }
    if config.kind == ChannelKind::Hosted
        && config.base_url.as_deref().unwrap_or("").is_empty()
    {
        return Err(GatewayError::Config(format!(
            "hosted channel '{}' requires base_url",
            config.name
        )));
    }
    Ok(Channel {
        // 通道身份以 name 为准，id 首次生成后在库里保持稳定
        id: existing_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        name: config.name.clone(),
        kind: config.kind,
        base_url: config.base_url.clone().unwrap_or_default(),
        api_key: config.api_key.clone().unwrap_or_default(),
        models: config.models.clone(),
        priority: config.priority,
        quota_limit: config.quota,
        model_dir: config.model_dir.clone(),
        context_size: config.context_size,
    })
}

/// 启动时装配整个应用。本地推理引擎是可选协作方，
/// 不注入时 local 通道会在调度时被跳过。
pub async fn create_app(
    settings: Settings,
    local_runtime: Option<Arc<dyn LocalRuntime>>,
) -> Result<Router> {
    let db = Arc::new(DatabaseLogger::new(&settings.logging.database_path).await?);

    let existing: HashMap<String, String> = db
        .load_channels()
        .await?
        .into_iter()
        .map(|(c, _, _)| (c.name.clone(), c.id))
        .collect();
    for config in &settings.channels {
        let channel = channel_from_config(config, existing.get(&config.name).cloned())?;
        db.upsert_channel(&channel, config.enabled).await?;
    }

    let mut entries = Vec::new();
    for (channel, remaining, enabled) in db.load_channels().await? {
        entries.push(Arc::new(ChannelEntry::new(channel, remaining, enabled)));
    }
    let registry = ChannelRegistry::new(entries);

    if local_runtime.is_none()
        && settings
            .channels
            .iter()
            .any(|c| c.kind == ChannelKind::Local && c.enabled)
    {
        tracing::warn!("Local channels configured but no local runtime is available");
    }

    let ledger = QuotaLedger::new(db.clone(), weighted_pricing(&settings.pricing));
    let state = Arc::new(AppState {
        settings,
        registry,
        ledger,
        tokens: db.clone(),
        usage: db,
        hosted: Arc::new(OpenAiAdapter::new()),
        local: local_runtime
            .map(|rt| Arc::new(LocalAdapter::new(rt)) as Arc<dyn BackendAdapter>),
    });
    Ok(router(state))
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(list_models))
        .layer(cors)
        .with_state(state)
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelListResponse> {
    let created = Utc::now().timestamp();
    let data = state
        .registry
        .advertised_models()
        .into_iter()
        .map(|(id, owned_by)| Model {
            id,
            object: "model".to_string(),
            created,
            owned_by,
        })
        .collect();
    Json(ModelListResponse {
        object: "list".to_string(),
        data,
    })
}
