//! 通道调度与故障转移：失败的通道在本次请求内被排除，
//! 换下一个候选重试，直到成功或候选耗尽。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::backends::{Completion, CompletionRequest, DeltaStream};
use crate::channels::ChannelEntry;
use crate::error::{GatewayError, Result};
use crate::logging::UsageRecord;

use super::AppState;

/// 取消与未知模型不换通道，换了也不会有不同结果
fn retryable(e: &GatewayError) -> bool {
    !matches!(e, GatewayError::Cancelled | GatewayError::UnknownModel(_))
}

async fn record_failed_attempt(
    state: &AppState,
    request_type: &str,
    token_id: &str,
    entry: &ChannelEntry,
    model: &str,
    response_time_ms: i64,
    error: &GatewayError,
) {
    let record = UsageRecord {
        id: None,
        timestamp: Utc::now(),
        request_type: request_type.to_string(),
        token_id: Some(token_id.to_string()),
        channel_id: Some(entry.channel.id.clone()),
        model: Some(model.to_string()),
        prompt_tokens: None,
        completion_tokens: None,
        total_tokens: None,
        quota_charged: None,
        status_code: error.status_code().as_u16(),
        response_time_ms,
        finish_reason: None,
        error_message: Some(error.to_string()),
    };
    if let Err(e) = state.usage.log_usage(record).await {
        tracing::warn!("Failed to record failed attempt: {}", e);
    }
}

pub async fn complete_with_failover(
    state: &AppState,
    request_type: &str,
    token_id: &str,
    request: &CompletionRequest,
) -> Result<(Arc<ChannelEntry>, Completion)> {
    let mut excluded = HashSet::new();
    loop {
        let entry = state.registry.select(&request.model, &excluded)?;
        let Some(adapter) = state.adapter_for(entry.channel.kind) else {
            tracing::warn!(
                "Channel {} needs a local runtime that is not configured",
                entry.channel.name
            );
            excluded.insert(entry.channel.id.clone());
            continue;
        };

        let started = Instant::now();
        match adapter.complete(&entry.channel, request).await {
            Ok(completion) => {
                entry.observe_latency(started.elapsed().as_millis() as i64);
                return Ok((entry, completion));
            }
            Err(e) if retryable(&e) => {
                tracing::warn!(
                    "Channel {} failed for model {}: {}",
                    entry.channel.name,
                    request.model,
                    e
                );
                record_failed_attempt(
                    state,
                    request_type,
                    token_id,
                    &entry,
                    &request.model,
                    started.elapsed().as_millis() as i64,
                    &e,
                )
                .await;
                excluded.insert(entry.channel.id.clone());
            }
            Err(e) => {
                // 不可重试的失败也触达了后端，同样入账
                record_failed_attempt(
                    state,
                    request_type,
                    token_id,
                    &entry,
                    &request.model,
                    started.elapsed().as_millis() as i64,
                    &e,
                )
                .await;
                return Err(e);
            }
        }
    }
}

/// 流式版本：只对"打开流"失败做故障转移。
/// 流一旦开始产出，中途的错误由聚合器原样传给客户端。
pub async fn open_stream_with_failover(
    state: &AppState,
    request_type: &str,
    token_id: &str,
    request: &CompletionRequest,
) -> Result<(Arc<ChannelEntry>, DeltaStream)> {
    let mut excluded = HashSet::new();
    loop {
        let entry = state.registry.select(&request.model, &excluded)?;
        let Some(adapter) = state.adapter_for(entry.channel.kind) else {
            tracing::warn!(
                "Channel {} needs a local runtime that is not configured",
                entry.channel.name
            );
            excluded.insert(entry.channel.id.clone());
            continue;
        };

        let started = Instant::now();
        match adapter.stream_complete(&entry.channel, request).await {
            Ok(stream) => {
                entry.observe_latency(started.elapsed().as_millis() as i64);
                return Ok((entry, stream));
            }
            Err(e) if retryable(&e) => {
                tracing::warn!(
                    "Channel {} failed to open stream for model {}: {}",
                    entry.channel.name,
                    request.model,
                    e
                );
                record_failed_attempt(
                    state,
                    request_type,
                    token_id,
                    &entry,
                    &request.model,
                    started.elapsed().as_millis() as i64,
                    &e,
                )
                .await;
                excluded.insert(entry.channel.id.clone());
            }
            Err(e) => {
                record_failed_attempt(
                    state,
                    request_type,
                    token_id,
                    &entry,
                    &request.model,
                    started.elapsed().as_millis() as i64,
                    &e,
                )
                .await;
                return Err(e);
            }
        }
    }
}
