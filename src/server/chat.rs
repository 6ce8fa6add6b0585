//! POST /v1/chat/completions：准入、归一化、调度、结算、落日志。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::{
    ApiMessage, ChatCompletionRequest, ChatCompletionResponse, Choice, Usage,
};
use crate::backends::{CompletionRequest, GenerationParams, cancel_pair};
use crate::channels::ChannelEntry;
use crate::error::{GatewayError, Result};
use crate::history::{ChatHistory, ChatMessage, Role};
use crate::logging::{REQ_TYPE_CHAT, REQ_TYPE_CHAT_STREAM, UsageRecord};
use crate::quota::Admission;
use crate::streaming::{StreamContext, aggregate};

use super::AppState;

fn bearer_token(headers: &HeaderMap) -> Result<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::UnauthorizedCaller("missing bearer token".into()))
}

fn generation_params(request: &ChatCompletionRequest) -> GenerationParams {
    let defaults = GenerationParams::default();
    GenerationParams {
        max_tokens: request.max_tokens.unwrap_or(defaults.max_tokens),
        temperature: request.temperature.unwrap_or(defaults.temperature),
        top_p: request.top_p.unwrap_or(defaults.top_p),
        stop: request
            .stop
            .clone()
            .map(|s| s.into_vec())
            .unwrap_or_default(),
    }
}

fn to_history(request: &ChatCompletionRequest) -> ChatHistory {
    request
        .messages
        .iter()
        .map(|m| ChatMessage::new(Role::parse(&m.role), m.content.clone()))
        .collect()
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ChatCompletionRequest>,
) -> Result<Response> {
    let secret = bearer_token(&headers)?;
    // 准入失败不落用量日志：请求没有触达任何后端
    let admission = state.ledger.reserve(&secret).await?;

    let (cancel_handle, cancel) = cancel_pair();
    if let Some(secs) = state.settings.server.request_timeout_secs {
        cancel_handle.cancel_after(Duration::from_secs(secs));
    }

    let request = CompletionRequest {
        model: payload.model.clone(),
        history: to_history(&payload),
        params: generation_params(&payload),
        cancel,
    };

    if payload.stream.unwrap_or(false) {
        stream_chat(state, admission, payload, request).await
    } else {
        blocking_chat(state, admission, payload, request).await
    }
}

async fn blocking_chat(
    state: Arc<AppState>,
    admission: Admission,
    payload: ChatCompletionRequest,
    request: CompletionRequest,
) -> Result<Response> {
    let started = Instant::now();
    let (entry, completion) = super::dispatch::complete_with_failover(
        &state,
        REQ_TYPE_CHAT,
        &admission.token.id,
        &request,
    )
    .await?;

    let charge =
        settle_usage(&state, &admission, &entry, &payload.model, completion.usage).await;

    let record = UsageRecord {
        id: None,
        timestamp: Utc::now(),
        request_type: REQ_TYPE_CHAT.to_string(),
        token_id: Some(admission.token.id.clone()),
        channel_id: Some(entry.channel.id.clone()),
        model: Some(payload.model.clone()),
        prompt_tokens: Some(completion.usage.prompt_tokens),
        completion_tokens: Some(completion.usage.completion_tokens),
        total_tokens: Some(completion.usage.total_tokens),
        quota_charged: charge,
        status_code: 200,
        response_time_ms: started.elapsed().as_millis() as i64,
        finish_reason: Some(completion.finish_reason.as_str().to_string()),
        error_message: None,
    };
    if let Err(e) = state.usage.log_usage(record).await {
        tracing::warn!("Failed to record usage: {}", e);
    }

    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: payload.model,
        choices: vec![Choice {
            index: 0,
            message: ApiMessage {
                role: "assistant".to_string(),
                content: completion.content,
            },
            finish_reason: Some(completion.finish_reason),
        }],
        usage: completion.usage,
    };
    Ok(Json(response).into_response())
}

async fn stream_chat(
    state: Arc<AppState>,
    admission: Admission,
    payload: ChatCompletionRequest,
    request: CompletionRequest,
) -> Result<Response> {
    let started = Instant::now();
    let (entry, source) = super::dispatch::open_stream_with_failover(
        &state,
        REQ_TYPE_CHAT_STREAM,
        &admission.token.id,
        &request,
    )
    .await?;

    let (chunks, outcome_rx) = aggregate(
        source,
        StreamContext {
            model: payload.model.clone(),
            max_tokens: request.params.max_tokens,
            cancel: request.cancel.clone(),
        },
    );

    // 结算与落日志不依赖客户端连接，流以任何方式结束都会执行
    {
        let state = state.clone();
        let entry = entry.clone();
        let admission = admission.clone();
        let model = payload.model.clone();
        tokio::spawn(async move {
            let Ok(outcome) = outcome_rx.await else {
                return;
            };
            let charge = if outcome.usage.total_tokens > 0 {
                settle_usage(&state, &admission, &entry, &model, outcome.usage).await
            } else {
                None
            };
            let status_code = if outcome.error.is_some() {
                502
            } else if outcome.cancelled {
                499
            } else {
                200
            };
            let record = UsageRecord {
                id: None,
                timestamp: Utc::now(),
                request_type: REQ_TYPE_CHAT_STREAM.to_string(),
                token_id: Some(admission.token.id.clone()),
                channel_id: Some(entry.channel.id.clone()),
                model: Some(model),
                prompt_tokens: Some(outcome.usage.prompt_tokens),
                completion_tokens: Some(outcome.usage.completion_tokens),
                total_tokens: Some(outcome.usage.total_tokens),
                quota_charged: charge,
                status_code,
                response_time_ms: started.elapsed().as_millis() as i64,
                finish_reason: outcome.finish.map(|f| f.as_str().to_string()),
                error_message: outcome.error,
            };
            if let Err(e) = state.usage.log_usage(record).await {
                tracing::warn!("Failed to record stream usage: {}", e);
            }
        });
    }

    let (tx, rx) = mpsc::channel::<std::result::Result<Event, Infallible>>(32);
    tokio::spawn(async move {
        let mut chunks = chunks;
        let mut saw_terminal = false;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    let terminal = chunk
                        .choices
                        .first()
                        .is_some_and(|c| c.finish_reason.is_some());
                    let data = match serde_json::to_string(&chunk) {
                        Ok(d) => d,
                        Err(e) => {
                            tracing::error!("Failed to serialize stream chunk: {}", e);
                            continue;
                        }
                    };
                    if tx.send(Ok(Event::default().data(data))).await.is_err() {
                        // 客户端断开；丢弃 chunks 会让上游停下来
                        return;
                    }
                    saw_terminal = saw_terminal || terminal;
                }
                Err(e) => {
                    let body = json!({
                        "error": { "message": e.to_string(), "type": e.kind() }
                    });
                    let _ = tx.send(Ok(Event::default().data(body.to_string()))).await;
                }
            }
        }
        // 只有正常收尾的流才有 [DONE]
        if saw_terminal {
            let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn settle_usage(
    state: &AppState,
    admission: &Admission,
    entry: &ChannelEntry,
    model: &str,
    usage: Usage,
) -> Option<i64> {
    match state
        .ledger
        .settle(
            admission,
            entry,
            model,
            usage.prompt_tokens,
            usage.completion_tokens,
        )
        .await
    {
        Ok(charge) => Some(charge),
        Err(e) => {
            // 结算失败不拦截响应，记入日志待人工对账
            tracing::error!("Failed to settle usage for token {}: {}", admission.token.id, e);
            None
        }
    }
}
