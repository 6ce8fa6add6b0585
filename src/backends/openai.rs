//! 托管 REST 适配器：把归一化请求原样转发给远端 OpenAI 兼容端点。

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest_eventsource::{Event, EventSource, RequestBuilderExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::api::{FinishReason, Usage};
use crate::channels::Channel;
use crate::error::{GatewayError, Result};
use crate::history::Role;

use super::{BackendAdapter, Completion, CompletionRequest, DeltaStream, estimate_tokens};

pub struct OpenAiAdapter {
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(channel: &Channel) -> String {
        format!(
            "{}/v1/chat/completions",
            channel.base_url.trim_end_matches('/')
        )
    }

    fn upstream_body(request: &CompletionRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .history
            .messages()
            .iter()
            .map(|m| {
                // 上游不认识 unknown 角色，按 user 转发
                let role = match m.role {
                    Role::Unknown => "user",
                    other => other.as_str(),
                };
                json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.params.max_tokens,
            "temperature": request.params.temperature,
            "top_p": request.params.top_p,
            "stream": stream,
        });
        if !request.params.stop.is_empty() {
            body["stop"] = json!(request.params.stop);
        }
        body
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// 宽容地从上游响应里取出内容、结束原因与用量，容忍厂商扩展字段
fn parse_completion(v: &Value, request: &CompletionRequest) -> Result<Completion> {
    let choice = v
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| GatewayError::Backend("upstream response has no choices".into()))?;
    let content = choice
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .and_then(FinishReason::parse)
        .unwrap_or(FinishReason::Stop);

    let prompt_tokens = v
        .pointer("/usage/prompt_tokens")
        .and_then(|x| x.as_u64())
        .map(|x| x as u32)
        .unwrap_or_else(|| estimate_tokens(request.history.content_len()));
    let completion_tokens = v
        .pointer("/usage/completion_tokens")
        .and_then(|x| x.as_u64())
        .map(|x| x as u32)
        .unwrap_or_else(|| estimate_tokens(content.len()));

    Ok(Completion {
        content,
        finish_reason,
        usage: Usage::new(prompt_tokens, completion_tokens),
    })
}

enum SseData {
    Done,
    Delta(Option<String>),
}

fn parse_sse_data(data: &str) -> Result<SseData> {
    if data.trim() == "[DONE]" {
        return Ok(SseData::Done);
    }
    let v: Value = serde_json::from_str(data)?;
    let delta = v
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string());
    Ok(SseData::Delta(delta))
}

#[async_trait]
impl BackendAdapter for OpenAiAdapter {
    async fn complete(&self, channel: &Channel, request: &CompletionRequest) -> Result<Completion> {
        let url = Self::endpoint(channel);
        let send = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", channel.api_key))
            .header("Content-Type", "application/json")
            .json(&Self::upstream_body(request, false))
            .send();

        let response = tokio::select! {
            _ = request.cancel.cancelled() => return Err(GatewayError::Cancelled),
            r = send => r?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Backend(format!(
                "upstream returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: Value = tokio::select! {
            _ = request.cancel.cancelled() => return Err(GatewayError::Cancelled),
            r = response.json() => r?,
        };
        parse_completion(&v, request)
    }

    async fn stream_complete(
        &self,
        channel: &Channel,
        request: &CompletionRequest,
    ) -> Result<DeltaStream> {
        let url = Self::endpoint(channel);
        let builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", channel.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&Self::upstream_body(request, true));

        let mut es: EventSource = builder
            .eventsource()
            .map_err(|e| GatewayError::Backend(format!("failed to open event stream: {}", e)))?;

        // 等连接建立后才返回流：打开失败在这里浮出，留给通道故障转移
        let mut pending = None;
        tokio::select! {
            _ = request.cancel.cancelled() => {
                es.close();
                return Err(GatewayError::Cancelled);
            }
            first = es.next() => match first {
                Some(Ok(Event::Open)) => {}
                Some(Ok(Event::Message(m))) => pending = Some(m.data),
                Some(Err(e)) => {
                    es.close();
                    return Err(GatewayError::Backend(e.to_string()));
                }
                None => {
                    return Err(GatewayError::Backend(
                        "upstream closed before responding".into(),
                    ));
                }
            }
        }

        let prompt_tokens = estimate_tokens(request.history.content_len());
        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let cancel = request.cancel.clone();

        tokio::spawn(async move {
            if let Some(data) = pending {
                match parse_sse_data(&data) {
                    Ok(SseData::Done) => {
                        es.close();
                        return;
                    }
                    Ok(SseData::Delta(Some(delta))) if !delta.is_empty() => {
                        if tx.send(Ok(delta)).await.is_err() {
                            es.close();
                            return;
                        }
                    }
                    Ok(SseData::Delta(_)) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        es.close();
                        return;
                    }
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = es.next() => match ev {
                        None => break,
                        Some(Ok(Event::Open)) => {}
                        Some(Ok(Event::Message(m))) => match parse_sse_data(&m.data) {
                            Ok(SseData::Done) => break,
                            Ok(SseData::Delta(Some(delta))) if !delta.is_empty() => {
                                if tx.send(Ok(delta)).await.is_err() {
                                    // 消费方已离开，视同取消
                                    break;
                                }
                            }
                            Ok(SseData::Delta(_)) => {}
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            let _ = tx
                                .send(Err(GatewayError::Backend(e.to_string())))
                                .await;
                            break;
                        }
                    }
                }
            }
            es.close();
        });

        Ok(DeltaStream {
            prompt_tokens,
            deltas: rx,
        })
    }
}
