//! 流聚合器：把后端的增量文本变成统一的 OpenAI chunk 序列，
//! 并在流走完后给出一份用量与结束原因的汇总。

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::api::{Delta, FinishReason, StreamChoice, StreamChunk, Usage};
use crate::backends::{CancelSignal, DeltaStream};
use crate::error::Result;

pub struct StreamContext {
    pub model: String,
    pub max_tokens: u32,
    pub cancel: CancelSignal,
}

/// 流结束后的汇总，结算与落日志都从这里取数。
/// finish 为 None 说明流没有正常收尾（取消或出错），不发终止 chunk。
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub finish: Option<FinishReason>,
    pub cancelled: bool,
    pub error: Option<String>,
}

fn chunk_skeleton(id: &str, created: i64, model: &str) -> StreamChunk {
    StreamChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: Vec::new(),
        usage: None,
    }
}

/// 消费一条后端增量流，产出统一 chunk 流与一次性的汇总。
///
/// 保证：同一条流至多一个携带 finish_reason 的终止 chunk；
/// 取消或出错的流没有终止 chunk；汇总在每条退出路径上都会送达。
pub fn aggregate(
    mut source: DeltaStream,
    ctx: StreamContext,
) -> (
    ReceiverStream<Result<StreamChunk>>,
    oneshot::Receiver<StreamOutcome>,
) {
    let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(32);
    let (outcome_tx, outcome_rx) = oneshot::channel::<StreamOutcome>();

    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = Utc::now().timestamp();

    tokio::spawn(async move {
        let mut completion_tokens = 0u32;
        let mut first = true;
        let mut cancelled = false;
        let mut error: Option<String> = None;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                item = source.deltas.recv() => match item {
                    None => break,
                    Some(Ok(text)) => {
                        if text.is_empty() {
                            continue;
                        }
                        // 每个离散 delta 计一个补全 token
                        completion_tokens += 1;
                        let mut chunk = chunk_skeleton(&id, created, &ctx.model);
                        chunk.choices.push(StreamChoice {
                            index: 0,
                            delta: Delta {
                                // 首个内容 chunk 带角色，兼容严格的客户端
                                role: first.then(|| "assistant".to_string()),
                                content: Some(text),
                            },
                            finish_reason: None,
                        });
                        first = false;
                        if tx.send(Ok(chunk)).await.is_err() {
                            // 消费方断开视同取消
                            cancelled = true;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error = Some(e.to_string());
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        }

        let usage = Usage::new(source.prompt_tokens, completion_tokens);

        let mut finish = None;
        if error.is_none() && !cancelled {
            let reason = if completion_tokens >= ctx.max_tokens {
                FinishReason::Length
            } else {
                FinishReason::Stop
            };
            finish = Some(reason);
            let mut terminal = chunk_skeleton(&id, created, &ctx.model);
            terminal.choices.push(StreamChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some(reason),
            });
            terminal.usage = Some(usage);
            let _ = tx.send(Ok(terminal)).await;
        }

        let _ = outcome_tx.send(StreamOutcome {
            usage,
            finish,
            cancelled,
            error,
        });
    });

    (ReceiverStream::new(rx), outcome_rx)
}
