//! 后端适配能力：每个供应商家族实现一次，引擎通过统一接口调用。

pub mod local;
pub mod openai;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::api::{FinishReason, Usage};
use crate::channels::Channel;
use crate::error::{GatewayError, Result};
use crate::history::ChatHistory;

pub use local::{LoadedModel, LocalAdapter, LocalModelSpec, LocalRuntime, ModelCache};
pub use openai::OpenAiAdapter;

/// 生成参数。默认值沿用常见推理默认（1024 tokens / 0.8 / 0.95）。
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.8,
            top_p: 0.95,
            stop: Vec::new(),
        }
    }
}

/// 归一化后的内部请求，适配器的唯一输入。
#[derive(Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub history: ChatHistory,
    pub params: GenerationParams,
    pub cancel: CancelSignal,
}

/// 非流式调用的结果。
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// 流式调用的结果：提示词 token 数 + 逐段文本。
/// 发送端关闭通道即为显式的流结束，不借用任何内容哨兵值。
pub struct DeltaStream {
    pub prompt_tokens: u32,
    pub deltas: mpsc::Receiver<Result<String>>,
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// 阻塞到完整回答产出
    async fn complete(&self, channel: &Channel, request: &CompletionRequest) -> Result<Completion>;

    /// 惰性、不可重放的增量文本序列
    async fn stream_complete(
        &self,
        channel: &Channel,
        request: &CompletionRequest,
    ) -> Result<DeltaStream>;
}

/// 请求级取消信号。超时按取消语义处理：到期触发同一个信号。
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle {
            tx: std::sync::Arc::new(tx),
        },
        CancelSignal { rx },
    )
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// 等待取消。若 handle 被丢弃且从未触发，则永远挂起，
    /// 便于在 select 中与真实工作并列。
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                futures_util::future::pending::<()>().await;
            }
        }
    }

    /// 测试与非取消场景的空信号
    pub fn never() -> Self {
        let (_handle, signal) = cancel_pair();
        // handle 丢弃后 cancelled() 永远挂起
        signal
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// 到期即取消。任务持有 handle 的克隆，保证期间信号存活。
    pub fn cancel_after(&self, timeout: std::time::Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handle.cancel();
        });
    }
}

/// 后端无法上报提示词用量时的确定性估算：约 4 字符一个 token，至少 1。
pub fn estimate_tokens(len: usize) -> u32 {
    (len.div_ceil(4)).max(1) as u32
}
