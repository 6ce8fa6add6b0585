//! 本地推理适配器：模型一次加载、全程驻留，推理逐段产出文本。
//! 具体推理引擎通过 [`LocalRuntime`] 注入，进程可以完全不携带它。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell, mpsc};

use crate::api::{FinishReason, Usage};
use crate::channels::Channel;
use crate::error::{GatewayError, Result};
use crate::transform;

use super::{BackendAdapter, Completion, CompletionRequest, DeltaStream, estimate_tokens};

const DEFAULT_MODEL_DIR: &str = "./models";
const DEFAULT_CONTEXT_SIZE: u32 = 8192;

/// 加载一个本地模型所需的全部参数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModelSpec {
    pub name: String,
    pub path: PathBuf,
    pub context_size: u32,
}

/// 推理引擎入口。实现方负责把权重文件变成可推理的模型。
#[async_trait]
pub trait LocalRuntime: Send + Sync {
    async fn load(&self, spec: &LocalModelSpec) -> Result<Arc<dyn LoadedModel>>;
}

/// 已驻留内存的模型。generate 把增量文本写进 tx；
/// 发送失败说明消费方已离开，应当就地停止。
#[async_trait]
pub trait LoadedModel: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &super::GenerationParams,
        tx: mpsc::Sender<String>,
        cancel: super::CancelSignal,
    ) -> Result<()>;
}

/// 按模型名缓存已加载的模型。同一模型的并发首次请求只触发一次加载，
/// 其余请求等待同一个加载完成。
pub struct ModelCache {
    slots: Mutex<HashMap<String, Arc<OnceCell<Arc<dyn LoadedModel>>>>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_load(
        &self,
        runtime: &dyn LocalRuntime,
        spec: &LocalModelSpec,
    ) -> Result<Arc<dyn LoadedModel>> {
        let cell = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(spec.name.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        // 锁已释放，加载期间不阻塞其他模型
        let model = cell
            .get_or_try_init(|| async { runtime.load(spec).await })
            .await?;
        Ok(model.clone())
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LocalAdapter {
    runtime: Arc<dyn LocalRuntime>,
    cache: ModelCache,
}

impl LocalAdapter {
    pub fn new(runtime: Arc<dyn LocalRuntime>) -> Self {
        Self {
            runtime,
            cache: ModelCache::new(),
        }
    }

    fn model_spec(channel: &Channel, model: &str) -> Result<LocalModelSpec> {
        if !channel.models.iter().any(|m| m == model) {
            return Err(GatewayError::UnknownModel(format!(
                "channel {} does not serve {}",
                channel.name, model
            )));
        }
        let dir = channel
            .model_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL_DIR.to_string());
        Ok(LocalModelSpec {
            name: model.to_string(),
            path: PathBuf::from(dir).join(format!("{}.gguf", model)),
            context_size: channel.context_size.unwrap_or(DEFAULT_CONTEXT_SIZE),
        })
    }
}

#[async_trait]
impl BackendAdapter for LocalAdapter {
    async fn complete(&self, channel: &Channel, request: &CompletionRequest) -> Result<Completion> {
        let transform = transform::for_model(&request.model);
        let mut stream = self.stream_complete(channel, request).await?;

        let mut raw = String::new();
        let mut completion_tokens = 0u32;
        while let Some(piece) = stream.deltas.recv().await {
            let piece = piece?;
            if !piece.is_empty() {
                completion_tokens += 1;
            }
            raw.push_str(&piece);
        }
        if request.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let content = transform.trim_output(&raw);
        let finish_reason = if completion_tokens >= request.params.max_tokens {
            FinishReason::Length
        } else {
            FinishReason::Stop
        };
        Ok(Completion {
            content,
            finish_reason,
            usage: Usage::new(stream.prompt_tokens, completion_tokens),
        })
    }

    async fn stream_complete(
        &self,
        channel: &Channel,
        request: &CompletionRequest,
    ) -> Result<DeltaStream> {
        let spec = Self::model_spec(channel, &request.model)?;
        let transform = transform::for_model(&request.model);
        let prompt = transform.render(&request.history);

        // 调用方停止串之外，补上模板自带的结束标记
        let mut params = request.params.clone();
        for stop in transform.stop_sequences() {
            if !params.stop.iter().any(|s| s == stop) {
                params.stop.push(stop.clone());
            }
        }

        let model = self.cache.get_or_load(self.runtime.as_ref(), &spec).await?;
        let prompt_tokens = estimate_tokens(prompt.len());

        let (raw_tx, mut raw_rx) = mpsc::channel::<String>(32);
        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let cancel = request.cancel.clone();

        let generation = tokio::spawn(async move {
            model.generate(&prompt, &params, raw_tx, cancel).await
        });
        tokio::spawn(async move {
            while let Some(piece) = raw_rx.recv().await {
                if tx.send(Ok(piece)).await.is_err() {
                    // 消费方已离开，生成任务发现发送失败后自行停止
                    return;
                }
            }
            match generation.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = tx.send(Err(e)).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(GatewayError::Backend(format!(
                            "generation task failed: {}",
                            e
                        ))))
                        .await;
                }
            }
        });

        Ok(DeltaStream {
            prompt_tokens,
            deltas: rx,
        })
    }
}
