//! 按模型族的提示词转换策略：对话历史 -> 模型原生提示词，以及模型原始输出的清理。

use std::sync::Arc;

use crate::history::ChatHistory;

mod instruct;
mod llama3;

pub use instruct::InstructTransform;
pub use llama3::Llama3Transform;

pub trait PromptTransform: Send + Sync {
    /// 按输入顺序渲染全部消息，并以一个未闭合的 assistant 轮次结尾
    fn render(&self, history: &ChatHistory) -> String;

    /// 模型族自带的停止序列；引擎将其与调用方的 stop 合并而非替换
    fn stop_sequences(&self) -> &[String];

    /// 去掉模型复读的角色名前后缀。纯字符串裁剪，幂等：
    /// 对已裁剪文本再次调用是 no-op。
    fn trim_output(&self, text: &str) -> String;
}

/// 按模型名选择转换策略。llama3 族使用控制 token 模板，
/// 其余模型走命名轮次的 instruct 模板。
pub fn for_model(model: &str) -> Arc<dyn PromptTransform> {
    let lower = model.to_ascii_lowercase();
    if lower.contains("llama3") || lower.contains("llama-3") {
        Arc::new(Llama3Transform::default())
    } else {
        Arc::new(InstructTransform::default())
    }
}
