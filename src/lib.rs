//! modelgate：OpenAI 兼容的聊天补全网关。
//! 多通道注册与故障转移、令牌配额账本、托管/本地双后端、统一流式输出。

pub mod api;
pub mod backends;
pub mod channels;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod quota;
pub mod server;
pub mod streaming;
pub mod transform;
