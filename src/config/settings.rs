use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ChannelKind,
    /// 托管通道的上游地址（local 通道忽略）
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// 该通道支持的模型列表，顺序即配置顺序
    pub models: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 越小越优先
    #[serde(default)]
    pub priority: i32,
    /// None 表示不限额
    #[serde(default)]
    pub quota: Option<i64>,
    /// local 通道的权重目录，模型文件为 {model_dir}/{model}.gguf
    #[serde(default)]
    pub model_dir: Option<String>,
    #[serde(default)]
    pub context_size: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Hosted,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 单请求超时（秒），超时以取消语义处理；None 表示不限制
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub database_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            database_path: "data/modelgate.db".to_string(),
        }
    }
}

/// 计费权重：charge = prompt_tokens * prompt_weight + completion_tokens * completion_weight。
/// 更复杂的定价策略通过 QuotaLedger 的 PricingPolicy 注入。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub prompt_weight: i64,
    pub completion_weight: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            prompt_weight: 1,
            completion_weight: 1,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        let settings: Settings = toml::from_str(&config_content)?;
        Ok(settings)
    }

    fn find_config_file() -> Result<String, Box<dyn std::error::Error>> {
        let possible_names = ["custom-config.toml", "config.toml"];

        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err("Configuration file not found. Please create custom-config.toml or config.toml".into())
    }
}
