//! 通道注册表与选择器。选择不做任何 I/O，可被任意数量的并发请求调用。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::config::ChannelKind;
use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub kind: ChannelKind,
    pub base_url: String,
    pub api_key: String,
    pub models: Vec<String>,
    pub priority: i32,
    /// None 表示不限额
    pub quota_limit: Option<i64>,
    pub model_dir: Option<String>,
    pub context_size: Option<u32>,
}

const LATENCY_UNOBSERVED: i64 = -1;

/// 注册表内的通道条目。引擎只改三样东西：剩余额度、最近延迟、启用位。
pub struct ChannelEntry {
    pub channel: Channel,
    quota_remaining: AtomicI64,
    latency_ms: AtomicI64,
    enabled: AtomicBool,
}

impl ChannelEntry {
    pub fn new(channel: Channel, quota_remaining: i64, enabled: bool) -> Self {
        Self {
            channel,
            quota_remaining: AtomicI64::new(quota_remaining),
            latency_ms: AtomicI64::new(LATENCY_UNOBSERVED),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// 剩余额度；不限额通道返回 None
    pub fn quota_remaining(&self) -> Option<i64> {
        self.channel
            .quota_limit
            .map(|_| self.quota_remaining.load(Ordering::Acquire))
    }

    /// 原子扣减，返回扣减后的余额。fetch_sub 保证并发扣减可线性化。
    pub fn debit(&self, amount: i64) -> Option<i64> {
        self.channel
            .quota_limit
            .map(|_| self.quota_remaining.fetch_sub(amount, Ordering::AcqRel) - amount)
    }

    pub fn observe_latency(&self, ms: i64) {
        self.latency_ms.store(ms.max(0), Ordering::Release);
    }

    pub fn latency_ms(&self) -> Option<i64> {
        match self.latency_ms.load(Ordering::Acquire) {
            LATENCY_UNOBSERVED => None,
            ms => Some(ms),
        }
    }

    fn selectable(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.quota_remaining() {
            Some(remaining) => remaining > 0,
            None => true,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SelectError {
    /// 没有任何通道声明该模型
    UnknownModel(String),
    /// 有通道声明该模型，但全部不可用或已被本次请求排除
    AllChannelsUnavailable(String),
}

impl From<SelectError> for GatewayError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::UnknownModel(m) => GatewayError::UnknownModel(m),
            SelectError::AllChannelsUnavailable(m) => GatewayError::AllChannelsUnavailable(m),
        }
    }
}

/// 每个逻辑模型名下的通道集合。结构在启动时构建，之后只有条目内部的
/// 原子字段会变化，因此读取无需加锁。
pub struct ChannelRegistry {
    entries: Vec<Arc<ChannelEntry>>,
    by_model: HashMap<String, Vec<Arc<ChannelEntry>>>,
}

impl ChannelRegistry {
    pub fn new(entries: Vec<Arc<ChannelEntry>>) -> Self {
        let mut by_model: HashMap<String, Vec<Arc<ChannelEntry>>> = HashMap::new();
        for entry in &entries {
            for model in &entry.channel.models {
                by_model
                    .entry(model.clone())
                    .or_default()
                    .push(entry.clone());
            }
        }
        Self { entries, by_model }
    }

    /// 为模型挑选通道：跳过禁用/额度用尽/已排除的通道，
    /// 按 priority 升序，延迟升序破平（未观测延迟排最后）。
    pub fn select(
        &self,
        model: &str,
        excluded: &HashSet<String>,
    ) -> Result<Arc<ChannelEntry>, SelectError> {
        let candidates = self
            .by_model
            .get(model)
            .ok_or_else(|| SelectError::UnknownModel(model.to_string()))?;

        let mut eligible: Vec<&Arc<ChannelEntry>> = candidates
            .iter()
            .filter(|e| !excluded.contains(&e.channel.id) && e.selectable())
            .collect();

        eligible.sort_by_key(|e| {
            let latency = e.latency_ms().unwrap_or(i64::MAX);
            (e.channel.priority, latency)
        });

        eligible
            .first()
            .map(|e| (**e).clone())
            .ok_or_else(|| SelectError::AllChannelsUnavailable(model.to_string()))
    }

    /// 启用通道声明的模型名集合（去重、保序），供 /v1/models 使用
    pub fn advertised_models(&self) -> Vec<(String, String)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entry in &self.entries {
            if !entry.is_enabled() {
                continue;
            }
            for model in &entry.channel.models {
                if seen.insert(model.clone()) {
                    out.push((model.clone(), entry.channel.name.clone()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str, models: &[&str], priority: i32, quota: Option<i64>) -> Channel {
        Channel {
            id: id.to_string(),
            name: id.to_string(),
            kind: ChannelKind::Hosted,
            base_url: "http://example.invalid".to_string(),
            api_key: "sk-test".to_string(),
            models: models.iter().map(|s| s.to_string()).collect(),
            priority,
            quota_limit: quota,
            model_dir: None,
            context_size: None,
        }
    }

    fn entry(id: &str, models: &[&str], priority: i32, quota: Option<i64>) -> Arc<ChannelEntry> {
        let remaining = quota.unwrap_or(0);
        Arc::new(ChannelEntry::new(
            channel(id, models, priority, quota),
            remaining,
            true,
        ))
    }

    #[test]
    fn prefers_lower_priority() {
        let c1 = entry("c1", &["m"], 1, None);
        let c2 = entry("c2", &["m"], 2, None);
        let registry = ChannelRegistry::new(vec![c2, c1]);
        let selected = registry.select("m", &HashSet::new()).unwrap();
        assert_eq!(selected.channel.id, "c1");
    }

    #[test]
    fn excluded_channel_falls_through_to_next() {
        let c1 = entry("c1", &["m"], 1, None);
        let c2 = entry("c2", &["m"], 2, None);
        let registry = ChannelRegistry::new(vec![c1, c2]);
        let mut excluded = HashSet::new();
        excluded.insert("c1".to_string());
        let selected = registry.select("m", &excluded).unwrap();
        assert_eq!(selected.channel.id, "c2");
        excluded.insert("c2".to_string());
        assert_eq!(
            registry.select("m", &excluded).err(),
            Some(SelectError::AllChannelsUnavailable("m".to_string()))
        );
    }

    #[test]
    fn disabled_channel_is_never_selected() {
        let c1 = entry("c1", &["llama3"], 1, None);
        c1.set_enabled(false);
        let registry = ChannelRegistry::new(vec![c1]);
        assert_eq!(
            registry.select("llama3", &HashSet::new()).err(),
            Some(SelectError::AllChannelsUnavailable("llama3".to_string()))
        );
    }

    #[test]
    fn unknown_model_is_distinguished_from_unavailable() {
        let registry = ChannelRegistry::new(vec![entry("c1", &["m"], 0, None)]);
        assert_eq!(
            registry.select("other", &HashSet::new()).err(),
            Some(SelectError::UnknownModel("other".to_string()))
        );
    }

    #[test]
    fn exhausted_quota_skips_channel_unless_unlimited() {
        let limited = entry("limited", &["m"], 1, Some(10));
        let unlimited = entry("unlimited", &["m"], 2, None);
        let registry = ChannelRegistry::new(vec![limited.clone(), unlimited]);

        assert_eq!(
            registry.select("m", &HashSet::new()).unwrap().channel.id,
            "limited"
        );
        limited.debit(10);
        assert_eq!(limited.quota_remaining(), Some(0));
        assert_eq!(
            registry.select("m", &HashSet::new()).unwrap().channel.id,
            "unlimited"
        );
    }

    #[test]
    fn latency_breaks_priority_ties_and_unobserved_sorts_last() {
        let fast = entry("fast", &["m"], 1, None);
        let slow = entry("slow", &["m"], 1, None);
        let fresh = entry("fresh", &["m"], 1, None);
        fast.observe_latency(20);
        slow.observe_latency(800);
        let registry = ChannelRegistry::new(vec![fresh.clone(), slow, fast]);

        assert_eq!(
            registry.select("m", &HashSet::new()).unwrap().channel.id,
            "fast"
        );
        let mut excluded = HashSet::new();
        excluded.insert("fast".to_string());
        assert_eq!(registry.select("m", &excluded).unwrap().channel.id, "slow");
        excluded.insert("slow".to_string());
        assert_eq!(registry.select("m", &excluded).unwrap().channel.id, "fresh");
    }

    #[test]
    fn concurrent_debits_are_not_lost() {
        let entry = entry("c", &["m"], 0, Some(1_000));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let e = entry.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    e.debit(5);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entry.quota_remaining(), Some(1_000 - 10 * 10 * 5));
    }
}
