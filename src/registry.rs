use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::topic::ClientId;

/// 客户端在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessState {
    Online,
    Offline,
}

/// 客户端记录
///
/// `updated_at` 驱动容量淘汰：满员时最久未更新的记录让位给新客户端。
#[derive(Debug, Clone)]
struct ClientRecord {
    state: LivenessState,
    updated_at: Instant,
}

/// 在线状态注册表
///
/// 纯内存、有界的并发映射。未知客户端一律按 Offline 处理，
/// 宁可多缓冲一条消息也不做无人接收的转发。
///
/// 容量策略：满员插入新客户端时淘汰最久未更新的记录并记录 warn 日志，
/// 不做静默丢弃。淘汰扫描是线性的，只在满员插入时发生。
pub struct LivenessRegistry {
    entries: DashMap<ClientId, ClientRecord>,
    capacity: usize,
}

impl LivenessRegistry {
    /// 创建注册表，容量必须大于 0
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// 记录客户端最新状态（幂等，不会失败）
    pub fn set_state(&self, client_id: &str, state: LivenessState) {
        if let Some(mut record) = self.entries.get_mut(client_id) {
            record.state = state;
            record.updated_at = Instant::now();
            return;
        }

        // 并发插入可能让条目数短暂越过容量，随后的插入会再次收敛
        if self.entries.len() >= self.capacity {
            self.evict_stalest();
        }

        self.entries.insert(
            client_id.to_string(),
            ClientRecord {
                state,
                updated_at: Instant::now(),
            },
        );
        debug!("Registered client {} as {:?}", client_id, state);
    }

    /// 查询客户端状态，未知客户端返回 Offline
    pub fn get_state(&self, client_id: &str) -> LivenessState {
        self.entries
            .get(client_id)
            .map(|record| record.state)
            .unwrap_or(LivenessState::Offline)
    }

    /// 当前记录的客户端数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 淘汰最久未更新的记录
    fn evict_stalest(&self) {
        let stalest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().updated_at)
            .map(|entry| entry.key().clone());

        if let Some(client_id) = stalest {
            self.entries.remove(&client_id);
            warn!(
                "🧹 Liveness registry full ({}), evicted least-recently-updated client {}",
                self.capacity, client_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_client_reads_offline() {
        let registry = LivenessRegistry::new(16);
        assert_eq!(registry.get_state("sensor-7"), LivenessState::Offline);
    }

    #[test]
    fn test_set_state_is_idempotent() {
        let registry = LivenessRegistry::new(16);

        registry.set_state("sensor-7", LivenessState::Online);
        registry.set_state("sensor-7", LivenessState::Online);

        assert_eq!(registry.get_state("sensor-7"), LivenessState::Online);
        assert_eq!(registry.len(), 1);

        registry.set_state("sensor-7", LivenessState::Offline);
        assert_eq!(registry.get_state("sensor-7"), LivenessState::Offline);
    }

    #[test]
    fn test_full_registry_evicts_least_recently_updated() {
        let registry = LivenessRegistry::new(2);

        registry.set_state("a", LivenessState::Online);
        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.set_state("b", LivenessState::Online);
        std::thread::sleep(std::time::Duration::from_millis(2));
        // 刷新 a，b 成为最久未更新的记录
        registry.set_state("a", LivenessState::Online);
        std::thread::sleep(std::time::Duration::from_millis(2));

        registry.set_state("c", LivenessState::Online);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_state("a"), LivenessState::Online);
        assert_eq!(registry.get_state("c"), LivenessState::Online);
        // 被淘汰的客户端按安全默认值读取
        assert_eq!(registry.get_state("b"), LivenessState::Offline);
    }
}
