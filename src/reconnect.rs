use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::MessagePublisher;
use crate::error::Result;
use crate::registry::{LivenessRegistry, LivenessState};
use crate::store::BufferStore;
use crate::topic::TopicScheme;

/// 缓冲清理时机
///
/// 这是一个投递保证的选择，必须显式配置，不能靠巧合。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// 等客户端显式确认后才清缓冲（at-least-once，默认）
    ///
    /// 重放与删除分离：客户端在收到与处理之间再次掉线时，
    /// 缓冲副本仍在，下一次上线会重新投递。
    Explicit,
    /// 重放成功后立即清缓冲（best-effort-once）
    ///
    /// 适用于没有接确认链路的部署，接受降级的保证。
    ClearOnReplay,
}

/// 重放统计
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ReplayStats {
    /// 处理的在线信号数
    pub online_signals: u64,
    /// 处理的离线信号数
    pub offline_signals: u64,
    /// 重放的消息数
    pub messages_replayed: u64,
    /// 中止的重放次数（发布失败，缓冲保留）
    pub replays_aborted: u64,
}

/// 重连处理器
///
/// 消费在线状态信号：先翻转注册表，客户端上线时再触发缓冲重放。
/// 信号来源（客户端自报主题或 Broker 系统状态主题）在归类层已经
/// 统一，这里只面对同一种状态迁移契约。
pub struct ReconnectHandler {
    registry: Arc<LivenessRegistry>,
    store: Arc<dyn BufferStore>,
    publisher: Arc<dyn MessagePublisher>,
    topics: TopicScheme,
    ack_mode: AckMode,
    stats: Arc<RwLock<ReplayStats>>,
}

impl ReconnectHandler {
    pub fn new(
        registry: Arc<LivenessRegistry>,
        store: Arc<dyn BufferStore>,
        publisher: Arc<dyn MessagePublisher>,
        topics: TopicScheme,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            registry,
            store,
            publisher,
            topics,
            ack_mode,
            stats: Arc::new(RwLock::new(ReplayStats::default())),
        }
    }

    /// 处理一条在线状态信号
    ///
    /// 任意当前状态下：online 信号记为 ONLINE 并触发重放，
    /// offline 信号记为 OFFLINE、不动缓冲。
    pub async fn handle_liveness(&self, client_id: &str, online: bool) -> Result<()> {
        if online {
            self.registry.set_state(client_id, LivenessState::Online);
            self.stats.write().online_signals += 1;
            info!("🔌 Client {} is now online", client_id);
            self.replay(client_id).await
        } else {
            self.registry.set_state(client_id, LivenessState::Offline);
            self.stats.write().offline_signals += 1;
            info!("🔌 Client {} is now offline", client_id);
            Ok(())
        }
    }

    /// 重放客户端缓冲的全部消息
    ///
    /// 按提交顺序逐条发布到投递主题；任何一条发布失败就中止，
    /// 剩余消息留在缓冲里等下一个在线周期。是否在重放后清缓冲
    /// 由 AckMode 决定。
    async fn replay(&self, client_id: &str) -> Result<()> {
        let messages = match self.store.drain(client_id).await {
            Ok(messages) => messages,
            Err(e) => {
                // drain 失败留给下一次在线周期重试，不算致命
                warn!("Drain for client {} failed, replay postponed: {}", client_id, e);
                return Err(e);
            }
        };

        if messages.is_empty() {
            debug!("No buffered messages for client {}", client_id);
            return Ok(());
        }

        let delivery_topic = self.topics.delivery_topic(client_id);
        let total = messages.len();

        for (index, message) in messages.into_iter().enumerate() {
            if let Err(e) = self
                .publisher
                .publish(&delivery_topic, message.payload, false)
                .await
            {
                self.stats.write().replays_aborted += 1;
                warn!(
                    "Replay for client {} aborted at {}/{}, buffer kept: {}",
                    client_id,
                    index + 1,
                    total,
                    e
                );
                return Err(e);
            }
            self.stats.write().messages_replayed += 1;
        }

        info!("📤 Replayed {} buffered message(s) to client {}", total, client_id);

        match self.ack_mode {
            AckMode::Explicit => {
                // 等确认；清理由路由器的 Ack 路径完成
            }
            AckMode::ClearOnReplay => {
                if let Err(e) = self.store.clear(client_id).await {
                    // 清理失败会造成一次重复投递，下一个确认或重放兜底
                    warn!("Post-replay clear for client {} failed: {}", client_id, e);
                }
            }
        }

        Ok(())
    }

    /// 当前统计快照
    pub fn stats(&self) -> ReplayStats {
        self.stats.read().clone()
    }
}
