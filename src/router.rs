use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::MessagePublisher;
use crate::error::Result;
use crate::registry::{LivenessRegistry, LivenessState};
use crate::store::{BufferStore, BufferedMessage};
use crate::topic::TopicScheme;

/// 路由统计
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RouterStats {
    /// 在线直投数
    pub forwarded: u64,
    /// 离线入缓冲数
    pub buffered: u64,
    /// 处理的确认数
    pub acks_processed: u64,
}

/// 消息路由器
///
/// 对每条数据消息做一次状态查询后二选一：在线直投、离线入缓冲。
/// 确认消息是缓冲的权威删除路径——重放本身不删，防止客户端在
/// 收到与处理之间再次掉线时丢消息。
pub struct MessageRouter {
    registry: Arc<LivenessRegistry>,
    store: Arc<dyn BufferStore>,
    publisher: Arc<dyn MessagePublisher>,
    topics: TopicScheme,
    /// 在线直投成功后是否向发送方回发确认（payload "OK"）
    ack_on_forward: bool,
    stats: Arc<RwLock<RouterStats>>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<LivenessRegistry>,
        store: Arc<dyn BufferStore>,
        publisher: Arc<dyn MessagePublisher>,
        topics: TopicScheme,
        ack_on_forward: bool,
    ) -> Self {
        Self {
            registry,
            store,
            publisher,
            topics,
            ack_on_forward,
            stats: Arc::new(RwLock::new(RouterStats::default())),
        }
    }

    /// 处理一条数据消息
    ///
    /// 在线：原样转发到投递主题，并顺带清掉可能残留的陈旧缓冲
    /// （上一次投递失败的痕迹）。离线：入缓冲，不转发。
    /// 入缓冲失败必须上抛——静默丢弃就是数据丢失。
    pub async fn handle_data(&self, client_id: &str, payload: Bytes) -> Result<()> {
        match self.registry.get_state(client_id) {
            LivenessState::Online => {
                let delivery_topic = self.topics.delivery_topic(client_id);
                self.publisher
                    .publish(&delivery_topic, payload, false)
                    .await?;
                debug!("📨 Forwarded message to online client {}", client_id);
                self.stats.write().forwarded += 1;

                // 陈旧缓冲清理失败不影响本次投递，留给下一次机会
                if let Err(e) = self.store.clear(client_id).await {
                    warn!("Stale buffer cleanup for {} failed: {}", client_id, e);
                }

                if self.ack_on_forward {
                    let ack_topic = self.topics.ack_topic(client_id);
                    if let Err(e) = self
                        .publisher
                        .publish(&ack_topic, Bytes::from_static(b"OK"), false)
                        .await
                    {
                        warn!("Forward ack publish for {} failed: {}", client_id, e);
                    }
                }
            }
            LivenessState::Offline => {
                let message = BufferedMessage::new(client_id, payload);
                self.store.enqueue(&message).await?;
                debug!("📥 Buffered message for offline client {}", client_id);
                self.stats.write().buffered += 1;
            }
        }
        Ok(())
    }

    /// 处理一条投递确认：清空该客户端的缓冲
    ///
    /// clear 幂等，重复确认或空缓冲时都安全。
    pub async fn handle_ack(&self, client_id: &str) -> Result<()> {
        self.store.clear(client_id).await?;
        info!("✅ Ack from client {}, buffer cleared", client_id);
        self.stats.write().acks_processed += 1;
        Ok(())
    }

    /// 当前统计快照
    pub fn stats(&self) -> RouterStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockPublisher;
    use crate::store::{BufferDiscipline, BufferStore, MemoryBufferStore};

    fn build_router(ack_on_forward: bool) -> (MessageRouter, Arc<MemoryBufferStore>, Arc<MockPublisher>, Arc<LivenessRegistry>) {
        let registry = Arc::new(LivenessRegistry::new(64));
        let store = Arc::new(MemoryBufferStore::new(BufferDiscipline::AppendOrdered));
        let publisher = Arc::new(MockPublisher::new());
        let router = MessageRouter::new(
            registry.clone(),
            store.clone(),
            publisher.clone(),
            TopicScheme::default(),
            ack_on_forward,
        );
        (router, store, publisher, registry)
    }

    #[tokio::test]
    async fn test_offline_client_message_is_buffered_not_forwarded() {
        let (router, store, publisher, _registry) = build_router(false);

        router
            .handle_data("sensor-7", Bytes::from("22.5"))
            .await
            .unwrap();

        assert!(publisher.published().is_empty());
        let buffered = store.drain("sensor-7").await.unwrap();
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].payload.as_ref(), b"22.5");
    }

    #[tokio::test]
    async fn test_online_client_message_is_forwarded_without_buffering() {
        let (router, store, publisher, registry) = build_router(false);
        registry.set_state("sensor-7", LivenessState::Online);

        router
            .handle_data("sensor-7", Bytes::from("22.5"))
            .await
            .unwrap();

        let payloads = publisher.payloads_on("sensor/replay/sensor-7");
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].as_ref(), b"22.5");
        assert!(store.drain("sensor-7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_online_forward_heals_stale_buffer() {
        let (router, store, _publisher, registry) = build_router(false);

        // 上一次投递失败残留的缓冲
        store
            .enqueue(&BufferedMessage::new("sensor-7", Bytes::from("stale")))
            .await
            .unwrap();

        registry.set_state("sensor-7", LivenessState::Online);
        router
            .handle_data("sensor-7", Bytes::from("fresh"))
            .await
            .unwrap();

        assert!(store.drain("sensor-7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_on_forward_publishes_ok() {
        let (router, _store, publisher, registry) = build_router(true);
        registry.set_state("sensor-7", LivenessState::Online);

        router
            .handle_data("sensor-7", Bytes::from("22.5"))
            .await
            .unwrap();

        let acks = publisher.payloads_on("ack/sensor-7");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].as_ref(), b"OK");
    }

    #[tokio::test]
    async fn test_ack_clears_buffer_idempotently() {
        let (router, store, _publisher, _registry) = build_router(false);

        store
            .enqueue(&BufferedMessage::new("sensor-7", Bytes::from("22.5")))
            .await
            .unwrap();

        router.handle_ack("sensor-7").await.unwrap();
        assert!(store.drain("sensor-7").await.unwrap().is_empty());

        // 重复确认与空缓冲确认都安全
        router.handle_ack("sensor-7").await.unwrap();
        router.handle_ack("never-seen").await.unwrap();
    }
}
