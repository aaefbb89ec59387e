use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Publish, QoS};
use serde::Serialize;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::broker::{qos_from_u8, MqttPublisher};
use crate::config::BridgeConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::{BridgeError, Result};
use crate::reconnect::{ReconnectHandler, ReplayStats};
use crate::registry::LivenessRegistry;
use crate::router::{MessageRouter, RouterStats};
use crate::store::{BufferStore, RedisBufferStore};
use crate::topic::TopicScheme;

/// 运行时统计快照
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub router: RouterStats,
    pub replay: ReplayStats,
    pub known_clients: usize,
    pub active_workers: usize,
}

/// 离线投递缓冲桥接器
///
/// 组装注册表、缓冲存储、路由器与重连处理器，消费 Broker 事件循环，
/// 把入站消息归类后推进按客户端串行化的分发管道。
pub struct Bridge {
    config: BridgeConfig,
    registry: Arc<LivenessRegistry>,
    router: Arc<MessageRouter>,
    reconnect: Arc<ReconnectHandler>,
    dispatcher: Arc<EventDispatcher>,
    topics: TopicScheme,
    client: AsyncClient,
    event_loop: EventLoop,
    qos: QoS,
}

impl Bridge {
    /// 创建桥接器
    ///
    /// 启动即探测存储连通性，存储不可达属于不可恢复的启动失败，
    /// 直接上抛由入口进程退出。
    pub async fn new(config: BridgeConfig) -> Result<Self> {
        let store: Arc<dyn BufferStore> = Arc::new(
            RedisBufferStore::new(config.store.clone(), config.delivery.discipline).await?,
        );

        let registry = Arc::new(LivenessRegistry::new(config.registry_capacity));
        let topics = config.topics.clone();
        let qos = qos_from_u8(config.broker.qos);

        let mut mqtt_options = MqttOptions::new(
            config.broker.client_id.clone(),
            config.broker.host.clone(),
            config.broker.port,
        );
        mqtt_options.set_keep_alive(Duration::from_secs(config.broker.keep_alive_secs));

        let (client, event_loop) =
            AsyncClient::new(mqtt_options, config.broker.channel_capacity);

        let publisher = Arc::new(MqttPublisher::new(client.clone(), qos));

        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            store.clone(),
            publisher.clone(),
            topics.clone(),
            config.delivery.ack_on_forward,
        ));
        let reconnect = Arc::new(ReconnectHandler::new(
            registry.clone(),
            store,
            publisher,
            topics.clone(),
            config.delivery.ack_mode,
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            router.clone(),
            reconnect.clone(),
            config.worker_idle_secs,
        ));

        Ok(Self {
            config,
            registry,
            router,
            reconnect,
            dispatcher,
            topics,
            client,
            event_loop,
            qos,
        })
    }

    /// 当前统计快照
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            router: self.router.stats(),
            replay: self.reconnect.stats(),
            known_clients: self.registry.len(),
            active_workers: self.dispatcher.active_workers(),
        }
    }

    /// 运行主循环
    ///
    /// 首次连接失败是致命的；建立过连接之后的断线交给客户端的
    /// 自动重连，这里只记录并继续轮询。每次 ConnAck 都重新订阅，
    /// 覆盖 Broker 掉线后会话丢失的情况。
    pub async fn run(mut self) -> Result<()> {
        info!(
            "🚀 Pigeonhole bridge running (broker={}:{}, discipline={:?}, ack_mode={:?})",
            self.config.broker.host,
            self.config.broker.port,
            self.config.delivery.discipline,
            self.config.delivery.ack_mode,
        );

        self.start_stats_task();

        let mut connected_once = false;

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected_once = true;
                    info!(
                        "✅ Connected to broker {}:{}",
                        self.config.broker.host, self.config.broker.port
                    );
                    self.subscribe_all().await?;
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    self.handle_publish(publish);
                }
                Ok(_) => {}
                Err(e) if !connected_once => {
                    return Err(BridgeError::Broker(format!(
                        "Failed to connect to broker {}:{}: {}",
                        self.config.broker.host, self.config.broker.port, e
                    )));
                }
                Err(e) => {
                    warn!("Broker connection lost, waiting for reconnect: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// 订阅桥接器关心的全部主题过滤器
    async fn subscribe_all(&self) -> Result<()> {
        for filter in self.topics.subscriptions() {
            self.client
                .subscribe(filter.clone(), self.qos)
                .await
                .map_err(|e| {
                    BridgeError::Broker(format!("Subscribe to {} failed: {}", filter, e))
                })?;
            debug!("Subscribed to {}", filter);
        }
        Ok(())
    }

    /// 归类一条入站消息并投递到分发管道
    ///
    /// 主题畸形只记诊断日志，事件丢弃，绝不让单条坏消息拖垮主循环。
    fn handle_publish(&self, publish: Publish) {
        match self.topics.classify(&publish.topic, &publish.payload) {
            Ok(Some(event)) => {
                debug!("Classified event on {}: {:?}", publish.topic, event.client_id());
                self.dispatcher.dispatch(event);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Discarded inbound event: {}", e);
            }
        }
    }

    /// 启动统计报告任务
    fn start_stats_task(&self) {
        let router = Arc::clone(&self.router);
        let reconnect = Arc::clone(&self.reconnect);
        let registry = Arc::clone(&self.registry);
        let dispatcher = Arc::clone(&self.dispatcher);
        let period = Duration::from_secs(self.config.stats_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = interval(period);
            // 第一次 tick 立即返回，跳过以免启动时打出全零统计
            interval.tick().await;

            loop {
                interval.tick().await;
                let router_stats = router.stats();
                let replay_stats = reconnect.stats();
                info!(
                    "📊 forwarded={} buffered={} acks={} replayed={} aborted={} clients={} workers={}",
                    router_stats.forwarded,
                    router_stats.buffered,
                    router_stats.acks_processed,
                    replay_stats.messages_replayed,
                    replay_stats.replays_aborted,
                    registry.len(),
                    dispatcher.active_workers(),
                );
            }
        });
    }
}
