use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};

use crate::error::{BridgeError, Result};

/// 消息发布能力抽象
///
/// 路由器与重连处理器只依赖这个 trait，不接触具体的 Broker 客户端；
/// 测试里用 MockPublisher 替换。
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// 向 Broker 发布一条消息
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()>;
}

/// 把配置里的数字 QoS 映射到协议枚举，非法值按 QoS1 处理
pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// 基于 rumqttc 的发布器
///
/// AsyncClient 内部持有到事件循环的发送通道，克隆成本低；
/// 连接断开时 publish 会排队或报错，由调用方按可重试错误处理。
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, qos: QoS) -> Self {
        Self { client, qos }
    }
}

#[async_trait]
impl MessagePublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        self.client
            .publish(topic, self.qos, retain, payload.to_vec())
            .await
            .map_err(|e| BridgeError::Broker(format!("Publish to {} failed: {}", topic, e)))
    }
}

/// 已发布消息记录（测试断言用）
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

/// Mock 发布器（测试用）
///
/// 记录所有发布调用，可切换为失败模式模拟 Broker 不可达。
#[derive(Default)]
pub struct MockPublisher {
    published: Mutex<Vec<PublishedMessage>>,
    fail: AtomicBool,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让后续 publish 调用全部失败
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// 取出已记录的发布调用
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// 指定主题上发布过的负载
    pub fn payloads_on(&self, topic: &str) -> Vec<Bytes> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for MockPublisher {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::Broker(format!(
                "Publish to {} failed: mock broker down",
                topic
            )));
        }
        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }
}
