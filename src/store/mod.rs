// 离线缓冲存储模块
// 为每个离线客户端保存待投递的消息，重放后由确认驱动清理

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::topic::ClientId;

pub use memory::MemoryBufferStore;
pub use redis::{RedisBufferStore, StoreConfig};

/// 缓冲纪律
///
/// 每个部署只能选一种并保持一致，混用会破坏顺序保证。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferDiscipline {
    /// 新消息覆盖旧消息，只保留最后一条（适合只关心最新值的传感器读数）
    ReplaceLatest,
    /// 新消息追加到有序序列，重放时按入队顺序投递全部
    AppendOrdered,
}

/// 缓冲中的离线消息
///
/// 由缓冲存储按 client id 独占持有；路由器与重连处理器
/// 持有副本的时间不超过一次操作。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// 归属客户端
    pub client_id: ClientId,
    /// 不透明负载，重放时原样发布
    pub payload: Bytes,
    /// 入队时间戳（排序与诊断用）
    pub enqueued_at: DateTime<Utc>,
}

impl BufferedMessage {
    pub fn new(client_id: impl Into<ClientId>, payload: Bytes) -> Self {
        Self {
            client_id: client_id.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// 缓冲存储后端 Trait
///
/// `drain` 只读不删，删除是独立的显式步骤（`clear`），
/// 这样调用方才能把"重放→确认→清理"组合成自己需要的原子序列。
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// 为客户端缓冲一条消息
    ///
    /// 失败必须向上传播——静默丢掉一条已接收的消息就是数据丢失。
    async fn enqueue(&self, message: &BufferedMessage) -> Result<()>;

    /// 取出客户端当前缓冲的全部消息，不删除
    ///
    /// replace-latest 纪律下最多返回一条。
    async fn drain(&self, client_id: &str) -> Result<Vec<BufferedMessage>>;

    /// 幂等删除客户端的全部缓冲，空缓冲时也安全
    async fn clear(&self, client_id: &str) -> Result<()>;

    /// 健康检查（启动时探测存储可达性）
    async fn health_check(&self) -> Result<()>;
}
