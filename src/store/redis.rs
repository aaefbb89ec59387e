// RedisBufferStore - 基于 Redis 的离线缓冲存储
// 基于 bb8-redis 连接池，命令带超时与有界退避重试

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use super::{BufferDiscipline, BufferStore, BufferedMessage};

/// Redis 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis 连接字符串
    pub url: String,
    /// 连接池大小
    pub pool_size: u32,
    /// 最小空闲连接数
    pub min_idle: u32,
    /// 获取连接超时（秒）
    pub connection_timeout_secs: u64,
    /// 单条命令执行超时（毫秒）
    pub command_timeout_ms: u64,
    /// 空闲连接回收时间（秒）
    pub idle_timeout_secs: u64,
    /// 缓冲键命名空间（键形如 `<namespace>:<client-id>`）
    pub buffer_namespace: String,
    /// 缓冲条目过期时间（秒），不设置则长期保留
    pub buffer_ttl_secs: Option<u64>,
    /// 单个命令失败后的最大重试次数
    pub retry_max: u32,
    /// 重试退避基准（毫秒），按次数指数增长并加抖动
    pub retry_base_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 10,
            min_idle: 1,
            connection_timeout_secs: 5,
            command_timeout_ms: 2000,
            idle_timeout_secs: 300,
            buffer_namespace: "unsent".to_string(),
            buffer_ttl_secs: None,
            retry_max: 3,
            retry_base_ms: 100,
        }
    }
}

impl StoreConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Redis 缓冲存储
///
/// 两种纪律映射到不同的键类型：
/// - replace-latest：普通字符串键，SET 覆盖写
/// - append-ordered：列表键，RPUSH 追加、LRANGE 全量读取
///
/// 同一个命名空间下绝不混用两种键类型。
pub struct RedisBufferStore {
    pool: Pool<RedisConnectionManager>,
    config: StoreConfig,
    discipline: BufferDiscipline,
}

impl RedisBufferStore {
    /// 创建缓冲存储并探测连通性
    pub async fn new(config: StoreConfig, discipline: BufferDiscipline) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.clone())
            .map_err(|e| BridgeError::Store(format!("Failed to create Redis manager: {}", e)))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build(manager)
            .await
            .map_err(|e| BridgeError::Store(format!("Failed to create Redis pool: {}", e)))?;

        // 测试连接
        {
            let mut conn = pool.get().await.map_err(|e| {
                BridgeError::Store(format!("Failed to get Redis connection: {}", e))
            })?;
            let _: String = conn
                .ping()
                .await
                .map_err(|e| BridgeError::Store(format!("Redis ping failed: {}", e)))?;
        }

        tracing::info!(
            "✅ Redis 缓冲存储已就绪 (discipline={:?}, namespace={}, pool_size={}, cmd_timeout={}ms)",
            discipline,
            config.buffer_namespace,
            config.pool_size,
            config.command_timeout_ms,
        );

        Ok(Self {
            pool,
            config,
            discipline,
        })
    }

    /// 客户端缓冲键
    fn buffer_key(&self, client_id: &str) -> String {
        format!("{}:{}", self.config.buffer_namespace, client_id)
    }

    /// 从连接池获取连接
    async fn get_conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| BridgeError::Store(format!("Failed to get Redis connection: {}", e)))
    }

    /// 带超时与有界退避重试地执行 Redis 操作
    ///
    /// 只重试连接类错误；超出重试上限后把最后一次错误原样上抛。
    async fn with_retry<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(self.config.command_timeout(), op()).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::Timeout(format!(
                    "Redis {} timeout ({}ms)",
                    op_name, self.config.command_timeout_ms
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.retry_max => {
                    attempt += 1;
                    let backoff = self.config.retry_base_ms * (1u64 << attempt.min(6));
                    let jitter = fastrand::u64(0..=self.config.retry_base_ms);
                    warn!(
                        "Redis {} failed (attempt {}/{}), retrying in {}ms: {}",
                        op_name,
                        attempt,
                        self.config.retry_max,
                        backoff + jitter,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 反序列化一条缓冲条目
    ///
    /// 损坏的条目按尽力而为处理：记录 warn 后跳过，
    /// 最终一致性由确认驱动的 clear 兜底。
    fn decode_entry(&self, client_id: &str, raw: &[u8]) -> Option<BufferedMessage> {
        match bincode::deserialize::<BufferedMessage>(raw) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(
                    "Skipped corrupt buffer entry for client {}: {}",
                    client_id, e
                );
                None
            }
        }
    }
}

#[async_trait]
impl BufferStore for RedisBufferStore {
    async fn enqueue(&self, message: &BufferedMessage) -> Result<()> {
        let key = self.buffer_key(&message.client_id);
        let value = bincode::serialize(message)?;
        let ttl = self.config.buffer_ttl_secs;

        match self.discipline {
            BufferDiscipline::ReplaceLatest => {
                self.with_retry("SET", || {
                    let key = key.clone();
                    let value = value.clone();
                    async move {
                        let mut conn = self.get_conn().await?;
                        match ttl {
                            Some(secs) => {
                                conn.set_ex::<_, _, ()>(&key, value, secs).await.map_err(
                                    |e| BridgeError::Store(format!("Redis SETEX failed: {}", e)),
                                )?
                            }
                            None => conn.set::<_, _, ()>(&key, value).await.map_err(|e| {
                                BridgeError::Store(format!("Redis SET failed: {}", e))
                            })?,
                        }
                        Ok(())
                    }
                })
                .await?;
            }
            BufferDiscipline::AppendOrdered => {
                self.with_retry("RPUSH", || {
                    let key = key.clone();
                    let value = value.clone();
                    async move {
                        let mut conn = self.get_conn().await?;
                        conn.rpush::<_, _, ()>(&key, value).await.map_err(|e| {
                            BridgeError::Store(format!("Redis RPUSH failed: {}", e))
                        })?;
                        if let Some(secs) = ttl {
                            conn.expire::<_, ()>(&key, secs as i64).await.map_err(|e| {
                                BridgeError::Store(format!("Redis EXPIRE failed: {}", e))
                            })?;
                        }
                        Ok(())
                    }
                })
                .await?;
            }
        }

        debug!("Buffered message for client {} at {}", message.client_id, key);
        Ok(())
    }

    async fn drain(&self, client_id: &str) -> Result<Vec<BufferedMessage>> {
        let key = self.buffer_key(client_id);

        let raw_entries: Vec<Vec<u8>> = match self.discipline {
            BufferDiscipline::ReplaceLatest => {
                let entry = self
                    .with_retry("GET", || {
                        let key = key.clone();
                        async move {
                            let mut conn = self.get_conn().await?;
                            let result: Option<Vec<u8>> = conn.get(&key).await.map_err(|e| {
                                BridgeError::Store(format!("Redis GET failed: {}", e))
                            })?;
                            Ok(result)
                        }
                    })
                    .await?;
                entry.into_iter().collect()
            }
            BufferDiscipline::AppendOrdered => {
                self.with_retry("LRANGE", || {
                    let key = key.clone();
                    async move {
                        let mut conn = self.get_conn().await?;
                        let result: Vec<Vec<u8>> =
                            conn.lrange(&key, 0, -1).await.map_err(|e| {
                                BridgeError::Store(format!("Redis LRANGE failed: {}", e))
                            })?;
                        Ok(result)
                    }
                })
                .await?
            }
        };

        Ok(raw_entries
            .iter()
            .filter_map(|raw| self.decode_entry(client_id, raw))
            .collect())
    }

    async fn clear(&self, client_id: &str) -> Result<()> {
        let key = self.buffer_key(client_id);

        self.with_retry("DEL", || {
            let key = key.clone();
            async move {
                let mut conn = self.get_conn().await?;
                conn.del::<_, ()>(&key)
                    .await
                    .map_err(|e| BridgeError::Store(format!("Redis DEL failed: {}", e)))?;
                Ok(())
            }
        })
        .await?;

        debug!("Cleared buffer for client {}", client_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.with_retry("PING", || async move {
            let mut conn = self.get_conn().await?;
            let _: String = conn
                .ping()
                .await
                .map_err(|e| BridgeError::Store(format!("Redis ping failed: {}", e)))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_key_layout() {
        let config = StoreConfig::default();
        assert_eq!(config.buffer_namespace, "unsent");
        // 键形如 <namespace>:<client-id>，与持久化状态布局约定一致
        assert_eq!(
            format!("{}:{}", config.buffer_namespace, "sensor-7"),
            "unsent:sensor-7"
        );
    }

    #[test]
    fn test_default_config_is_sane() {
        let config = StoreConfig::default();
        assert!(config.pool_size > 0);
        assert!(config.retry_max > 0);
        assert_eq!(config.command_timeout(), Duration::from_millis(2000));
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
    }
}
