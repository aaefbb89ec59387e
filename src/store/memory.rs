use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use super::{BufferDiscipline, BufferStore, BufferedMessage};

/// 内存缓冲存储（测试与开发用）
///
/// 与 Redis 后端遵循同一套纪律语义，集成测试直接替换使用。
pub struct MemoryBufferStore {
    discipline: BufferDiscipline,
    buffers: tokio::sync::RwLock<HashMap<String, Vec<BufferedMessage>>>,
}

impl MemoryBufferStore {
    pub fn new(discipline: BufferDiscipline) -> Self {
        Self {
            discipline,
            buffers: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BufferStore for MemoryBufferStore {
    async fn enqueue(&self, message: &BufferedMessage) -> Result<()> {
        let mut buffers = self.buffers.write().await;
        let entry = buffers.entry(message.client_id.clone()).or_default();

        match self.discipline {
            BufferDiscipline::ReplaceLatest => {
                entry.clear();
                entry.push(message.clone());
            }
            BufferDiscipline::AppendOrdered => entry.push(message.clone()),
        }

        debug!(
            "Buffered message for client {} ({} pending)",
            message.client_id,
            entry.len()
        );
        Ok(())
    }

    async fn drain(&self, client_id: &str) -> Result<Vec<BufferedMessage>> {
        let buffers = self.buffers.read().await;
        Ok(buffers.get(client_id).cloned().unwrap_or_default())
    }

    async fn clear(&self, client_id: &str) -> Result<()> {
        let mut buffers = self.buffers.write().await;
        buffers.remove(client_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_enqueue_drain_round_trip() {
        let store = MemoryBufferStore::new(BufferDiscipline::AppendOrdered);
        let message = BufferedMessage::new("sensor-7", Bytes::from("22.5"));

        store.enqueue(&message).await.unwrap();

        // 负载必须按字节原样取回
        let drained = store.drain("sensor-7").await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload.as_ref(), b"22.5");

        // drain 不删除
        assert_eq!(store.drain("sensor-7").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_latest_keeps_only_last_payload() {
        let store = MemoryBufferStore::new(BufferDiscipline::ReplaceLatest);

        store
            .enqueue(&BufferedMessage::new("sensor-7", Bytes::from("21.0")))
            .await
            .unwrap();
        store
            .enqueue(&BufferedMessage::new("sensor-7", Bytes::from("22.5")))
            .await
            .unwrap();

        let drained = store.drain("sensor-7").await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload.as_ref(), b"22.5");
    }

    #[tokio::test]
    async fn test_append_ordered_preserves_enqueue_order() {
        let store = MemoryBufferStore::new(BufferDiscipline::AppendOrdered);

        for payload in ["1", "2", "3"] {
            store
                .enqueue(&BufferedMessage::new("sensor-7", Bytes::from(payload)))
                .await
                .unwrap();
        }

        let drained = store.drain("sensor-7").await.unwrap();
        let payloads: Vec<_> = drained.iter().map(|m| m.payload.as_ref()).collect();
        assert_eq!(payloads, vec![b"1", b"2", b"3"]);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let store = MemoryBufferStore::new(BufferDiscipline::AppendOrdered);

        // 空缓冲时清理也安全
        store.clear("sensor-7").await.unwrap();

        store
            .enqueue(&BufferedMessage::new("sensor-7", Bytes::from("22.5")))
            .await
            .unwrap();
        store.clear("sensor-7").await.unwrap();
        store.clear("sensor-7").await.unwrap();

        assert!(store.drain("sensor-7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_buffers_are_isolated_per_client() {
        let store = MemoryBufferStore::new(BufferDiscipline::AppendOrdered);

        store
            .enqueue(&BufferedMessage::new("a", Bytes::from("1")))
            .await
            .unwrap();
        store
            .enqueue(&BufferedMessage::new("b", Bytes::from("2")))
            .await
            .unwrap();

        store.clear("a").await.unwrap();

        assert!(store.drain("a").await.unwrap().is_empty());
        assert_eq!(store.drain("b").await.unwrap().len(), 1);
    }
}
