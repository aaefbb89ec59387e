use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::reconnect::ReconnectHandler;
use crate::router::MessageRouter;
use crate::topic::{BridgeEvent, ClientId};

/// 事件分发器
///
/// 每个 client id 一个串行工作者：同一客户端的事件按到达顺序
/// 处理（入缓冲与重放对同一 id 可线性化），不同客户端并行。
/// 注册表和缓冲存储只通过组件契约访问，锁纪律封在契约里。
///
/// 工作者空闲一段时间后自行退出并摘除自己的表项，
/// 下一个事件到来时重新拉起。
pub struct EventDispatcher {
    router: Arc<MessageRouter>,
    reconnect: Arc<ReconnectHandler>,
    workers: Arc<DashMap<ClientId, mpsc::UnboundedSender<BridgeEvent>>>,
    worker_idle: Duration,
}

impl EventDispatcher {
    pub fn new(
        router: Arc<MessageRouter>,
        reconnect: Arc<ReconnectHandler>,
        worker_idle_secs: u64,
    ) -> Self {
        Self {
            router,
            reconnect,
            workers: Arc::new(DashMap::new()),
            worker_idle: Duration::from_secs(worker_idle_secs.max(1)),
        }
    }

    /// 把事件投递到归属客户端的工作者
    ///
    /// 工作者可能刚好在空闲退出，send 失败时摘掉死表项重试。
    pub fn dispatch(&self, event: BridgeEvent) {
        let client_id = event.client_id().to_string();
        let mut pending = event;

        loop {
            let sender = self
                .workers
                .entry(client_id.clone())
                .or_insert_with(|| self.spawn_worker(client_id.clone()))
                .clone();

            match sender.send(pending) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    // 只摘除自己拿到的这个已关闭通道，避免误伤并发新建的工作者
                    self.workers
                        .remove_if(&client_id, |_, s| s.same_channel(&sender));
                    pending = event;
                }
            }
        }
    }

    /// 当前活跃工作者数量
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// 拉起一个客户端工作者
    fn spawn_worker(&self, client_id: ClientId) -> mpsc::UnboundedSender<BridgeEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<BridgeEvent>();
        let router = Arc::clone(&self.router);
        let reconnect = Arc::clone(&self.reconnect);
        let workers = Arc::clone(&self.workers);
        let own_tx = tx.clone();
        let idle = self.worker_idle;

        tokio::spawn(async move {
            debug!("Worker for client {} started", client_id);

            loop {
                match tokio::time::timeout(idle, rx.recv()).await {
                    Ok(Some(event)) => {
                        Self::handle_event(&router, &reconnect, event).await;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        // 空闲退出：先关闭通道，把已入队的事件处理完再走
                        rx.close();
                        while let Some(event) = rx.recv().await {
                            Self::handle_event(&router, &reconnect, event).await;
                        }
                        break;
                    }
                }
            }

            workers.remove_if(&client_id, |_, s| s.same_channel(&own_tx));
            debug!("Worker for client {} exited", client_id);
        });

        tx
    }

    /// 处理单个事件
    ///
    /// 存储层内部已做有界退避重试；到这里仍然失败的事件
    /// 带着可见的错误日志丢弃，绝不静默吞掉。
    async fn handle_event(
        router: &MessageRouter,
        reconnect: &ReconnectHandler,
        event: BridgeEvent,
    ) {
        match event {
            BridgeEvent::Data {
                client_id,
                topic,
                payload,
            } => {
                if let Err(e) = router.handle_data(&client_id, payload).await {
                    error!(
                        "❌ Data event from {} for client {} dropped: {}",
                        topic, client_id, e
                    );
                }
            }
            BridgeEvent::Ack { client_id } => {
                if let Err(e) = router.handle_ack(&client_id).await {
                    // clear 失败会在下一次确认/转发/重放时再试
                    error!("❌ Ack for client {} not applied: {}", client_id, e);
                }
            }
            BridgeEvent::Liveness { client_id, online } => {
                if let Err(e) = reconnect.handle_liveness(&client_id, online).await {
                    error!(
                        "❌ Liveness event for client {} failed, next cycle recovers: {}",
                        client_id, e
                    );
                }
            }
        }
    }
}
