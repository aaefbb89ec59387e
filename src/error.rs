use thiserror::Error;

/// 桥接器错误类型
///
/// 注册表查询属于纯内存操作，永远不会失败，因此没有对应的错误变体；
/// 会出错的只有存储 I/O、Broker I/O 以及事件解析。
#[derive(Debug, Error)]
pub enum BridgeError {
    /// 持久化存储错误（连接丢失、命令执行失败）
    #[error("Store error: {0}")]
    Store(String),

    /// Broker 发布/订阅错误
    #[error("Broker error: {0}")]
    Broker(String),

    /// 主题缺少 client id 段，事件被丢弃
    #[error("Malformed topic: {0}")]
    MalformedTopic(String),

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 命令超时
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl BridgeError {
    /// 判断错误是否可重试
    ///
    /// 连接类错误（存储、Broker、超时）在退避后重试；
    /// 解析与配置错误重试也不会成功，直接丢弃并记录。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Store(_) | BridgeError::Broker(_) | BridgeError::Timeout(_)
        )
    }
}

impl From<bincode::Error> for BridgeError {
    fn from(err: bincode::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, BridgeError>;
