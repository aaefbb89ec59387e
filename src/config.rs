use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::reconnect::AckMode;
use crate::store::{BufferDiscipline, StoreConfig};
use crate::topic::TopicScheme;

/// Broker 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker 地址
    pub host: String,
    /// Broker 端口
    pub port: u16,
    /// 桥接器的客户端 id
    pub client_id: String,
    /// 保活间隔（秒）
    pub keep_alive_secs: u64,
    /// 发布与订阅使用的 QoS（0/1/2）
    pub qos: u8,
    /// 事件循环通道容量
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "pigeonhole-bridge".to_string(),
            keep_alive_secs: 60,
            qos: 1,
            channel_capacity: 64,
        }
    }
}

/// 投递策略配置
///
/// 缓冲纪律与清理时机都是投递保证的选择，必须显式、全部署一致。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// 缓冲纪律：replace-latest 或 append-ordered
    pub discipline: BufferDiscipline,
    /// 缓冲清理时机：explicit（等确认）或 clear-on-replay
    pub ack_mode: AckMode,
    /// 在线直投成功后是否向发送方回发确认
    pub ack_on_forward: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            discipline: BufferDiscipline::AppendOrdered,
            ack_mode: AckMode::Explicit,
            ack_on_forward: false,
        }
    }
}

/// 桥接器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Broker 连接
    pub broker: BrokerConfig,
    /// Redis 缓冲存储
    pub store: StoreConfig,
    /// 主题地址方案
    pub topics: TopicScheme,
    /// 投递策略
    pub delivery: DeliveryConfig,
    /// 在线状态注册表容量
    pub registry_capacity: usize,
    /// 客户端工作者空闲退出时间（秒）
    pub worker_idle_secs: u64,
    /// 统计报告间隔（秒）
    pub stats_interval_secs: u64,
    /// 日志级别
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            store: StoreConfig::default(),
            topics: TopicScheme::default(),
            delivery: DeliveryConfig::default(),
            registry_capacity: 10_000,
            worker_idle_secs: 300,
            stats_interval_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;

        let config: BridgeConfig = toml::from_str(&content).with_context(|| "配置文件格式错误")?;

        Ok(config)
    }

    /// 从环境变量合并配置（PIGEONHOLE_ 前缀）
    pub fn merge_from_env(&mut self) {
        if let Ok(host) = env::var("PIGEONHOLE_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Ok(port) = env::var("PIGEONHOLE_BROKER_PORT") {
            self.broker.port = port.parse().unwrap_or(self.broker.port);
        }
        if let Ok(client_id) = env::var("PIGEONHOLE_CLIENT_ID") {
            self.broker.client_id = client_id;
        }
        if let Ok(redis_url) = env::var("REDIS_URL") {
            self.store.url = redis_url;
        }
        if let Ok(log_level) = env::var("PIGEONHOLE_LOG_LEVEL") {
            self.log_level = log_level;
        }
    }

    /// 按优先级加载配置：命令行 > 环境变量 > 配置文件 > 默认值
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config_file {
            Some(path) => Self::from_toml_file(path)?,
            None => {
                // 约定路径存在则使用，否则落回默认值
                if Path::new("config.toml").exists() {
                    Self::from_toml_file("config.toml")?
                } else {
                    Self::default()
                }
            }
        };

        config.merge_from_env();

        if let Some(host) = &cli.broker_host {
            config.broker.host = host.clone();
        }
        if let Some(port) = cli.broker_port {
            config.broker.port = port;
        }
        if let Some(client_id) = &cli.client_id {
            config.broker.client_id = client_id.clone();
        }
        if let Some(redis_url) = &cli.redis_url {
            config.store.url = redis_url.clone();
        }
        if let Some(level) = cli.get_log_level() {
            config.log_level = level;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.delivery.discipline, BufferDiscipline::AppendOrdered);
        assert_eq!(config.delivery.ack_mode, AckMode::Explicit);
        assert!(config.registry_capacity > 0);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let toml = r#"
            [broker]
            host = "mqtt.example.com"
            port = 8883

            [delivery]
            discipline = "replace-latest"
            ack_mode = "clear-on-replay"
        "#;

        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.broker.host, "mqtt.example.com");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.delivery.discipline, BufferDiscipline::ReplaceLatest);
        assert_eq!(config.delivery.ack_mode, AckMode::ClearOnReplay);
        // 未给出的段落使用默认值
        assert_eq!(config.store.buffer_namespace, "unsent");
        assert_eq!(config.topics.data_namespace, "sensor");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_topic_scheme_overrides() {
        let toml = r#"
            [topics]
            data_namespace = "telemetry"
            replay_subtopic = "redeliver"
        "#;

        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.topics.data_namespace, "telemetry");
        assert_eq!(config.topics.replay_subtopic, "redeliver");
        assert_eq!(config.topics.ack_namespace, "ack");
    }
}
