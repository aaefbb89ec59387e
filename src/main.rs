use anyhow::{Context, Result};
use pigeonhole::{
    cli::{Cli, Commands},
    config::BridgeConfig,
    logging, Bridge,
};
use std::fs;
use std::process;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    // 解析命令行参数
    let cli = Cli::parse();

    // 处理子命令
    if let Some(command) = &cli.command {
        match command {
            Commands::GenerateConfig { path } => {
                return generate_config(path);
            }
            Commands::ValidateConfig { path } => {
                return validate_config(path);
            }
            Commands::ShowConfig => {
                return show_config(&cli);
            }
        }
    }

    // 合并日志配置（优先级：CLI > 默认值；level 还会被配置文件覆盖前使用）
    let log_level = cli.get_log_level().unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format();

    let _log_guard = logging::init_logging(
        &log_level,
        log_format.as_deref(),
        cli.log_file.as_deref(),
        cli.quiet,
    )?;

    tracing::info!("🚀 Pigeonhole bridge starting...");

    // 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    let config = BridgeConfig::load(&cli).context("加载配置失败")?;

    if cli.dev {
        tracing::info!("🔧 开发模式已启用");
    }

    // 显示配置信息
    tracing::info!("📊 Bridge Configuration:");
    tracing::info!("  - Broker: {}:{}", config.broker.host, config.broker.port);
    tracing::info!("  - Client ID: {}", config.broker.client_id);
    tracing::info!("  - QoS: {}", config.broker.qos);
    tracing::info!("  - Redis: {}", config.store.url);
    tracing::info!("  - Buffer Namespace: {}", config.store.buffer_namespace);
    tracing::info!("  - Discipline: {:?}", config.delivery.discipline);
    tracing::info!("  - Ack Mode: {:?}", config.delivery.ack_mode);
    tracing::info!("  - Data Topics: {}/#", config.topics.data_namespace);
    tracing::info!("  - Registry Capacity: {}", config.registry_capacity);
    tracing::info!("  - Log Level: {}", config.log_level);

    // 创建桥接器（存储不可达等启动失败会打印错误并退出）
    let bridge = match Bridge::new(config).await {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!("❌ 桥接器初始化失败: {}", e);
            tracing::error!("💡 请检查 Redis 连接与配置后重试");
            process::exit(1);
        }
    };

    // 运行桥接器
    if let Err(e) = bridge.run().await {
        tracing::error!("❌ 桥接器运行失败: {}", e);
        tracing::error!("💡 桥接器将退出");
        process::exit(1);
    }

    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    let default_config = r#"# Pigeonhole 配置文件
# 此文件由 pigeonhole generate-config 生成

[broker]
host = "localhost"
port = 1883
client_id = "pigeonhole-bridge"
keep_alive_secs = 60
qos = 1

[store]
url = "redis://127.0.0.1:6379"
pool_size = 10
command_timeout_ms = 2000
buffer_namespace = "unsent"
# buffer_ttl_secs = 604800
retry_max = 3
retry_base_ms = 100

[topics]
data_namespace = "sensor"
ack_namespace = "ack"
liveness_namespace = "liveness"
replay_subtopic = "replay"

[delivery]
# 缓冲纪律: "append-ordered"（有序重放全部）或 "replace-latest"（只留最新值）
discipline = "append-ordered"
# 清理时机: "explicit"（等确认，at-least-once）或 "clear-on-replay"（best-effort-once）
ack_mode = "explicit"
ack_on_forward = false

registry_capacity = 10000
worker_idle_secs = 300
stats_interval_secs = 60
log_level = "info"
"#;

    fs::write(path, default_config).with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = BridgeConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - Broker: {}:{}", config.broker.host, config.broker.port);
    println!("  - Redis: {}", config.store.url);
    println!("  - Discipline: {:?}", config.delivery.discipline);
    println!("  - Ack Mode: {:?}", config.delivery.ack_mode);

    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(cli: &Cli) -> Result<()> {
    let config = BridgeConfig::load(cli).context("加载配置失败")?;

    println!("📊 最终配置（合并后的配置）:");
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}
