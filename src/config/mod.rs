// 配置管理模块 - 加载、默认值与端口范围展开

mod validator;

pub use validator::ConfigValidator;

use crate::error::{ForwarderError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 异步日志队列容量上限
pub const MAX_LOG_QUEUE_CAPACITY: usize = 1 << 20;

/// 内置的示例配置
const CONFIG_TEMPLATE: &str = include_str!("../../templates/forwarder.toml");

/// 连续端口范围（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// 范围内的端口数量（start > end 时为 0）
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 单条转发规则
///
/// 单端口形式：`listen_port` + `target_port`。
/// 范围形式：`port_range`，`target_port` 作为目标起始端口（缺省与 `start` 相同）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRule {
    /// 本地监听地址（IPv4 或 IPv6 字面量）
    pub listen_address: String,
    /// 本地监听端口
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// 目标地址（IPv4 或 IPv6 字面量）
    pub target_address: String,
    /// 目标端口；范围形式下为目标起始端口
    #[serde(default)]
    pub target_port: Option<u16>,
    /// 监听端口范围
    #[serde(default)]
    pub port_range: Option<PortRange>,
}

/// 展开后的监听/目标端点对
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerSpec {
    pub listen: SocketAddr,
    pub target: SocketAddr,
}

impl ForwardRule {
    /// 创建单端口规则
    pub fn single(
        listen_address: impl Into<String>,
        listen_port: u16,
        target_address: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            listen_address: listen_address.into(),
            listen_port: Some(listen_port),
            target_address: target_address.into(),
            target_port: Some(target_port),
            port_range: None,
        }
    }

    /// 创建端口范围规则
    pub fn range(
        listen_address: impl Into<String>,
        range: PortRange,
        target_address: impl Into<String>,
        target_base: Option<u16>,
    ) -> Self {
        Self {
            listen_address: listen_address.into(),
            listen_port: None,
            target_address: target_address.into(),
            target_port: target_base,
            port_range: Some(range),
        }
    }

    /// 将规则展开为独立的监听/目标端点对
    ///
    /// 范围规则产生 `end - start + 1` 个端点对，目标端口为 `target_base + offset`。
    pub fn expand(&self) -> Result<Vec<ListenerSpec>> {
        let listen_ip = ConfigValidator::validate_address(&self.listen_address, "listen_address")?;
        let target_ip = ConfigValidator::validate_address(&self.target_address, "target_address")?;

        match (self.listen_port, self.port_range) {
            (Some(listen_port), None) => {
                let target_port = self.target_port.ok_or_else(|| {
                    ForwarderError::config_error(format!(
                        "Forwarder {}:{}: target_port must be specified",
                        self.listen_address, listen_port
                    ))
                })?;
                ConfigValidator::validate_port(listen_port, "listen_port")?;
                ConfigValidator::validate_port(target_port, "target_port")?;

                Ok(vec![ListenerSpec {
                    listen: SocketAddr::new(listen_ip, listen_port),
                    target: SocketAddr::new(target_ip, target_port),
                }])
            }
            (None, Some(range)) => {
                let target_base = self.target_port.unwrap_or(range.start);
                ConfigValidator::validate_port_range(&range, target_base)?;

                let specs = (0..=(range.end - range.start))
                    .map(|offset| ListenerSpec {
                        listen: SocketAddr::new(listen_ip, range.start + offset),
                        target: SocketAddr::new(target_ip, target_base + offset),
                    })
                    .collect();
                Ok(specs)
            }
            (Some(_), Some(_)) => Err(ForwarderError::config_error(format!(
                "Forwarder on {}: listen_port and port_range are mutually exclusive",
                self.listen_address
            ))),
            (None, None) => Err(ForwarderError::config_error(format!(
                "Forwarder on {}: either listen_port or port_range must be specified",
                self.listen_address
            ))),
        }
    }
}

/// 转发核心参数（对进程生命周期不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    /// 每个方向的缓冲区大小（字节）
    pub buffer_size: usize,
    /// 是否禁用 Nagle 算法
    pub tcp_no_delay: bool,
    /// 连接目标的最大尝试次数
    pub retry_attempts: u32,
    /// 两次连接尝试之间的间隔（秒）
    pub retry_delay: u64,
    /// 最大并发会话数
    pub max_connections: usize,
}

impl ForwarderConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            tcp_no_delay: true,
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            max_connections: default_max_connections(),
        }
    }
}

/// 工作线程池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    /// 运行时工作线程数
    pub threads: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 是否写入日志文件
    pub enabled: bool,
    /// 日志文件路径（追加写入）
    pub file: PathBuf,
    /// 日志级别：TRACE, DEBUG, INFO, WARN, ERROR, ALL
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 异步日志队列容量（条），上限为 `MAX_LOG_QUEUE_CAPACITY`
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// 心跳配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// 心跳间隔（秒）
    pub interval: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 转发规则列表
    pub forwarders: Vec<ForwardRule>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_true")]
    pub tcp_no_delay: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    pub thread_pool: ThreadPoolConfig,
    pub logging: LoggingConfig,
    pub health_check: HealthCheckConfig,
}

fn default_buffer_size() -> usize {
    8192
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_max_connections() -> usize {
    100
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_queue_capacity() -> usize {
    8192
}

impl AppConfig {
    /// 从文件加载并验证配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ForwarderError::config_error(format!(
                "Failed to read configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 文本解析并验证配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content).map_err(|e| {
            ForwarderError::config_error(format!("Failed to parse configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_app_config(self)
    }

    /// 合法但可能不符合预期的配置项说明
    pub fn warnings(&self) -> Vec<String> {
        ConfigValidator::collect_warnings(self)
    }

    /// 转发核心参数
    pub fn forwarder(&self) -> ForwarderConfig {
        ForwarderConfig {
            buffer_size: self.buffer_size,
            tcp_no_delay: self.tcp_no_delay,
            retry_attempts: self.retry_attempts,
            retry_delay: self.retry_delay,
            max_connections: self.max_connections,
        }
    }

    /// 按规则顺序展开所有监听端点
    pub fn listener_specs(&self) -> Result<Vec<ListenerSpec>> {
        let mut specs = Vec::new();
        for rule in &self.forwarders {
            specs.extend(rule.expand()?);
        }
        Ok(specs)
    }

    /// 示例配置文本
    pub fn template() -> &'static str {
        CONFIG_TEMPLATE
    }
}
