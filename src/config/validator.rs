use crate::error::{ForwarderError, Result};
use std::collections::HashSet;
use std::net::IpAddr;

use super::{AppConfig, PortRange, MAX_LOG_QUEUE_CAPACITY};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            return Err(ForwarderError::config_error(format!(
                "{}: port cannot be 0",
                context
            )));
        }
        Ok(())
    }

    /// 验证地址为 IP 字面量
    pub fn validate_address(addr: &str, context: &str) -> Result<IpAddr> {
        let trimmed = addr.trim();
        if trimmed.is_empty() {
            return Err(ForwarderError::config_error(format!(
                "{}: address cannot be empty",
                context
            )));
        }
        trimmed.parse::<IpAddr>().map_err(|_| {
            ForwarderError::config_error(format!(
                "{}: '{}' is not a valid IPv4 or IPv6 address",
                context, addr
            ))
        })
    }

    /// 验证端口范围及其目标端口映射
    pub fn validate_port_range(range: &PortRange, target_base: u16) -> Result<()> {
        if range.start > range.end {
            return Err(ForwarderError::config_error(format!(
                "port_range: start ({}) must not be greater than end ({})",
                range.start, range.end
            )));
        }
        Self::validate_port(range.start, "port_range.start")?;
        Self::validate_port(target_base, "target_port")?;

        let last_target = target_base as u32 + (range.end - range.start) as u32;
        if last_target > u16::MAX as u32 {
            return Err(ForwarderError::config_error(format!(
                "port_range {}-{} mapped from target port {} exceeds 65535",
                range.start, range.end, target_base
            )));
        }
        Ok(())
    }

    /// 验证完整的应用配置
    pub fn validate_app_config(config: &AppConfig) -> Result<()> {
        if config.forwarders.is_empty() {
            return Err(ForwarderError::config_error(
                "'forwarders' must contain at least one entry",
            ));
        }

        if config.buffer_size == 0 {
            return Err(ForwarderError::config_error(
                "buffer_size must be greater than 0",
            ));
        }

        if config.thread_pool.threads == 0 {
            return Err(ForwarderError::config_error(
                "thread_pool.threads must be greater than 0",
            ));
        }

        if config.logging.enabled && config.logging.file.as_os_str().is_empty() {
            return Err(ForwarderError::config_error(
                "logging.file cannot be empty when logging is enabled",
            ));
        }

        if config.logging.queue_capacity == 0 {
            return Err(ForwarderError::config_error(
                "logging.queue_capacity must be greater than 0",
            ));
        }

        if config.logging.queue_capacity > MAX_LOG_QUEUE_CAPACITY {
            return Err(ForwarderError::config_error(format!(
                "logging.queue_capacity must not exceed {}",
                MAX_LOG_QUEUE_CAPACITY
            )));
        }

        if config.health_check.enabled && config.health_check.interval == 0 {
            return Err(ForwarderError::config_error(
                "health_check.interval must be greater than 0",
            ));
        }

        // 展开后的监听端点必须唯一
        let mut seen = HashSet::new();
        for spec in config.listener_specs()? {
            if !seen.insert(spec.listen) {
                return Err(ForwarderError::config_error(format!(
                    "Duplicate listen endpoint {}: each listener must use a different address/port",
                    spec.listen
                )));
            }
        }

        Ok(())
    }

    /// 合法但可疑的配置项
    ///
    /// 加载配置时日志尚未初始化，所以这里只收集告警，由调用方在日志就绪后输出。
    pub fn collect_warnings(config: &AppConfig) -> Vec<String> {
        let mut warnings = Vec::new();
        if config.max_connections == 0 {
            warnings.push(
                "max_connections is 0, every incoming connection will be rejected".to_string(),
            );
        }
        if config.retry_attempts == 0 {
            warnings.push(
                "retry_attempts is 0, no connection to any target will be attempted".to_string(),
            );
        }
        warnings
    }
}
