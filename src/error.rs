/// 自定义错误类型
///
/// 启动期错误（配置、绑定）是致命的，会一直传播到进程入口；
/// 会话期错误（连接重试耗尽、读写失败）只终止所属会话。
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// TCP Forwarder 的主要错误类型
#[derive(Error, Debug)]
pub enum ForwarderError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 监听端口绑定失败
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 连接目标失败且重试次数已耗尽
    #[error("Failed to connect to {addr} after {attempts} attempt(s)")]
    ConnectExhausted {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: Option<io::Error>,
    },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ForwarderError>;

impl ForwarderError {
    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建绑定失败错误
    pub fn bind_failed(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }

    /// 创建重试耗尽错误
    pub fn connect_exhausted(addr: SocketAddr, attempts: u32, source: Option<io::Error>) -> Self {
        Self::ConnectExhausted {
            addr,
            attempts,
            source,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_bind_error(&self) -> bool {
        matches!(self, Self::Bind { .. })
    }

    pub fn is_connect_exhausted(&self) -> bool {
        matches!(self, Self::ConnectExhausted { .. })
    }
}
