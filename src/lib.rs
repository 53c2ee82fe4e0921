/// TCP Forwarder 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod admission;
pub mod cli;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod listener;
pub mod logging;
pub mod session;

// 重新导出常用类型
pub use admission::{AdmissionController, AdmissionGuard};
pub use config::{AppConfig, ForwardRule, ForwarderConfig, ListenerSpec, PortRange};
pub use error::{ForwarderError, Result};
pub use forwarder::Forwarder;
pub use health::HealthScheduler;
pub use listener::ListenerManager;
pub use session::{Session, SessionReport, SessionSettings, SessionState, Teardown};
