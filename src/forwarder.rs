use crate::admission::AdmissionController;
use crate::config::AppConfig;
use crate::error::Result;
use crate::health::HealthScheduler;
use crate::listener::ListenerManager;
use crate::session::SessionSettings;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// 运行中的转发器：所有监听端点已绑定，accept 循环与心跳已启动
pub struct Forwarder {
    admission: AdmissionController,
    local_addrs: Vec<SocketAddr>,
    health: Option<HealthScheduler>,
    tasks: Vec<JoinHandle<()>>,
}

impl Forwarder {
    /// 绑定全部监听端点并开始服务
    ///
    /// 任意一个端点绑定失败都会返回错误，此时不会开始服务。
    pub fn start(config: &AppConfig) -> Result<Self> {
        trace!("Initiating TCP forwarder");

        let forwarder_config = config.forwarder();
        let settings = Arc::new(SessionSettings::from(&forwarder_config));
        let admission = AdmissionController::new(forwarder_config.max_connections);
        let specs = config.listener_specs()?;

        let manager = ListenerManager::bind(&specs, admission.clone(), settings)?;
        let local_addrs = manager.local_addrs()?;
        let mut tasks = manager.spawn();

        let health = if config.health_check.enabled {
            let scheduler = HealthScheduler::new(config.health_check.interval());
            tasks.push(scheduler.spawn());
            Some(scheduler)
        } else {
            None
        };

        info!(
            "TCP forwarder serving {} listener(s), max {} connection(s)",
            local_addrs.len(),
            admission.max_connections()
        );

        Ok(Self {
            admission,
            local_addrs,
            health,
            tasks,
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn health(&self) -> Option<&HealthScheduler> {
        self.health.as_ref()
    }

    /// 运行直到收到 Ctrl+C，然后直接终止所有任务（不等待会话排空）
    pub async fn run_until_shutdown(self) -> Result<()> {
        info!("Waiting for connections... (Press Ctrl+C to stop)");
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal, stopping forwarder...");
        self.shutdown().await;
        Ok(())
    }

    /// 终止 accept 循环与心跳任务，不等待
    pub fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// 终止所有任务并等待它们退出，返回后监听端口已释放
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }

        let results = join_all(self.tasks).await;
        let cancelled = results
            .iter()
            .filter(|result| matches!(result, Err(e) if e.is_cancelled()))
            .count();
        debug!("{} of {} task(s) cancelled", cancelled, results.len());
    }
}
