use crate::admission::AdmissionController;
use crate::config::ListenerSpec;
use crate::error::{ForwarderError, Result};
use crate::session::{Session, SessionSettings};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 监听队列长度
const LISTEN_BACKLOG: i32 = 1024;

/// 全局会话编号（仅用于日志关联）
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 已绑定的监听端点及其目标
pub struct Listener {
    listener: TcpListener,
    target: SocketAddr,
}

impl Listener {
    /// 绑定监听端点，必须在运行时上下文中调用
    pub fn bind(spec: &ListenerSpec) -> Result<Self> {
        let listener = bind_socket(spec.listen)
            .map_err(|e| ForwarderError::bind_failed(spec.listen, e))?;

        Ok(Self {
            listener,
            target: spec.target,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

fn bind_socket(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    // "::" 同时接受 IPv4 映射地址
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// 管理所有监听端点的 accept 循环
pub struct ListenerManager {
    listeners: Vec<Listener>,
    admission: AdmissionController,
    settings: Arc<SessionSettings>,
}

impl ListenerManager {
    /// 绑定全部监听端点；任何一个失败都会使整体失败
    pub fn bind(
        specs: &[ListenerSpec],
        admission: AdmissionController,
        settings: Arc<SessionSettings>,
    ) -> Result<Self> {
        let mut listeners = Vec::with_capacity(specs.len());
        for spec in specs {
            let listener = Listener::bind(spec)?;
            info!(
                "Listening on {} (forwarding to {})",
                listener.local_addr()?,
                spec.target
            );
            listeners.push(listener);
        }

        Ok(Self {
            listeners,
            admission,
            settings,
        })
    }

    /// 实际绑定的地址（按配置顺序）
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listeners.iter().map(Listener::local_addr).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// 为每个监听端点启动独立的 accept 循环
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let Self {
            listeners,
            admission,
            settings,
        } = self;

        listeners
            .into_iter()
            .map(|listener| {
                let admission = admission.clone();
                let settings = Arc::clone(&settings);
                tokio::spawn(accept_loop(listener, admission, settings))
            })
            .collect()
    }
}

/// accept 循环：accept 错误只记录，不会终止循环
async fn accept_loop(
    listener: Listener,
    admission: AdmissionController,
    settings: Arc<SessionSettings>,
) {
    loop {
        match listener.listener.accept().await {
            Ok((inbound, peer_addr)) => {
                let Some(guard) = admission.try_acquire() else {
                    warn!(
                        "Max connections ({}) reached, rejecting connection from {}",
                        admission.max_connections(),
                        peer_addr
                    );
                    drop(inbound);
                    continue;
                };

                let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Accepted connection from {} as session {} (target {})",
                    peer_addr, id, listener.target
                );

                Session::new(
                    id,
                    inbound,
                    listener.target,
                    Arc::clone(&settings),
                    guard,
                )
                .start();
            }
            Err(e) => {
                error!("Accept error on {}: {}", listener.target, e);
            }
        }
    }
}
