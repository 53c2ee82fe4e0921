/// 单连接会话：Connecting → Forwarding → Closed
///
/// 连接目标（带重试）成功后，启动两个独立的半双工复制任务，
/// 任一方向遇到 EOF 或错误都会触发共享的幂等关闭动作。
use crate::admission::AdmissionGuard;
use crate::config::ForwarderConfig;
use crate::error::{ForwarderError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// 会话参数（由 ForwarderConfig 派生，所有会话共享）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub buffer_size: usize,
    pub tcp_no_delay: bool,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&ForwarderConfig> for SessionSettings {
    fn from(config: &ForwarderConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            tcp_no_delay: config.tcp_no_delay,
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay(),
        }
    }
}

/// 会话状态
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionState {
    Connecting,
    Forwarding,
    Closed,
}

/// 复制方向
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Direction {
    /// 客户端 → 目标
    Upstream,
    /// 目标 → 客户端
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "client -> target"),
            Direction::Downstream => write!(f, "target -> client"),
        }
    }
}

/// 会话结束时的汇总
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: u64,
    pub target: SocketAddr,
    pub state: SessionState,
    /// 实际发起的连接尝试次数
    pub connect_attempts: u32,
    /// 是否进入过 Forwarding 状态
    pub forwarded: bool,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

/// 两个复制任务共享的幂等关闭动作
///
/// 只有第一次调用 `close()` 真正生效，之后的调用都是空操作。
/// 关闭会取消另一方向上挂起的读写，被取消的操作不视为错误。
#[derive(Debug, Clone, Default)]
pub struct Teardown {
    closed: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭，仅当本次调用执行了关闭时返回 `true`
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 等待关闭被触发
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// 半双工复制循环：读满一次、写完、再读，读写严格交替
///
/// 返回成功写出的字节数。
pub async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    teardown: Teardown,
    session_id: u64,
    direction: Direction,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = teardown.closed() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Session {} ({}): source reached EOF", session_id, direction);
                    teardown.close();
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    error!("Session {} ({}): read error: {}", session_id, direction, e);
                    teardown.close();
                    break;
                }
            }
        };

        debug!(
            "Session {} ({}): read {} bytes from source",
            session_id, direction, n
        );

        tokio::select! {
            biased;
            _ = teardown.closed() => break,
            result = writer.write_all(&buf[..n]) => match result {
                Ok(()) => {
                    total += n as u64;
                    trace!("Session {} ({}): data forwarded", session_id, direction);
                }
                Err(e) => {
                    error!("Session {} ({}): write error: {}", session_id, direction, e);
                    teardown.close();
                    break;
                }
            }
        }
    }

    total
}

/// 单个入站连接的会话
pub struct Session {
    id: u64,
    inbound: TcpStream,
    target: SocketAddr,
    settings: Arc<SessionSettings>,
    state: SessionState,
    attempts: u32,
    guard: AdmissionGuard,
}

impl Session {
    /// 创建会话；入站连接的 TCP_NODELAY 在此处设置，与连接结果无关
    pub fn new(
        id: u64,
        inbound: TcpStream,
        target: SocketAddr,
        settings: Arc<SessionSettings>,
        guard: AdmissionGuard,
    ) -> Self {
        if let Err(e) = inbound.set_nodelay(settings.tcp_no_delay) {
            error!(
                "Session {}: failed to set TCP_NODELAY on incoming socket: {}",
                id, e
            );
        } else {
            trace!(
                "Session {}: TCP_NODELAY={} set on incoming socket",
                id,
                settings.tcp_no_delay
            );
        }

        debug!(
            "Session {} created. Active connections: {}",
            id,
            guard.active()
        );

        Self {
            id,
            inbound,
            target,
            settings,
            state: SessionState::Connecting,
            attempts: 0,
            guard,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 在运行时上启动会话，会话从此独立拥有自身资源
    pub fn start(self) -> JoinHandle<SessionReport> {
        tokio::spawn(self.run())
    }

    /// 运行完整的状态机直到 Closed
    pub async fn run(mut self) -> SessionReport {
        trace!("Session {}: starting, target {}", self.id, self.target);

        let outbound = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                // 重试耗尽：入站连接随会话一起释放
                error!("Session {}: {}", self.id, e);
                return self.close(false, 0, 0);
            }
        };

        self.state = SessionState::Forwarding;
        trace!("Session {}: starting data forwarding", self.id);

        let Session {
            id,
            inbound,
            target,
            settings,
            attempts,
            guard,
            ..
        } = self;

        let (bytes_upstream, bytes_downstream) =
            forward(id, inbound, outbound, settings.buffer_size).await;

        let report = SessionReport {
            id,
            target,
            state: SessionState::Closed,
            connect_attempts: attempts,
            forwarded: true,
            bytes_upstream,
            bytes_downstream,
        };
        drop(guard);
        info!(
            "Session {} closed: {} bytes to target, {} bytes to client",
            id, bytes_upstream, bytes_downstream
        );
        report
    }

    /// Connecting 状态：最多尝试 `retry_attempts` 次，每次失败后等待 `retry_delay`
    async fn connect(&mut self) -> Result<TcpStream> {
        let mut last_error = None;

        while self.attempts < self.settings.retry_attempts {
            if self.attempts > 0 {
                sleep(self.settings.retry_delay).await;
            }
            self.attempts += 1;

            trace!(
                "Session {}: attempting to connect to {} ({}/{})",
                self.id,
                self.target,
                self.attempts,
                self.settings.retry_attempts
            );

            match TcpStream::connect(self.target).await {
                Ok(stream) => {
                    info!("Session {}: connected to {}", self.id, self.target);
                    if let Err(e) = stream.set_nodelay(self.settings.tcp_no_delay) {
                        error!(
                            "Session {}: failed to set TCP_NODELAY on outgoing socket: {}",
                            self.id, e
                        );
                    } else {
                        trace!("Session {}: TCP_NODELAY set on outgoing socket", self.id);
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        "Session {}: connection attempt {} to {} failed: {}",
                        self.id, self.attempts, self.target, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(ForwarderError::connect_exhausted(
            self.target,
            self.attempts,
            last_error,
        ))
    }

    fn close(mut self, forwarded: bool, up: u64, down: u64) -> SessionReport {
        self.state = SessionState::Closed;
        let report = SessionReport {
            id: self.id,
            target: self.target,
            state: self.state,
            connect_attempts: self.attempts,
            forwarded,
            bytes_upstream: up,
            bytes_downstream: down,
        };
        // 先关闭套接字，再释放准入名额
        drop(self.inbound);
        drop(self.guard);
        debug!("Session {} destroyed", report.id);
        report
    }
}

/// Forwarding 状态：两个方向各自一个任务，都结束后会话才算关闭
async fn forward(
    id: u64,
    inbound: TcpStream,
    outbound: TcpStream,
    buffer_size: usize,
) -> (u64, u64) {
    let teardown = Teardown::new();
    let (inbound_read, inbound_write) = inbound.into_split();
    let (outbound_read, outbound_write) = outbound.into_split();

    let upstream = tokio::spawn(copy_half(
        inbound_read,
        outbound_write,
        buffer_size,
        teardown.clone(),
        id,
        Direction::Upstream,
    ));
    let downstream = tokio::spawn(copy_half(
        outbound_read,
        inbound_write,
        buffer_size,
        teardown.clone(),
        id,
        Direction::Downstream,
    ));

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    let upstream = upstream.unwrap_or_else(|e| {
        error!("Session {}: upstream task failed: {}", id, e);
        0
    });
    let downstream = downstream.unwrap_or_else(|e| {
        error!("Session {}: downstream task failed: {}", id, e);
        0
    });

    // 两个任务都已结束，四个半部都已释放
    teardown.close();
    info!("Session {}: sockets closed", id);
    (upstream, downstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Instant;
    use tokio::io::{duplex, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// 每次读取都返回连接重置
    struct ResetReader;

    impl AsyncRead for ResetReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "simulated reset",
            )))
        }
    }

    /// 记录每次写入长度的写端
    #[derive(Clone, Default)]
    struct RecordingWriter {
        writes: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn settings(retry_attempts: u32, retry_delay: Duration) -> Arc<SessionSettings> {
        Arc::new(SessionSettings {
            buffer_size: 4,
            tcp_no_delay: true,
            retry_attempts,
            retry_delay,
        })
    }

    /// 返回 (客户端, 服务端已接受的入站连接)
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn unreachable_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[test]
    fn test_teardown_closes_once() {
        let teardown = Teardown::new();
        assert!(!teardown.is_closed());
        assert!(teardown.close());
        assert!(!teardown.close());
        assert!(teardown.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_teardown_concurrent_close() {
        let teardown = Teardown::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let teardown = teardown.clone();
                tokio::spawn(async move { teardown.close() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_copy_half_relays_bytes_in_small_chunks() {
        let (mut source, source_peer) = duplex(64);
        let (dest_peer, mut dest) = duplex(64);
        let teardown = Teardown::new();

        let copier = tokio::spawn(copy_half(
            source_peer,
            dest_peer,
            4,
            teardown.clone(),
            1,
            Direction::Upstream,
        ));

        source.write_all(b"ABCDE").await.unwrap();
        drop(source);

        let mut received = Vec::new();
        dest.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"ABCDE");
        assert_eq!(copier.await.unwrap(), 5);
        assert!(teardown.is_closed());
    }

    #[tokio::test]
    async fn test_writes_never_exceed_buffer_size() {
        let writer = RecordingWriter::default();
        let teardown = Teardown::new();

        let total = copy_half(
            &b"ABCDE"[..],
            writer.clone(),
            4,
            teardown.clone(),
            4,
            Direction::Upstream,
        )
        .await;

        let writes = writer.writes.lock().unwrap().clone();
        assert_eq!(total, 5);
        assert!(writes.iter().all(|chunk| chunk.len() <= 4));
        assert_eq!(writes.concat(), b"ABCDE");
        assert!(teardown.is_closed());
    }

    #[tokio::test]
    async fn test_eof_stops_sibling_loop() {
        let (client, client_peer) = duplex(64);
        let (target_peer, _target) = duplex(64);
        let (client_read, client_write) = tokio::io::split(client_peer);
        let (target_read, target_write) = tokio::io::split(target_peer);
        let teardown = Teardown::new();

        let upstream = tokio::spawn(copy_half(
            client_read,
            target_write,
            8,
            teardown.clone(),
            2,
            Direction::Upstream,
        ));
        let downstream = tokio::spawn(copy_half(
            target_read,
            client_write,
            8,
            teardown.clone(),
            2,
            Direction::Downstream,
        ));

        // 客户端关闭，目标端保持沉默：下行循环必须因关闭动作而退出
        drop(client);

        let result = timeout(Duration::from_secs(2), async {
            (upstream.await.unwrap(), downstream.await.unwrap())
        })
        .await
        .expect("both loops should stop");
        assert_eq!(result, (0, 0));
        assert!(teardown.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_both_directions_failing_close_once() {
        let teardown = Teardown::new();
        let (sink_a, _keep_a) = duplex(64);
        let (sink_b, _keep_b) = duplex(64);

        let a = tokio::spawn(copy_half(
            ResetReader,
            sink_a,
            8,
            teardown.clone(),
            3,
            Direction::Upstream,
        ));
        let b = tokio::spawn(copy_half(
            ResetReader,
            sink_b,
            8,
            teardown.clone(),
            3,
            Direction::Downstream,
        ));

        assert_eq!(a.await.unwrap(), 0);
        assert_eq!(b.await.unwrap(), 0);
        assert!(teardown.is_closed());
        // 已关闭后再次关闭是空操作
        assert!(!teardown.close());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_closes_inbound_and_releases() {
        let admission = AdmissionController::new(1);
        let (mut client, inbound) = tcp_pair().await;
        let target = unreachable_addr().await;
        let delay = Duration::from_millis(50);

        let session = Session::new(
            7,
            inbound,
            target,
            settings(3, delay),
            admission.try_acquire().unwrap(),
        );
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(admission.active(), 1);

        let started = Instant::now();
        let report = session.run().await;

        assert_eq!(report.connect_attempts, 3);
        assert!(!report.forwarded);
        assert_eq!(report.state, SessionState::Closed);
        assert!(started.elapsed() >= delay * 2);
        assert_eq!(admission.active(), 0);

        // 入站连接已关闭
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("inbound should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_zero_retry_attempts_never_connects() {
        let admission = AdmissionController::new(1);
        let (_client, inbound) = tcp_pair().await;
        let target = unreachable_addr().await;

        let report = Session::new(
            8,
            inbound,
            target,
            settings(0, Duration::from_secs(5)),
            admission.try_acquire().unwrap(),
        )
        .run()
        .await;

        assert_eq!(report.connect_attempts, 0);
        assert!(!report.forwarded);
        assert_eq!(admission.active(), 0);
    }

    #[tokio::test]
    async fn test_session_relays_both_directions() {
        let admission = AdmissionController::new(4);
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        let (mut client, inbound) = tcp_pair().await;

        let handle = Session::new(
            9,
            inbound,
            target_addr,
            settings(3, Duration::from_millis(10)),
            admission.try_acquire().unwrap(),
        )
        .start();

        let (mut target, _) = target_listener.accept().await.unwrap();

        client.write_all(b"hello target").await.unwrap();
        let mut buf = vec![0u8; 12];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello target");

        target.write_all(b"hello client").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");

        drop(client);
        let report = timeout(Duration::from_secs(2), handle)
            .await
            .expect("session should close")
            .unwrap();

        assert!(report.forwarded);
        assert_eq!(report.connect_attempts, 1);
        assert_eq!(report.bytes_upstream, 12);
        assert_eq!(report.bytes_downstream, 12);
        assert_eq!(admission.active(), 0);

        // 目标端看到连接关闭
        let n = target.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    /// 以 RST 方式关闭连接
    fn reset(stream: TcpStream) {
        socket2::SockRef::from(&stream)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(stream);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_both_peers_reset_release_once() {
        let admission = AdmissionController::new(4);
        // 额外占用一个名额，重复释放会让计数低于 1
        let other_guard = admission.try_acquire().unwrap();

        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        let (mut client, inbound) = tcp_pair().await;

        let handle = Session::new(
            10,
            inbound,
            target_addr,
            settings(1, Duration::from_millis(10)),
            admission.try_acquire().unwrap(),
        )
        .start();

        let (mut target, _) = target_listener.accept().await.unwrap();
        client.write_all(b"up").await.unwrap();
        let mut buf = [0u8; 2];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(admission.active(), 2);

        // 两端同时复位，两个方向都会以错误结束
        reset(client);
        reset(target);

        let report = timeout(Duration::from_secs(2), handle)
            .await
            .expect("session should close after both resets")
            .unwrap();

        assert!(report.forwarded);
        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(report.bytes_upstream, 2);
        assert_eq!(admission.active(), 1);

        drop(other_guard);
        assert_eq!(admission.active(), 0);
    }
}
