/// 异步日志
///
/// 日志事件经 `tracing` 格式化后进入有界队列，由一个专用线程按 FIFO 顺序写入文件。
/// 入队永不阻塞调用方：队列满时丢弃新消息并计数，
/// 写入线程会在下一条成功投递的日志前补写一条丢弃提示。
/// 关闭时写入线程会写完队列中剩余的消息再退出。
use crate::config::{LoggingConfig, MAX_LOG_QUEUE_CAPACITY};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;

/// 解析日志级别；ALL 与无法识别的值均视为 TRACE
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => LevelFilter::TRACE,
        "DEBUG" => LevelFilter::DEBUG,
        "INFO" => LevelFilter::INFO,
        "WARN" => LevelFilter::WARN,
        "ERROR" => LevelFilter::ERROR,
        _ => LevelFilter::TRACE,
    }
}

/// 控制台输出级别（-v 次数）
fn console_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::OFF,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// 等待写入线程排空队列的最长时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// 队列中的条目
#[derive(Debug)]
enum LogEvent {
    Message(Vec<u8>),
    /// 写完已入队的消息后退出
    Shutdown,
}

/// 日志队列的生产端，可被 `tracing_subscriber` 当作写入器使用
#[derive(Debug, Clone)]
pub struct AsyncLogWriter {
    tx: mpsc::Sender<LogEvent>,
    dropped: Arc<AtomicU64>,
}

impl AsyncLogWriter {
    /// 因队列满被丢弃的消息数（尚未报告的部分）
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Write for AsyncLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tx.try_send(LogEvent::Message(buf.to_vec())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            // 写入线程已退出，静默丢弃
            Err(TrySendError::Closed(_)) => {}
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for AsyncLogWriter {
    type Writer = AsyncLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// 日志写入线程句柄
///
/// 全局订阅者会一直持有 `AsyncLogWriter`，队列不会自然关闭，
/// 所以退出前需要调用 `shutdown()`（或丢弃句柄）通知写入线程排空队列。
#[derive(Debug)]
pub struct LogWorker {
    tx: mpsc::Sender<LogEvent>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LogWorker {
    /// 通知写入线程写完剩余消息并等待其退出
    ///
    /// 在超时时间内完成时返回 `true`。
    pub fn shutdown(mut self) -> bool {
        self.stop(SHUTDOWN_TIMEOUT)
    }

    fn stop(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;

        // 队列满时等待写入线程腾出位置
        loop {
            match self.tx.try_send(LogEvent::Shutdown) {
                Ok(()) | Err(TrySendError::Closed(_)) => break,
                Err(TrySendError::Full(_)) => {
                    if Instant::now() >= deadline {
                        eprintln!("Logging error: log queue did not drain before shutdown");
                        return false;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        while !handle.is_finished() {
            if Instant::now() >= deadline {
                eprintln!("Logging error: log writer thread did not stop in time");
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if handle.join().is_err() {
            eprintln!("Logging error: log writer thread panicked");
        }
        true
    }
}

impl Drop for LogWorker {
    fn drop(&mut self) {
        self.stop(SHUTDOWN_TIMEOUT);
    }
}

/// 文件日志接收端
pub struct AsyncLogSink;

impl AsyncLogSink {
    /// 以追加方式打开日志文件并启动写入线程
    pub fn open(path: &Path, capacity: usize) -> io::Result<(AsyncLogWriter, LogWorker)> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (writer, rx) = Self::channel(capacity);
        let dropped = Arc::clone(&writer.dropped);
        let tx = writer.tx.clone();

        let handle = thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                run_consumer(rx, &mut out, &dropped);
            })?;

        Ok((
            writer,
            LogWorker {
                tx,
                handle: Some(handle),
            },
        ))
    }

    fn channel(capacity: usize) -> (AsyncLogWriter, mpsc::Receiver<LogEvent>) {
        let (tx, rx) = mpsc::channel(capacity.clamp(1, MAX_LOG_QUEUE_CAPACITY));
        (
            AsyncLogWriter {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }
}

/// 写入线程主循环：一次取完当前积压的消息后再 flush
///
/// 收到 `Shutdown` 或所有发送端都被丢弃时退出，退出前写完队列中剩余的消息。
fn run_consumer<W: Write>(mut rx: mpsc::Receiver<LogEvent>, out: &mut W, dropped: &AtomicU64) {
    let mut stopping = false;

    while let Some(event) = rx.blocking_recv() {
        let LogEvent::Message(message) = event else {
            break;
        };
        report_dropped(out, dropped);
        write_message(out, &message);

        while let Ok(event) = rx.try_recv() {
            match event {
                LogEvent::Message(message) => write_message(out, &message),
                LogEvent::Shutdown => {
                    stopping = true;
                    break;
                }
            }
        }

        if let Err(e) = out.flush() {
            eprintln!("Logging error: {}", e);
        }
        if stopping {
            break;
        }
    }

    // 拒绝新消息，已入队的照常写出
    rx.close();
    report_dropped(out, dropped);
    while let Ok(event) = rx.try_recv() {
        if let LogEvent::Message(message) = event {
            write_message(out, &message);
        }
    }
    if let Err(e) = out.flush() {
        eprintln!("Logging error: {}", e);
    }
}

fn report_dropped<W: Write>(out: &mut W, dropped: &AtomicU64) {
    let count = dropped.swap(0, Ordering::Relaxed);
    if count > 0 {
        let notice = format!(" WARN {} log message(s) dropped: log queue full\n", count);
        write_message(out, notice.as_bytes());
    }
}

fn write_message<W: Write>(out: &mut W, message: &[u8]) {
    if let Err(e) = out.write_all(message) {
        eprintln!("Logging error: {}", e);
    }
}

/// 初始化全局日志
///
/// 启用文件日志时返回写入线程句柄，调用方需持有到进程结束。
/// `RUST_LOG` 可覆盖文件日志的级别。
pub fn init_logging(config: &LoggingConfig, verbosity: u8) -> Option<LogWorker> {
    let mut worker = None;

    let file_layer = if config.enabled {
        match AsyncLogSink::open(&config.file, config.queue_capacity) {
            Ok((writer, log_worker)) => {
                worker = Some(log_worker);
                let filter = EnvFilter::builder()
                    .with_default_directive(parse_level(&config.level).into())
                    .from_env_lossy();
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(false)
                        .with_filter(filter),
                )
            }
            Err(e) => {
                eprintln!(
                    "Opening log file {} failed: {}, file logging disabled",
                    config.file.display(),
                    e
                );
                None
            }
        }
    } else {
        None
    };

    let console_layer = (verbosity > 0).then(|| {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_filter(console_level(verbosity))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    worker
}
