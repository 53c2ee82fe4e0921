use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::process::ExitCode;
use tcp_forwarder::cli::Cli;
use tcp_forwarder::{logging, AppConfig, Forwarder};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.template {
        print!("{}", AppConfig::template());
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}\n", e);
            let _ = Cli::command().print_help();
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config_path = cli
        .config
        .as_deref()
        .context("Please provide the path to the configuration file")?;

    let config = AppConfig::load(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    if cli.check {
        return check_config(config_path, &config);
    }

    let log_worker = logging::init_logging(&config.logging, cli.verbose);

    info!("TCP Forwarder v{}", env!("CARGO_PKG_VERSION"));
    for warning in config.warnings() {
        warn!("{}", warning);
    }
    info!(
        "Starting runtime with {} worker thread(s)",
        config.thread_pool.threads
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_pool.threads)
        .thread_name("forwarder-worker")
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let result = runtime.block_on(async {
        let forwarder = Forwarder::start(&config).context("Failed to start forwarder")?;
        forwarder.run_until_shutdown().await?;
        Ok::<_, anyhow::Error>(())
    });
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    drop(runtime);

    // 写完队列中剩余的日志再退出
    if let Some(worker) = log_worker {
        worker.shutdown();
    }
    result
}

/// Check configuration file format
fn check_config(config_path: &str, config: &AppConfig) -> Result<()> {
    println!("Checking configuration file: {}\n", config_path);

    let forwarder = config.forwarder();
    println!("✓ Buffer size: {} bytes", forwarder.buffer_size);
    println!("✓ TCP nodelay: {}", forwarder.tcp_no_delay);
    println!(
        "✓ Retry: {} attempt(s), {}s apart",
        forwarder.retry_attempts, forwarder.retry_delay
    );
    println!("✓ Max connections: {}", forwarder.max_connections);
    println!("✓ Worker threads: {}", config.thread_pool.threads);

    if config.logging.enabled {
        println!(
            "✓ Logging: {:?} (level {})",
            config.logging.file, config.logging.level
        );
    } else {
        println!("✓ Logging: disabled");
    }

    if config.health_check.enabled {
        println!("✓ Health check: every {}s", config.health_check.interval);
    } else {
        println!("✓ Health check: disabled");
    }

    for warning in config.warnings() {
        println!("⚠ {}", warning);
    }

    let specs = config.listener_specs()?;
    println!("✓ Number of listeners: {}", specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        println!("  Listener #{}: {} -> {}", idx + 1, spec.listen, spec.target);
    }

    println!("\n✓ Configuration is valid!");
    Ok(())
}
