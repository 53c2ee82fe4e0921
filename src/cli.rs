use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tcp-forwarder")]
#[command(
    author,
    version,
    about = "Forward TCP traffic from local ports to target addresses",
    long_about = "Forwards TCP traffic from local ports (or contiguous port ranges) to target \
addresses. Supports IPv4 and IPv6, connection limits, connect retries and a periodic health \
heartbeat. The configuration file is TOML; run with --template to print an example."
)]
pub struct Cli {
    /// 配置文件路径
    #[arg(required_unless_present = "template")]
    pub config: Option<String>,

    /// 控制台日志详细程度 (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// 只检查配置文件并列出展开后的监听端点
    #[arg(long)]
    pub check: bool,

    /// 输出示例配置
    #[arg(long, conflicts_with = "check")]
    pub template: bool,
}
