use anyhow::{Context, Result};
use clap::Parser;
use sni_tunnel::cli::Options;
use sni_tunnel::config::{DnsProxyConfig, SniProxyConfig};
use sni_tunnel::dns::DnsProxy;
use sni_tunnel::proxy::SniProxy;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();

    init_logging(&options)?;

    info!("sni-tunnel v{}", env!("CARGO_PKG_VERSION"));

    // 打印生效的配置
    let rendered =
        serde_json::to_string_pretty(&options).context("failed to render configuration")?;
    info!("running with the following configuration:\n{}", rendered);

    let dns_config = DnsProxyConfig::from_options(&options)?;
    let proxy_config = SniProxyConfig::from_options(&options)?;

    let cancel = CancellationToken::new();

    // 监听端口在进入服务循环之前绑定，失败直接算启动失败
    let dns_proxy = DnsProxy::bind(dns_config).await?;
    let sni_proxy = SniProxy::bind(proxy_config, cancel.child_token()).await?;

    let dns_task = tokio::spawn(dns_proxy.run(cancel.child_token()));
    let proxy_task = tokio::spawn(sni_proxy.run());

    // 等待退出信号。取消信号只关闭监听循环，在途会话不作等待
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, stopping");

    cancel.cancel();
    let _ = tokio::join!(dns_task, proxy_task);

    info!("stopped");
    Ok(())
}

/// Initialize the tracing subscriber from command line options
fn init_logging(options: &Options) -> Result<()> {
    let level = if options.verbose { "debug" } else { "info" };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_target(false);

    match &options.output {
        Some(path) => {
            let file = open_log_file(path)?;
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }

    Ok(())
}

/// 以追加方式打开日志文件，新文件权限为 0600
fn open_log_file(path: &Path) -> Result<File> {
    let mut open_options = OpenOptions::new();
    open_options.create(true).append(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open_options.mode(0o600);
    }

    open_options
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))
}
