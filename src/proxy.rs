/// SNI/Host 隧道引擎
///
/// 接收发往任意上游的 TCP 连接，先嗅探出目标主机名（TLS 连接读
/// ClientHello 的 SNI，明文 HTTP 连接读 Host 头），套用阻断/转发规则，
/// 再直连或经上游代理连到目标，把嗅探期间捕获的字节原样重放过去，
/// 之后双向搬运数据直到两个方向都结束。
use crate::config::SniProxyConfig;
use crate::error::TunnelError;
use crate::filter;
use crate::peek::{self, PeekedName};
use crate::rate_limiter::copy_shaped;
use crate::session::SessionContext;
use crate::upstream::{self, BoxedStream, ProxyDialer};
use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 嗅探阶段的读超时
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// 直连上游的连接超时
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// 明文 HTTP 连接的默认上游端口
const REMOTE_PORT_PLAIN: u16 = 80;

/// TLS 连接的默认上游端口
const REMOTE_PORT_TLS: u16 = 443;

/// SNI 代理服务器
pub struct SniProxy {
    engine: Arc<Engine>,
    tls_listener: TcpListener,
    http_listener: TcpListener,
    tls_addr: SocketAddr,
    http_addr: SocketAddr,
}

/// 各连接处理器共享的不可变状态
struct Engine {
    config: SniProxyConfig,
    proxy_dialer: Option<Arc<dyn ProxyDialer>>,
    cancel: CancellationToken,
}

impl SniProxy {
    /// 绑定两个监听端口，绑定失败即启动失败
    pub async fn bind(config: SniProxyConfig, cancel: CancellationToken) -> Result<Self> {
        let proxy_dialer = match &config.forward_proxy {
            Some(url) => Some(
                upstream::create_proxy_dialer(url)
                    .with_context(|| format!("sniproxy: failed to init forward-proxy {}", url))?,
            ),
            None => None,
        };

        let tls_listener = TcpListener::bind(config.tls_listen_addr)
            .await
            .with_context(|| format!("sniproxy: failed to bind {}", config.tls_listen_addr))?;
        let http_listener = TcpListener::bind(config.http_listen_addr)
            .await
            .with_context(|| format!("sniproxy: failed to bind {}", config.http_listen_addr))?;

        let tls_addr = tls_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        Ok(Self {
            engine: Arc::new(Engine {
                config,
                proxy_dialer,
                cancel,
            }),
            tls_listener,
            http_listener,
            tls_addr,
            http_addr,
        })
    }

    /// TLS 监听器实际绑定的地址
    pub fn tls_addr(&self) -> SocketAddr {
        self.tls_addr
    }

    /// HTTP 监听器实际绑定的地址
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// 运行两个接收循环，直到取消信号到达
    ///
    /// 关闭监听器只会终止接收循环，在途会话不受影响，自然排空
    pub async fn run(self) {
        let SniProxy {
            engine,
            tls_listener,
            http_listener,
            ..
        } = self;

        let tls_task = tokio::spawn(accept_loop(engine.clone(), tls_listener, false));
        let http_task = tokio::spawn(accept_loop(engine, http_listener, true));
        let _ = tokio::join!(tls_task, http_task);

        info!("sniproxy: stopped");
    }
}

/// 接收循环：每个连接交给一个独立任务处理
async fn accept_loop(engine: Arc<Engine>, listener: TcpListener, plain_http: bool) {
    let kind = if plain_http { "HTTP" } else { "TLS" };
    match listener.local_addr() {
        Ok(addr) => info!("sniproxy: listening for {} connections on {}", kind, addr),
        Err(_) => info!("sniproxy: listening for {} connections", kind),
    }

    loop {
        tokio::select! {
            _ = engine.cancel.cancelled() => {
                info!("sniproxy: exiting {} listener loop as it has been closed", kind);
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.handle_connection(conn, plain_http).await {
                            debug!("sniproxy: error handling connection: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    // 监听套接字被关闭属于正常退出
                    if e.to_string().contains("closed network connection") {
                        info!("sniproxy: exiting {} listener loop as it has been closed", kind);
                        return;
                    }
                    debug!("sniproxy: accept error: {}", e);
                }
            }
        }
    }
}

impl Engine {
    /// 单条连接的完整处理管线
    async fn handle_connection(&self, mut client: TcpStream, plain_http: bool) -> Result<()> {
        // 嗅探必须在读超时内完成，之后的隧道阶段不设超时
        let peeked: PeekedName =
            match tokio::time::timeout(READ_TIMEOUT, peek::peek_server_name(&mut client, plain_http))
                .await
            {
                Ok(Ok(peeked)) => peeked,
                Ok(Err(e)) => return Err(anyhow!(e).context("failed to peek server name")),
                Err(_) => {
                    return Err(anyhow!(TunnelError::Timeout {
                        duration: READ_TIMEOUT
                    })
                    .context("failed to peek server name"))
                }
            };

        // 服务器名里可能同时带着主机和端口
        let default_port = if plain_http {
            REMOTE_PORT_PLAIN
        } else {
            REMOTE_PORT_TLS
        };
        let (remote_host, remote_port) = peek::split_host_port(&peeked.server_name, default_port);
        let ctx = SessionContext::new(remote_host, remote_port);

        info!("sniproxy: [{}] start tunneling to {}", ctx.id, ctx.remote_addr);

        if filter::match_wildcards(&ctx.remote_host, &self.config.block_rules) {
            info!(
                "sniproxy: [{}] blocked connection to {}",
                ctx.id, ctx.remote_host
            );
            return Ok(());
        }

        let upstream = match self.dial(&ctx).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "sniproxy: [{}] failed to connect to {}: {}",
                    ctx.id, ctx.remote_addr, e
                );
                return Ok(());
            }
        };

        self.tunnel(ctx, client, upstream, peeked.buffered).await;
        Ok(())
    }

    /// 建立到目标的连接，按转发规则决定直连还是走上游代理
    async fn dial(&self, ctx: &SessionContext) -> crate::error::Result<BoxedStream> {
        if let Some(dialer) = self.should_forward(ctx) {
            debug!(
                "sniproxy: [{}] dialing {} via the forward proxy",
                ctx.id, ctx.remote_addr
            );
            return dialer
                .dial(&ctx.remote_host, ctx.remote_port, &self.cancel)
                .await;
        }

        let stream = tokio::time::timeout(
            CONNECTION_TIMEOUT,
            TcpStream::connect(ctx.remote_addr.as_str()),
        )
        .await
        .map_err(|_| TunnelError::Timeout {
            duration: CONNECTION_TIMEOUT,
        })?
        .map_err(|e| TunnelError::ConnectionFailed {
            addr: ctx.remote_addr.clone(),
            source: e,
        })?;

        Ok(Box::pin(stream))
    }

    /// 是否应当经由上游代理转发
    fn should_forward(&self, ctx: &SessionContext) -> Option<&Arc<dyn ProxyDialer>> {
        let dialer = self.proxy_dialer.as_ref()?;

        // 没有配置转发规则时全部转发
        if self.config.forward_rules.is_empty()
            || filter::match_wildcards(&ctx.remote_host, &self.config.forward_rules)
        {
            Some(dialer)
        } else {
            None
        }
    }

    /// 双向搬运数据直到两个方向都结束
    async fn tunnel(
        &self,
        ctx: SessionContext,
        client: TcpStream,
        mut upstream: BoxedStream,
        captured: Vec<u8>,
    ) {
        // 嗅探期间捕获的字节必须先于后续数据原样重放给上游
        if let Err(e) = upstream.write_all(&captured).await {
            debug!(
                "sniproxy: [{}] failed to replay peeked bytes: {}",
                ctx.id, e
            );
            return;
        }

        let rate = self.config.bandwidth_rate;
        let (mut client_read, mut client_write) = client.into_split();
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        // 会话持有自己的取消句柄：停机信号只关闭接收循环，
        // 在途隧道不被打断，自然排空到 EOF
        let session_cancel = CancellationToken::new();

        // 单方向结束时 copy_shaped 会对目标半关闭，另一方向继续排空
        let client_to_upstream = copy_shaped(
            &mut client_read,
            &mut upstream_write,
            rate,
            session_cancel.clone(),
        );
        let upstream_to_client = copy_shaped(
            &mut upstream_read,
            &mut client_write,
            rate,
            session_cancel.clone(),
        );

        let ((sent, sent_result), (received, received_result)) =
            tokio::join!(client_to_upstream, upstream_to_client);

        if let Err(e) = sent_result {
            debug!(
                "sniproxy: [{}] finished copying to upstream due to {}",
                ctx.id, e
            );
        }
        if let Err(e) = received_result {
            debug!(
                "sniproxy: [{}] finished copying to client due to {}",
                ctx.id, e
            );
        }

        info!(
            "sniproxy: [{}] finished tunneling to {}. received {}, sent {}",
            ctx.id, ctx.remote_addr, received, sent
        );
    }
}
