/// 上游代理拨号模块
///
/// 根据 --forward-proxy 的 URL 创建对应协议的拨号器，
/// 隧道引擎只面向统一的 ProxyDialer 接口
mod http;
mod socks5;

pub use http::HttpProxyDialer;
pub use socks5::Socks5Dialer;

use crate::error::Result;
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use url::Url;

/// 建立上游连接的超时
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 经由拨号器建立的上游连接
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 装箱的上游连接
pub type BoxedStream = Pin<Box<dyn TransportStream>>;

/// 上游代理的认证信息
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// 上游代理拨号接口
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    /// 通过代理建立到 host:port 的隧道连接
    ///
    /// 取消信号在握手期间任意时刻触发都必须放弃握手并关闭套接字
    async fn dial(&self, host: &str, port: u16, cancel: &CancellationToken)
        -> Result<BoxedStream>;
}

/// 根据 URL 创建代理拨号器，支持 socks5://、http://、https://
pub fn create_proxy_dialer(proxy_url: &str) -> anyhow::Result<Arc<dyn ProxyDialer>> {
    let url = Url::parse(proxy_url)
        .with_context(|| format!("failed to parse forward-proxy {}", proxy_url))?;

    let host = url
        .host_str()
        .with_context(|| format!("forward-proxy {} has no host", proxy_url))?
        .to_string();

    let auth = if url.username().is_empty() {
        None
    } else {
        Some(ProxyAuth {
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
        })
    };

    let dialer: Arc<dyn ProxyDialer> = match url.scheme() {
        "socks5" => Arc::new(Socks5Dialer::new(host, url.port().unwrap_or(1080), auth)),
        "http" => Arc::new(HttpProxyDialer::new(
            host,
            url.port().unwrap_or(80),
            false,
            auth,
        )?),
        "https" => Arc::new(HttpProxyDialer::new(
            host,
            url.port().unwrap_or(443),
            true,
            auth,
        )?),
        scheme => bail!("unsupported forward-proxy scheme {}", scheme),
    };

    Ok(dialer)
}

/// 拼接连接地址，裸 IPv6 主机加方括号
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
