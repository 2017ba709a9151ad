/// HTTP CONNECT 上游拨号器
///
/// 连接 HTTP 或 HTTPS 代理，发送 CONNECT 请求打通到目标的原始 TCP 隧道
use super::{join_host_port, BoxedStream, ProxyAuth, ProxyDialer, CONNECT_TIMEOUT};
use crate::error::{Result, TunnelError};
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// CONNECT 响应的长度上限
const MAX_RESPONSE_SIZE: usize = 8 * 1024;

/// 响应头的结束标记
const RESPONSE_TERMINATOR: &[u8] = b"\r\n\r\n";

pub struct HttpProxyDialer {
    /// 代理的主机名，HTTPS 模式下兼作 TLS 的 ServerName
    host: String,
    /// 代理的连接地址 host:port
    address: String,
    /// HTTPS 代理的 TLS 连接器，HTTP 代理为 None
    connector: Option<TlsConnector>,
    auth: Option<ProxyAuth>,
}

impl HttpProxyDialer {
    pub fn new(
        host: String,
        port: u16,
        tls: bool,
        auth: Option<ProxyAuth>,
    ) -> anyhow::Result<Self> {
        let connector = if tls {
            // 提前校验 ServerName，避免到握手时才失败
            ServerName::try_from(host.clone())
                .with_context(|| format!("forward-proxy host {} is not a valid server name", host))?;
            Some(TlsConnector::from(Arc::new(tls_client_config())))
        } else {
            None
        };

        let address = join_host_port(&host, port);

        Ok(Self {
            host,
            address,
            connector,
            auth,
        })
    }

    async fn handshake(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TunnelError::Timeout {
                duration: CONNECT_TIMEOUT,
            })?
            .map_err(|e| TunnelError::ConnectionFailed {
                addr: self.address.clone(),
                source: e,
            })?;

        match &self.connector {
            Some(connector) => {
                let server_name = ServerName::try_from(self.host.clone())
                    .map_err(|e| TunnelError::ProxyHandshake(e.to_string()))?;
                let mut stream = connector.connect(server_name, conn).await?;
                self.connect_through(&mut stream, host, port).await?;
                Ok(Box::pin(stream))
            }
            None => {
                let mut stream = conn;
                self.connect_through(&mut stream, host, port).await?;
                Ok(Box::pin(stream))
            }
        }
    }

    /// 发送 CONNECT 请求并校验响应状态
    async fn connect_through<S>(&self, stream: &mut S, host: &str, port: u16) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target = join_host_port(host, port);
        let request = build_connect_request(&target, self.auth.as_ref());

        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let response = read_response(stream).await?;
        let status = parse_status(&response)?;
        if status != 200 {
            return Err(TunnelError::ProxyStatus(status));
        }

        debug!("http upstream: CONNECT {} established", target);
        Ok(())
    }
}

#[async_trait]
impl ProxyDialer for HttpProxyDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<BoxedStream> {
        // 取消守护：信号触发即放弃握手，半途的套接字随 future 一起关闭
        tokio::select! {
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            result = self.handshake(host, port) => result,
        }
    }
}

/// 构造 CONNECT 请求报文
fn build_connect_request(target: &str, auth: Option<&ProxyAuth>) -> String {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(auth) = auth {
        let credentials = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials));
    }
    request.push_str(&format!(
        "User-Agent: sni-tunnel/{}\r\n\r\n",
        env!("CARGO_PKG_VERSION")
    ));
    request
}

/// 逐字节读取响应，直到空行为止
///
/// 不能套带缓冲的读取器：缓冲多读进去的字节属于隧道数据，没法再还回去
async fn read_response<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut response = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while !response.ends_with(RESPONSE_TERMINATOR) {
        if response.len() >= MAX_RESPONSE_SIZE {
            return Err(TunnelError::ProxyHandshake(
                "response header is too large".to_string(),
            ));
        }

        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TunnelError::ProxyHandshake(
                "connection closed before end of response".to_string(),
            ));
        }
        response.push(byte[0]);
    }

    Ok(response)
}

/// 解析响应状态码
fn parse_status(response: &[u8]) -> Result<u16> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Response::new(&mut headers);

    match parsed.parse(response) {
        Ok(_) => parsed
            .code
            .ok_or_else(|| TunnelError::ProxyHandshake("response has no status code".to_string())),
        Err(e) => Err(TunnelError::ProxyHandshake(e.to_string())),
    }
}

/// HTTPS 代理用的 TLS 客户端配置，信任 Mozilla 根证书
fn tls_client_config() -> rustls::ClientConfig {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}
