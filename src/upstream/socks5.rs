/// SOCKS5 上游拨号器（RFC 1928）
///
/// 支持无认证与用户名/密码认证（RFC 1929），目标统一以域名形式发送，
/// 由代理侧完成解析
use super::{join_host_port, BoxedStream, ProxyAuth, ProxyDialer, CONNECT_TIMEOUT};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const USERPASS_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub struct Socks5Dialer {
    address: String,
    auth: Option<ProxyAuth>,
}

impl Socks5Dialer {
    pub fn new(host: String, port: u16, auth: Option<ProxyAuth>) -> Self {
        Self {
            address: join_host_port(&host, port),
            auth,
        }
    }

    async fn handshake(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TunnelError::Timeout {
                duration: CONNECT_TIMEOUT,
            })?
            .map_err(|e| TunnelError::ConnectionFailed {
                addr: self.address.clone(),
                source: e,
            })?;

        self.negotiate_method(&mut stream).await?;
        self.request_connect(&mut stream, host, port).await?;

        debug!("socks5 upstream: tunnel to {}:{} established", host, port);
        Ok(Box::pin(stream))
    }

    /// 方法协商，必要时走用户名/密码子协商
    async fn negotiate_method(&self, stream: &mut TcpStream) -> Result<()> {
        let greeting: &[u8] = if self.auth.is_some() {
            &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERPASS]
        } else {
            &[SOCKS_VERSION, 1, METHOD_NONE]
        };
        stream.write_all(greeting).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS_VERSION {
            return Err(TunnelError::ProxyHandshake(format!(
                "unexpected SOCKS version {}",
                reply[0]
            )));
        }

        match reply[1] {
            METHOD_NONE => Ok(()),
            METHOD_USERPASS => {
                let Some(auth) = &self.auth else {
                    return Err(TunnelError::ProxyHandshake(
                        "proxy requires credentials but none are configured".to_string(),
                    ));
                };
                self.authenticate(stream, auth).await
            }
            method => Err(TunnelError::ProxyHandshake(format!(
                "no acceptable authentication method (server offered {:#04x})",
                method
            ))),
        }
    }

    /// RFC 1929 用户名/密码子协商
    async fn authenticate(&self, stream: &mut TcpStream, auth: &ProxyAuth) -> Result<()> {
        let username = auth.username.as_bytes();
        let password = auth.password.as_bytes();
        if username.len() > 255 || password.len() > 255 {
            return Err(TunnelError::ProxyHandshake(
                "username or password is too long".to_string(),
            ));
        }

        let mut request = Vec::with_capacity(3 + username.len() + password.len());
        request.push(USERPASS_VERSION);
        request.push(username.len() as u8);
        request.extend_from_slice(username);
        request.push(password.len() as u8);
        request.extend_from_slice(password);
        stream.write_all(&request).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0 {
            return Err(TunnelError::ProxyHandshake(
                "authentication rejected".to_string(),
            ));
        }

        Ok(())
    }

    /// 发送 CONNECT 请求并解析应答
    async fn request_connect(&self, stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
        let host_bytes = host.as_bytes();
        if host_bytes.len() > 255 {
            return Err(TunnelError::ProxyHandshake(
                "target hostname is too long".to_string(),
            ));
        }

        let mut request = Vec::with_capacity(7 + host_bytes.len());
        request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        request.push(host_bytes.len() as u8);
        request.extend_from_slice(host_bytes);
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(TunnelError::ProxyHandshake(format!(
                "unexpected SOCKS version {}",
                header[0]
            )));
        }
        if header[1] != 0 {
            return Err(TunnelError::ProxyHandshake(format!(
                "connect rejected: {}",
                reply_message(header[1])
            )));
        }

        // 读掉绑定地址，长度取决于地址类型
        match header[3] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                stream.read_exact(&mut name).await?;
            }
            atyp => {
                return Err(TunnelError::ProxyHandshake(format!(
                    "unknown address type {:#04x} in reply",
                    atyp
                )));
            }
        }
        let mut bound_port = [0u8; 2];
        stream.read_exact(&mut bound_port).await?;

        Ok(())
    }
}

#[async_trait]
impl ProxyDialer for Socks5Dialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<BoxedStream> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            result = self.handshake(host, port) => result,
        }
    }
}

/// RFC 1928 的应答码描述
fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}
