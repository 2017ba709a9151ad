/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error
/// 这样可以让调用者进行更精确的错误处理和恢复
use std::io;
use thiserror::Error;

/// SNI 隧道的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS 记录嗅探失败
    #[error("Invalid TLS record: {0}")]
    InvalidTls(String),

    /// ClientHello 中不携带 SNI 扩展
    #[error("ClientHello carries no server name")]
    MissingServerName,

    /// HTTP 请求解析失败
    #[error("Invalid HTTP request: {0}")]
    InvalidHttp(String),

    /// HTTP 请求缺少 Host 头
    #[error("HTTP request carries no Host header")]
    MissingHost,

    /// 上游代理握手失败
    #[error("Proxy handshake failed: {0}")]
    ProxyHandshake(String),

    /// 上游代理返回非 200 状态码
    #[error("Bad status code from proxy: {0}")]
    ProxyStatus(u16),

    /// 操作被取消信号打断
    #[error("Operation cancelled")]
    Cancelled,

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 统一的 Result 别名
pub type Result<T> = std::result::Result<T, TunnelError>;
