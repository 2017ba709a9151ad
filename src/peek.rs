/// 协议嗅探模块
///
/// 在不消费连接字节的前提下解析目标主机名：读到的所有字节都保留在
/// 捕获缓冲里，嗅探结束后由隧道引擎原样重放给上游。TLS 一侧解析
/// ClientHello 的 SNI 扩展，明文 HTTP 一侧解析请求头里的 Host。
/// 嗅探期间不向客户端写回任何字节。
use crate::error::{Result, TunnelError};
use tls_parser::{TlsExtension, TlsMessage, TlsMessageHandshake, TlsRecordType};
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS 记录头长度
const TLS_HEADER_SIZE: usize = 5;

/// 单条 TLS 记录的长度上限（记录头 + 最大载荷）
const MAX_RECORD_SIZE: usize = TLS_HEADER_SIZE + 16 * 1024;

/// HTTP 请求头的长度上限
const MAX_HEADER_SIZE: usize = 8 * 1024;

/// 嗅探结果：主机名与嗅探期间捕获的全部字节
#[derive(Debug)]
pub struct PeekedName {
    /// 已小写、去除尾部 `.` 的服务器名，可能仍带 `:port` 后缀
    pub server_name: String,

    /// 捕获缓冲，必须先于后续客户端数据重放给上游
    pub buffered: Vec<u8>,
}

/// 从客户端流中嗅探目标主机名
pub async fn peek_server_name<R>(reader: &mut R, plain_http: bool) -> Result<PeekedName>
where
    R: AsyncRead + Unpin,
{
    if plain_http {
        peek_http_host(reader).await
    } else {
        peek_tls_server_name(reader).await
    }
}

/// 读取第一条 TLS 记录并从 ClientHello 中取出 SNI
async fn peek_tls_server_name<R>(reader: &mut R) -> Result<PeekedName>
where
    R: AsyncRead + Unpin,
{
    let mut buffered = Vec::with_capacity(1024);

    // 先凑齐记录头，确定整条记录的长度
    read_until_len(reader, &mut buffered, TLS_HEADER_SIZE).await?;
    let (_, header) = tls_parser::parse_tls_record_header(&buffered[..TLS_HEADER_SIZE])
        .map_err(|_| TunnelError::InvalidTls("malformed record header".to_string()))?;

    if header.record_type != TlsRecordType::Handshake {
        return Err(TunnelError::InvalidTls(format!(
            "unexpected record type {:?}",
            header.record_type
        )));
    }

    let record_len = TLS_HEADER_SIZE + header.len as usize;
    if record_len > MAX_RECORD_SIZE {
        return Err(TunnelError::InvalidTls(format!(
            "record of {} bytes exceeds the TLS maximum",
            header.len
        )));
    }

    read_until_len(reader, &mut buffered, record_len).await?;
    let server_name = extract_sni(&buffered[..record_len])?;

    Ok(PeekedName {
        server_name: normalize_host(&server_name),
        buffered,
    })
}

/// 从一条完整的握手记录中解析 SNI
fn extract_sni(record: &[u8]) -> Result<String> {
    let (_, plaintext) = tls_parser::parse_tls_plaintext(record)
        .map_err(|_| TunnelError::InvalidTls("malformed handshake record".to_string()))?;

    let hello = plaintext
        .msg
        .iter()
        .find_map(|msg| match msg {
            TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) => Some(hello),
            _ => None,
        })
        .ok_or_else(|| TunnelError::InvalidTls("record carries no ClientHello".to_string()))?;

    let ext = hello.ext.ok_or(TunnelError::MissingServerName)?;
    let (_, extensions) = tls_parser::parse_tls_client_hello_extensions(ext)
        .map_err(|_| TunnelError::InvalidTls("malformed ClientHello extensions".to_string()))?;

    let sni = extensions
        .iter()
        .find_map(|ext| match ext {
            TlsExtension::SNI(names) => Some(names),
            _ => None,
        })
        .ok_or(TunnelError::MissingServerName)?;

    let (_, name) = sni.first().ok_or(TunnelError::MissingServerName)?;

    String::from_utf8(name.to_vec())
        .map_err(|_| TunnelError::InvalidTls("server name is not valid UTF-8".to_string()))
}

/// 读取 HTTP/1.x 请求行和请求头，取出 Host 头
async fn peek_http_host<R>(reader: &mut R) -> Result<PeekedName>
where
    R: AsyncRead + Unpin,
{
    let mut buffered = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];

    loop {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut request = httparse::Request::new(&mut headers);

        match request.parse(&buffered) {
            Ok(httparse::Status::Complete(_)) => {
                let host = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("host"))
                    .ok_or(TunnelError::MissingHost)?;
                let host = std::str::from_utf8(host.value)
                    .map_err(|_| TunnelError::InvalidHttp("Host header is not valid UTF-8".to_string()))?
                    .trim();
                if host.is_empty() {
                    return Err(TunnelError::MissingHost);
                }

                return Ok(PeekedName {
                    server_name: normalize_host(host),
                    buffered,
                });
            }
            Ok(httparse::Status::Partial) => {}
            Err(e) => {
                return Err(TunnelError::InvalidHttp(e.to_string()));
            }
        }

        if buffered.len() >= MAX_HEADER_SIZE {
            return Err(TunnelError::InvalidHttp(
                "request header is too large".to_string(),
            ));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::InvalidHttp(
                "connection closed before end of request header".to_string(),
            ));
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
}

/// 把缓冲填到至少 target 字节
async fn read_until_len<R>(reader: &mut R, buffered: &mut Vec<u8>, target: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    while buffered.len() < target {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

/// 主机名规范化：小写并去掉尾部的 `.`
fn normalize_host(host: &str) -> String {
    host.to_ascii_lowercase()
        .trim_end_matches('.')
        .to_string()
}

/// 拆分可能带端口的服务器名
///
/// `[::1]:8443` 与 `host:port` 都会被拆开；裸 IPv6 地址里的冒号不算端口
pub fn split_host_port(server_name: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = server_name.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            if let Some(port) = tail.strip_prefix(':').and_then(|p| p.parse().ok()) {
                return (host.to_string(), port);
            }
            return (host.to_string(), default_port);
        }
        return (server_name.to_string(), default_port);
    }

    // 恰好一个冒号才视为 host:port，多个冒号说明是裸 IPv6 地址
    if server_name.bytes().filter(|b| *b == b':').count() == 1 {
        if let Some((host, port)) = server_name.rsplit_once(':') {
            if let Ok(port) = port.parse() {
                return (host.to_string(), port);
            }
        }
    }

    (server_name.to_string(), default_port)
}
