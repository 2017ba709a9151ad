/// 选择性 DNS 重写代理
///
/// 在同一地址同时监听 UDP 与 TCP（2 字节长度前缀）。对每条查询：
/// 命中丢弃规则则不作任何响应（客户端只能等到超时）；命中重定向规则
/// 则合成指向固定地址的 A/AAAA 应答；其余查询原样转发上游递归解析器，
/// 应答也原样转回。
use crate::config::DnsProxyConfig;
use crate::filter;
use anyhow::{bail, Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 重写记录的 TTL
const DEFAULT_TTL: u32 = 60;

/// 上游查询超时
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// DNS 报文的长度上限
const MAX_MESSAGE_SIZE: usize = 4096;

/// DNS 重写代理服务器
pub struct DnsProxy {
    config: Arc<DnsProxyConfig>,
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
    listen_addr: SocketAddr,
}

impl DnsProxy {
    /// 绑定监听套接字，绑定失败即启动失败
    pub async fn bind(config: DnsProxyConfig) -> Result<Self> {
        let udp = UdpSocket::bind(config.listen_addr)
            .await
            .with_context(|| format!("dnsproxy: failed to bind udp {}", config.listen_addr))?;
        // TCP 复用 UDP 实际拿到的端口，配置里写 0 时两者才会一致
        let listen_addr = udp.local_addr()?;
        let tcp = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("dnsproxy: failed to bind tcp {}", listen_addr))?;

        info!("dnsproxy: listening on {} (udp/tcp)", listen_addr);

        Ok(Self {
            config: Arc::new(config),
            udp: Arc::new(udp),
            tcp,
            listen_addr,
        })
    }

    /// 实际监听的地址
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// 运行 UDP 与 TCP 服务循环，直到取消信号到达
    pub async fn run(self, cancel: CancellationToken) {
        let DnsProxy {
            config, udp, tcp, ..
        } = self;

        let udp_task = tokio::spawn(run_udp(config.clone(), udp, cancel.clone()));
        let tcp_task = tokio::spawn(run_tcp(config, tcp, cancel));
        let _ = tokio::join!(udp_task, tcp_task);

        info!("dnsproxy: stopped");
    }
}

async fn run_udp(config: Arc<DnsProxyConfig>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("dnsproxy: udp listener closed");
                return;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    let packet = buf[..len].to_vec();
                    let config = config.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        match handle_query(&config, &packet).await {
                            Ok(Some(response)) => {
                                let _ = socket.send_to(&response, peer).await;
                            }
                            // 命中丢弃规则：一个字节都不回
                            Ok(None) => {}
                            Err(e) => {
                                debug!("dnsproxy: failed to handle query from {}: {}", peer, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    debug!("dnsproxy: udp receive error: {}", e);
                }
            }
        }
    }
}

async fn run_tcp(config: Arc<DnsProxyConfig>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("dnsproxy: tcp listener closed");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let config = config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_tcp_client(&config, stream).await {
                            debug!("dnsproxy: tcp client {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    debug!("dnsproxy: tcp accept error: {}", e);
                }
            }
        }
    }
}

/// 处理一条 TCP 连接上的查询流，报文带 2 字节大端长度前缀
async fn handle_tcp_client(config: &DnsProxyConfig, mut stream: TcpStream) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // 对端正常断开
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_MESSAGE_SIZE {
            bail!("invalid message length {}", len);
        }

        let mut packet = vec![0u8; len];
        stream.read_exact(&mut packet).await?;

        match handle_query(config, &packet).await? {
            Some(response) => {
                stream
                    .write_all(&(response.len() as u16).to_be_bytes())
                    .await?;
                stream.write_all(&response).await?;
            }
            // 丢弃：直接断开，不发送任何应答
            None => return Ok(()),
        }
    }
}

/// 单条查询的处理管线，返回 None 表示不响应
async fn handle_query(config: &DnsProxyConfig, packet: &[u8]) -> Result<Option<Vec<u8>>> {
    let request = Message::from_vec(packet).context("failed to decode query")?;

    // 没有问题段或类型不是 A/AAAA 的查询我们无从改写，原样转发
    let Some(query) = request.queries().first().cloned() else {
        return forward_upstream(config, packet).await.map(Some);
    };

    let qtype = query.query_type();
    if qtype != RecordType::A && qtype != RecordType::AAAA {
        return forward_upstream(config, packet).await.map(Some);
    }

    let name = query.name().to_string().to_lowercase();
    let domain = name.trim_end_matches('.');
    debug!("dnsproxy: received query {} {}", qtype, domain);

    if filter::match_wildcards(domain, &config.drop_rules) {
        debug!("dnsproxy: dropping query for {}", domain);
        return Ok(None);
    }

    if filter::match_wildcards(domain, &config.redirect_rules) {
        info!("dnsproxy: rewriting {} {}", qtype, domain);
        let response = rewrite(&request, &query, config);
        return Ok(Some(response.to_vec()?));
    }

    match forward_upstream(config, packet).await {
        Ok(response) => Ok(Some(response)),
        Err(e) => {
            debug!("dnsproxy: upstream query for {} failed: {}", domain, e);
            Ok(Some(servfail(&request).to_vec()?))
        }
    }
}

/// 合成重定向应答：附带恰好一条指向固定地址的记录
///
/// 查询类型对应的重定向地址未配置时，应答不带任何记录（NODATA）
fn rewrite(request: &Message, query: &Query, config: &DnsProxyConfig) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    response.add_query(query.clone());

    let name = query.name().clone();
    match query.query_type() {
        RecordType::A => {
            if let Some(target) = config.redirect_ipv4_to {
                response.add_answer(Record::from_rdata(name, DEFAULT_TTL, RData::A(A::from(target))));
            }
        }
        RecordType::AAAA => {
            if let Some(target) = config.redirect_ipv6_to {
                response.add_answer(Record::from_rdata(
                    name,
                    DEFAULT_TTL,
                    RData::AAAA(AAAA::from(target)),
                ));
            }
        }
        _ => {}
    }

    response
}

/// 上游出错时的 SERVFAIL 应答
fn servfail(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::ServFail);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

/// 把查询原样转发给上游递归解析器，返回其应答字节
async fn forward_upstream(config: &DnsProxyConfig, packet: &[u8]) -> Result<Vec<u8>> {
    // 套接字族要跟上游地址一致
    let bind_addr = if config.upstream.is_ipv6() {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .context("failed to bind upstream socket")?;
    socket
        .send_to(packet, config.upstream)
        .await
        .with_context(|| format!("failed to send query to upstream {}", config.upstream))?;

    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let (len, _) = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .with_context(|| format!("upstream {} timed out", config.upstream))?
        .context("failed to receive upstream response")?;
    buf.truncate(len);

    Ok(buf)
}
