/// 隧道会话上下文
use std::sync::atomic::{AtomicU64, Ordering};

/// 进程内全局会话计数器，只要求唯一递增，不要求连续
static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// 单条隧道连接的上下文，随连接建立而创建，不跨会话共享
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// 会话唯一编号，用于在日志中关联同一连接的事件
    pub id: u64,

    /// 嗅探得到的目标主机名（已小写、去除尾部 `.`、不含端口）
    pub remote_host: String,

    /// 目标端口
    pub remote_port: u16,

    /// 代理将要连接的地址，即 remote_host:remote_port
    pub remote_addr: String,
}

impl SessionContext {
    pub fn new(remote_host: String, remote_port: u16) -> Self {
        // 裸 IPv6 地址需要加方括号才能作为连接地址
        let remote_addr = if remote_host.contains(':') {
            format!("[{}]:{}", remote_host, remote_port)
        } else {
            format!("{}:{}", remote_host, remote_port)
        };

        Self {
            id: LAST_ID.fetch_add(1, Ordering::SeqCst) + 1,
            remote_host,
            remote_port,
            remote_addr,
        }
    }
}
