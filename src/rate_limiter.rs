/// 流量整形模块
///
/// 使用 token bucket 算法限制隧道单方向的字节速率
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::io;
use std::num::NonZeroU32;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// 令牌桶容量，相当于一次很大的突发
///
/// 构造时会立即排空整个桶，令牌从零开始积累，
/// 否则第一次读取会白拿一整桶的初始突发
const BURST_LIMIT: u32 = 1_000_000_000;

/// 隧道复制时的读缓冲大小
const COPY_BUF_SIZE: usize = 16 * 1024;

/// 字节速率限制器
pub struct RateLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    bytes_per_sec: u32,
}

impl RateLimiter {
    /// 创建每秒 bytes_per_sec 字节的限制器，初始突发已被预先耗尽
    pub fn new(bytes_per_sec: NonZeroU32) -> Self {
        let burst = NonZeroU32::new(BURST_LIMIT).expect("burst limit is non-zero");
        let quota = Quota::per_second(bytes_per_sec).allow_burst(burst);
        let inner = GovernorLimiter::direct(quota);

        // 预先花掉初始突发
        let _ = inner.check_n(burst);

        Self {
            inner,
            bytes_per_sec: bytes_per_sec.get(),
        }
    }

    /// 阻塞直到取得 n 个令牌
    pub async fn wait_n(&self, n: u32) -> io::Result<()> {
        let Some(n) = NonZeroU32::new(n) else {
            return Ok(());
        };

        loop {
            match self.inner.check_n(n) {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(not_until)) => {
                    let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                    tokio::time::sleep(wait_time).await;
                }
                Err(_) => {
                    // 单次请求超过桶容量，永远无法满足
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "requested more bytes than the bucket capacity",
                    ));
                }
            }
        }
    }

    /// 配置的速率（字节每秒）
    pub fn bytes_per_sec(&self) -> u32 {
        self.bytes_per_sec
    }
}

/// 单方向复制数据，支持限速与半关闭
///
/// 读侧与写侧各挂一个独立的令牌桶，读满 n 字节等 n 个令牌，写完再等一次，
/// 与不限速的直拷贝共用同一条循环。取消信号只打断挂起的令牌等待，
/// 不打断裸读写：不限速的复制总是自然排空到 EOF。返回成功搬运的字节数
/// 和终止原因，EOF 视为正常结束。无论因何结束，都对目标执行 shutdown
/// 半关闭，对端由此收到"本方向不再有数据"的信号，反方向不受影响。
pub async fn copy_shaped<R, W>(
    src: &mut R,
    dst: &mut W,
    rate: Option<NonZeroU32>,
    cancel: CancellationToken,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let limiters = rate.map(|r| (RateLimiter::new(r), RateLimiter::new(r)));
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written: u64 = 0;

    let result = loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };

        if let Some((read_limiter, _)) = &limiters {
            let waited = tokio::select! {
                _ = cancel.cancelled() => {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "copy cancelled"))
                }
                waited = read_limiter.wait_n(n as u32) => waited,
            };
            if let Err(e) = waited {
                break Err(e);
            }
        }

        if let Err(e) = dst.write_all(&buf[..n]).await {
            break Err(e);
        }
        written += n as u64;

        if let Some((_, write_limiter)) = &limiters {
            let waited = tokio::select! {
                _ = cancel.cancelled() => {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "copy cancelled"))
                }
                waited = write_limiter.wait_n(n as u32) => waited,
            };
            if let Err(e) = waited {
                break Err(e);
            }
        }
    };

    // 半关闭，通知对端本方向已结束
    let _ = dst.shutdown().await;

    (written, result)
}
