/// SNI 隧道库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod peek;
pub mod proxy;
pub mod rate_limiter;
pub mod session;
pub mod upstream;

// 重新导出常用类型
pub use cli::Options;
pub use config::{DnsProxyConfig, SniProxyConfig};
pub use dns::DnsProxy;
pub use error::{Result, TunnelError};
pub use proxy::SniProxy;
pub use rate_limiter::{copy_shaped, RateLimiter};
pub use session::SessionContext;
