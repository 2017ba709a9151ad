/// 运行配置模块
///
/// 从命令行参数构造两个子系统的配置，启动前完成全部校验
use crate::cli::Options;
use anyhow::{bail, Context, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::num::NonZeroU32;

/// 上游 DNS 的默认端口
const DEFAULT_DNS_PORT: u16 = 53;

/// DNS 重写代理配置
#[derive(Debug, Clone)]
pub struct DnsProxyConfig {
    /// DNS 服务器的监听地址
    pub listen_addr: SocketAddr,

    /// 未被重写的查询转发到的上游递归解析器
    pub upstream: SocketAddr,

    /// A 查询重写到的 IPv4 地址
    pub redirect_ipv4_to: Option<Ipv4Addr>,

    /// AAAA 查询重写到的 IPv6 地址
    pub redirect_ipv6_to: Option<Ipv6Addr>,

    /// 命中即重写的通配符规则
    pub redirect_rules: Vec<String>,

    /// 命中即不响应的通配符规则
    pub drop_rules: Vec<String>,
}

impl DnsProxyConfig {
    pub fn from_options(options: &Options) -> Result<Self> {
        let config = Self {
            listen_addr: SocketAddr::new(options.dns_address, options.dns_port),
            upstream: parse_upstream(&options.dns_upstream)?,
            redirect_ipv4_to: options.dns_redirect_ipv4_to,
            redirect_ipv6_to: options.dns_redirect_ipv6_to,
            redirect_rules: options.dns_redirect_rules.clone(),
            drop_rules: options.dns_drop_rules.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.redirect_ipv4_to.is_none() && self.redirect_ipv6_to.is_none() {
            bail!("either dns-redirect-ipv4-to or dns-redirect-ipv6-to must be specified");
        }
        Ok(())
    }
}

/// 隧道引擎配置
#[derive(Debug, Clone)]
pub struct SniProxyConfig {
    /// TLS 连接的监听地址
    pub tls_listen_addr: SocketAddr,

    /// 明文 HTTP 连接的监听地址
    pub http_listen_addr: SocketAddr,

    /// 上游代理的 URL（socks5://、http://、https://）
    pub forward_proxy: Option<String>,

    /// 命中即走上游代理的通配符规则
    ///
    /// 列表为空且配置了上游代理时，所有连接都走代理
    pub forward_rules: Vec<String>,

    /// 命中即立刻关闭连接的通配符规则
    pub block_rules: Vec<String>,

    /// 单会话的字节速率上限，None 表示不限速
    pub bandwidth_rate: Option<NonZeroU32>,
}

impl SniProxyConfig {
    pub fn from_options(options: &Options) -> Result<Self> {
        Ok(Self {
            tls_listen_addr: SocketAddr::new(options.tls_address, options.tls_port),
            http_listen_addr: SocketAddr::new(options.http_address, options.http_port),
            forward_proxy: options.forward_proxy.clone(),
            forward_rules: options.forward_rules.clone(),
            block_rules: options.block_rules.clone(),
            bandwidth_rate: NonZeroU32::new(options.bandwidth_rate),
        })
    }
}

/// 解析上游解析器地址，接受 `ip`、`ip:port` 或主机名，端口缺省 53
fn parse_upstream(value: &str) -> Result<SocketAddr> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT));
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    // 主机名在启动时解析一次
    let resolved = (value, DEFAULT_DNS_PORT)
        .to_socket_addrs()
        .or_else(|_| value.to_socket_addrs())
        .with_context(|| format!("failed to resolve dns-upstream {}", value))?
        .next();

    resolved.with_context(|| format!("dns-upstream {} resolved to no address", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["sni-tunnel"];
        argv.extend_from_slice(args);
        Options::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_upstream_plain_ip() {
        assert_eq!(
            parse_upstream("8.8.8.8").unwrap(),
            "8.8.8.8:53".parse().unwrap()
        );
    }

    #[test]
    fn test_parse_upstream_with_port() {
        assert_eq!(
            parse_upstream("1.1.1.1:5353").unwrap(),
            "1.1.1.1:5353".parse().unwrap()
        );
    }

    #[test]
    fn test_parse_upstream_ipv6() {
        assert_eq!(
            parse_upstream("2001:4860:4860::8888").unwrap(),
            "[2001:4860:4860::8888]:53".parse().unwrap()
        );
    }

    #[test]
    fn test_dns_config_requires_a_redirect_target() {
        let opts = options(&[]);
        let err = DnsProxyConfig::from_options(&opts).unwrap_err();
        assert!(err.to_string().contains("dns-redirect-ipv4-to"));
    }

    #[test]
    fn test_dns_config_accepts_single_target() {
        let opts = options(&["--dns-redirect-ipv4-to", "192.0.2.1"]);
        let config = DnsProxyConfig::from_options(&opts).unwrap();
        assert_eq!(config.redirect_ipv4_to, Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(config.redirect_ipv6_to, None);
        // 缺省的重定向规则是匹配一切的 `*`
        assert_eq!(config.redirect_rules, vec!["*".to_string()]);
    }

    #[test]
    fn test_proxy_config_zero_rate_means_unlimited() {
        let opts = options(&["--dns-redirect-ipv4-to", "192.0.2.1"]);
        let config = SniProxyConfig::from_options(&opts).unwrap();
        assert_eq!(config.bandwidth_rate, None);

        let opts = options(&[
            "--dns-redirect-ipv4-to",
            "192.0.2.1",
            "--bandwidth-rate",
            "2048",
        ]);
        let config = SniProxyConfig::from_options(&opts).unwrap();
        assert_eq!(config.bandwidth_rate, NonZeroU32::new(2048));
    }

    #[test]
    fn test_repeatable_rules_accumulate() {
        let opts = options(&[
            "--dns-redirect-ipv4-to",
            "192.0.2.1",
            "--block-rule",
            "ads.*",
            "--block-rule",
            "*.tracker.test",
        ]);
        let config = SniProxyConfig::from_options(&opts).unwrap();
        assert_eq!(
            config.block_rules,
            vec!["ads.*".to_string(), "*.tracker.test".to_string()]
        );
    }
}
