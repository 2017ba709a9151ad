use clap::Parser;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// 命令行参数
#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "sni-tunnel")]
#[command(author, version, about = "Transparent SNI/Host proxy with a cooperating DNS redirector", long_about = None)]
pub struct Options {
    /// IP address that the DNS proxy server will be listening to
    #[arg(long = "dns-address", default_value = "0.0.0.0")]
    pub dns_address: IpAddr,

    /// Port the DNS proxy server will be listening to
    #[arg(long = "dns-port", default_value_t = 53)]
    pub dns_port: u16,

    /// The address of the DNS server the proxy will forward queries that are not rewritten
    #[arg(long = "dns-upstream", default_value = "8.8.8.8")]
    pub dns_upstream: String,

    /// IPv4 address that will be used for redirecting type A DNS queries
    #[arg(long = "dns-redirect-ipv4-to")]
    pub dns_redirect_ipv4_to: Option<Ipv4Addr>,

    /// IPv6 address that will be used for redirecting type AAAA DNS queries
    #[arg(long = "dns-redirect-ipv6-to")]
    pub dns_redirect_ipv6_to: Option<Ipv6Addr>,

    /// Wildcard that defines which domains should be redirected to the proxy. Can be specified multiple times
    #[arg(long = "dns-redirect-rule", default_value = "*")]
    pub dns_redirect_rules: Vec<String>,

    /// Wildcard that defines which DNS queries should be dropped without any response. Can be specified multiple times
    #[arg(long = "dns-drop-rule")]
    pub dns_drop_rules: Vec<String>,

    /// IP address the proxy will be listening on for plain HTTP connections
    #[arg(long = "http-address", default_value = "0.0.0.0")]
    pub http_address: IpAddr,

    /// Port the proxy will be listening on for plain HTTP connections
    #[arg(long = "http-port", default_value_t = 80)]
    pub http_port: u16,

    /// IP address the proxy will be listening on for TLS connections
    #[arg(long = "tls-address", default_value = "0.0.0.0")]
    pub tls_address: IpAddr,

    /// Port the proxy will be listening on for TLS connections
    #[arg(long = "tls-port", default_value_t = 443)]
    pub tls_port: u16,

    /// Bytes per second the connections speed will be limited to. 0 disables the limit
    #[arg(long = "bandwidth-rate", default_value_t = 0)]
    pub bandwidth_rate: u32,

    /// Address of a SOCKS5/HTTP/HTTPS proxy that matching connections will be forwarded through
    #[arg(long = "forward-proxy")]
    pub forward_proxy: Option<String>,

    /// Wildcard that defines what connections will be forwarded to forward-proxy. Can be specified
    /// multiple times. If no rules are specified, all connections will be forwarded to the proxy
    #[arg(long = "forward-rule")]
    pub forward_rules: Vec<String>,

    /// Wildcard that defines what domains should be blocked. Can be specified multiple times
    #[arg(long = "block-rule")]
    pub block_rules: Vec<String>,

    /// Verbose (debug) output
    #[arg(long = "verbose")]
    pub verbose: bool,

    /// Path to the log file. If not set, writes to stdout
    #[arg(long = "output")]
    pub output: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::try_parse_from(["sni-tunnel"]).unwrap();

        assert_eq!(options.dns_address.to_string(), "0.0.0.0");
        assert_eq!(options.dns_port, 53);
        assert_eq!(options.dns_upstream, "8.8.8.8");
        assert_eq!(options.dns_redirect_rules, vec!["*".to_string()]);
        assert!(options.dns_drop_rules.is_empty());
        assert_eq!(options.http_port, 80);
        assert_eq!(options.tls_port, 443);
        assert_eq!(options.bandwidth_rate, 0);
        assert!(options.forward_proxy.is_none());
        assert!(options.forward_rules.is_empty());
        assert!(options.block_rules.is_empty());
        assert!(!options.verbose);
        assert!(options.output.is_none());
    }

    #[test]
    fn test_explicit_redirect_rules_replace_default() {
        let options = Options::try_parse_from([
            "sni-tunnel",
            "--dns-redirect-rule",
            "example.com",
            "--dns-redirect-rule",
            "*.example.org",
        ])
        .unwrap();

        assert_eq!(
            options.dns_redirect_rules,
            vec!["example.com".to_string(), "*.example.org".to_string()]
        );
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        assert!(Options::try_parse_from(["sni-tunnel", "--dns-address", "not-an-ip"]).is_err());
        assert!(Options::try_parse_from(["sni-tunnel", "--dns-redirect-ipv4-to", "::1"]).is_err());
        assert!(Options::try_parse_from([
            "sni-tunnel",
            "--dns-redirect-ipv6-to",
            "192.0.2.1"
        ])
        .is_err());
    }
}
