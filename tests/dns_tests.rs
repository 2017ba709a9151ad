/// End-to-end tests for the selective DNS rewriter
mod common;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use sni_tunnel::config::DnsProxyConfig;
use sni_tunnel::dns::DnsProxy;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// The answer the fake upstream resolver hands out for every A query
const UPSTREAM_ANSWER: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

fn query_bytes(name: &str, qtype: RecordType, id: u16) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
    message.to_vec().unwrap()
}

/// Start a fake recursive resolver: answers every A query with 1.2.3.4 and
/// everything else with NXDOMAIN.
async fn start_fake_resolver() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = Message::from_vec(&buf[..len]) else {
                continue;
            };

            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_recursion_desired(true)
                .set_recursion_available(true);

            if let Some(query) = request.queries().first() {
                response.add_query(query.clone());
                if query.query_type() == RecordType::A {
                    response.add_answer(Record::from_rdata(
                        query.name().clone(),
                        300,
                        RData::A(A::from(UPSTREAM_ANSWER)),
                    ));
                } else {
                    response.set_response_code(ResponseCode::NXDomain);
                }
            }

            let _ = socket
                .send_to(&response.to_vec().unwrap(), peer)
                .await;
        }
    });

    addr
}

async fn start_dns_proxy(upstream: SocketAddr) -> (SocketAddr, CancellationToken) {
    let config = DnsProxyConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        upstream,
        redirect_ipv4_to: Some(Ipv4Addr::new(192, 0, 2, 10)),
        redirect_ipv6_to: None,
        redirect_rules: vec!["redirected.test".to_string(), "*.redirected.test".to_string()],
        drop_rules: vec!["drop.test".to_string()],
    };

    let cancel = CancellationToken::new();
    let proxy = DnsProxy::bind(config).await.expect("failed to bind dns proxy");
    let addr = proxy.listen_addr();
    tokio::spawn(proxy.run(cancel.clone()));
    (addr, cancel)
}

#[tokio::test]
async fn test_redirect_rule_rewrites_a_query() {
    let upstream = start_fake_resolver().await;
    let (addr, _cancel) = start_dns_proxy(upstream).await;

    let packet = query_bytes("redirected.test.", RecordType::A, 0x0101);
    let response = common::udp_query(addr, &packet, Duration::from_secs(2))
        .await
        .expect("redirected query must be answered");
    let response = Message::from_vec(&response).unwrap();

    assert_eq!(response.id(), 0x0101);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);

    let answer = &response.answers()[0];
    assert_eq!(answer.record_type(), RecordType::A);
    assert_eq!(answer.ttl(), 60);
    assert_eq!(
        answer.data(),
        Some(&RData::A(A::from(Ipv4Addr::new(192, 0, 2, 10))))
    );
}

#[tokio::test]
async fn test_redirect_without_ipv6_target_returns_nodata() {
    let upstream = start_fake_resolver().await;
    let (addr, _cancel) = start_dns_proxy(upstream).await;

    let packet = query_bytes("www.redirected.test.", RecordType::AAAA, 0x0202);
    let response = common::udp_query(addr, &packet, Duration::from_secs(2))
        .await
        .expect("AAAA redirect must still be answered");
    let response = Message::from_vec(&response).unwrap();

    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());
}

#[tokio::test]
async fn test_drop_rule_yields_no_response() {
    let upstream = start_fake_resolver().await;
    let (addr, _cancel) = start_dns_proxy(upstream).await;

    let packet = query_bytes("drop.test.", RecordType::A, 0x0303);
    let response = common::udp_query(addr, &packet, Duration::from_secs(2)).await;
    assert!(response.is_none(), "dropped query must never be answered");
}

#[tokio::test]
async fn test_unmatched_query_is_forwarded_upstream() {
    let upstream = start_fake_resolver().await;
    let (addr, _cancel) = start_dns_proxy(upstream).await;

    let packet = query_bytes("other.example.", RecordType::A, 0x0404);
    let response = common::udp_query(addr, &packet, Duration::from_secs(2))
        .await
        .expect("unmatched query must be forwarded");
    let response = Message::from_vec(&response).unwrap();

    // the upstream's answer comes back verbatim
    assert_eq!(response.id(), 0x0404);
    assert_eq!(
        response.answers()[0].data(),
        Some(&RData::A(A::from(UPSTREAM_ANSWER)))
    );
}

#[tokio::test]
async fn test_non_address_query_is_forwarded_untouched() {
    let upstream = start_fake_resolver().await;
    let (addr, _cancel) = start_dns_proxy(upstream).await;

    // TXT matches the redirect rules but is not A/AAAA, so it passes through
    let packet = query_bytes("redirected.test.", RecordType::TXT, 0x0505);
    let response = common::udp_query(addr, &packet, Duration::from_secs(2))
        .await
        .expect("non-address query must be forwarded");
    let response = Message::from_vec(&response).unwrap();

    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert!(response.answers().is_empty());
}

#[tokio::test]
async fn test_tcp_query_gets_the_same_rewrite() {
    let upstream = start_fake_resolver().await;
    let (addr, _cancel) = start_dns_proxy(upstream).await;

    let packet = query_bytes("redirected.test.", RecordType::A, 0x0606);
    let response = common::tcp_query(addr, &packet, Duration::from_secs(2))
        .await
        .expect("tcp query must be answered");
    let response = Message::from_vec(&response).unwrap();

    assert_eq!(response.id(), 0x0606);
    assert_eq!(response.answers().len(), 1);
    assert_eq!(
        response.answers()[0].data(),
        Some(&RData::A(A::from(Ipv4Addr::new(192, 0, 2, 10))))
    );
}

#[tokio::test]
async fn test_unreachable_upstream_yields_servfail() {
    // port 1 on localhost refuses or swallows packets either way
    let (addr, _cancel) = start_dns_proxy("127.0.0.1:1".parse().unwrap()).await;

    let packet = query_bytes("other.example.", RecordType::A, 0x0707);
    let response = common::udp_query(addr, &packet, Duration::from_secs(8))
        .await
        .expect("upstream failure must yield SERVFAIL");
    let response = Message::from_vec(&response).unwrap();

    assert_eq!(response.response_code(), ResponseCode::ServFail);
}
