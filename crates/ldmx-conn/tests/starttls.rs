//! STARTTLS 升级/降级协议：读者暂停、换壳、重启，全程不丢回复。

use ldmx_conn::{Connection, LockOwner, RequestGroup, SendOptions};
use ldmx_core::{ConnectionConfig, EngineError, RustlsUpgrader, TcpDialer};
use ldmx_testkit::{StubListener, StubSession, TlsIdentity, TlvCodec, frames, tag};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connect_pair() -> (Connection, StubSession, StubListener) {
    init_tracing();
    let listener = StubListener::bind().await.expect("绑定桩服务器");
    let port = listener.port();
    let conn = Connection::new(
        Arc::new(TlvCodec::new()),
        Arc::new(TcpDialer::default()),
        ConnectionConfig::default(),
    );
    let (connected, accepted) = tokio::join!(
        conn.connect("127.0.0.1", port, LockOwner::raw(-1)),
        listener.accept(),
    );
    connected.expect("连接桩服务器");
    (conn, accepted.expect("接受入站连接"), listener)
}

/// 完成一次完整的 STARTTLS 协商：扩展请求往返、读者暂停、两端握手。
async fn negotiate_tls(conn: &Connection, session: &mut StubSession, identity: &TlsIdentity) {
    let group = RequestGroup::new();
    let id = conn.next_message_id();
    // 哨兵必须先于请求上线缆，否则响应可能抢在暂停指令之前到达。
    conn.pause_reader_after(id);
    let pending = group
        .send(conn, frames::extended_request(id), SendOptions::new())
        .await
        .expect("发送 STARTTLS 请求");

    let frame = session.read_frame().await.expect("读扩展请求帧");
    assert_eq!(frame.tag, tag::EXTENDED_REQUEST);
    session
        .send(&frames::extended_response(id))
        .await
        .expect("应答扩展响应");
    let reply = pending
        .wait_for_reply()
        .await
        .expect("协商不应见故障")
        .expect("应有扩展响应");
    assert_eq!(reply.tag, tag::EXTENDED_RESPONSE);

    let upgrader = RustlsUpgrader::new(identity.client_config());
    let (client, server) = tokio::join!(conn.start_tls(&upgrader), session.upgrade_tls(identity));
    client.expect("客户端升级");
    server.expect("服务端握手");
}

#[tokio::test]
async fn upgrade_then_roundtrip_over_tls() {
    let identity = TlsIdentity::generate();
    let (conn, mut session, _listener) = connect_pair().await;
    negotiate_tls(&conn, &mut session, &identity).await;
    assert!(conn.is_secure());
    assert!(session.is_secure());

    let group = RequestGroup::new();
    let id = conn.next_message_id();
    let pending = group
        .send(&conn, frames::search_request(id), SendOptions::new())
        .await
        .expect("TLS 形态下发送搜索");
    let frame = session.read_frame().await.expect("TLS 形态下读帧");
    assert_eq!(frame.message_id, id);
    session.send(&frames::result(id)).await.expect("TLS 形态下应答");
    let got = pending
        .wait_for_reply()
        .await
        .expect("不应见故障")
        .expect("应有结果");
    assert_eq!(got.message_id, id);
}

#[tokio::test]
async fn downgrade_returns_to_plaintext_roundtrip() {
    let identity = TlsIdentity::generate();
    let (conn, mut session, _listener) = connect_pair().await;
    negotiate_tls(&conn, &mut session, &identity).await;
    assert!(conn.is_secure());

    // 先在 TLS 形态下完成一次往返，让会话真实承载过流量（含服务端
    // 握手后补发的会话票据等记录）。
    let group = RequestGroup::new();
    let warm_id = conn.next_message_id();
    let warm = group
        .send(&conn, frames::search_request(warm_id), SendOptions::new())
        .await
        .expect("TLS 形态下发送搜索");
    session.read_frame().await.expect("TLS 形态下读帧");
    session
        .send(&frames::result(warm_id))
        .await
        .expect("TLS 形态下应答");
    warm.wait_for_reply()
        .await
        .expect("不应见故障")
        .expect("应有结果");

    // 双方的 close_notify 交换互相等待，两端降级必须并发执行。
    let (client, server) = tokio::join!(conn.stop_tls(), session.downgrade_tls());
    client.expect("降级回明文");
    server.expect("服务端剥离 TLS");
    assert!(!conn.is_secure());
    assert!(!session.is_secure());

    let group = RequestGroup::new();
    let id = conn.next_message_id();
    let pending = group
        .send(&conn, frames::search_request(id), SendOptions::new())
        .await
        .expect("明文形态下发送搜索");
    session.read_frame().await.expect("明文形态下读帧");
    session.send(&frames::result(id)).await.expect("明文形态下应答");
    pending
        .wait_for_reply()
        .await
        .expect("不应见故障")
        .expect("应有结果");
    assert!(conn.is_connected());
}

#[tokio::test]
async fn upgrade_refused_while_replies_undrained() {
    let identity = TlsIdentity::generate();
    let (conn, mut session, _listener) = connect_pair().await;
    let group = RequestGroup::new();
    let id = conn.next_message_id();
    let pending = group
        .send(&conn, frames::search_request(id), SendOptions::new())
        .await
        .expect("发送搜索");
    session.read_frame().await.expect("读搜索帧");
    session
        .send(&frames::search_entry(id, b"undrained"))
        .await
        .expect("发条目");
    // 给读者时间把条目排进队列。
    tokio::time::sleep(Duration::from_millis(100)).await;

    let upgrader = RustlsUpgrader::new(identity.client_config());
    match conn.start_tls(&upgrader).await {
        Err(EngineError::TlsNegotiation { .. }) => {}
        other => panic!("expected refusal, got {other:?}"),
    }
    // 拒绝不触碰连接：条目仍可读取。
    assert!(conn.is_connected());
    let entry = pending
        .wait_for_reply()
        .await
        .expect("不应见故障")
        .expect("条目仍在队列");
    assert_eq!(&entry.body[..], b"undrained");
}

#[tokio::test]
async fn failed_handshake_leaves_connection_down() {
    let identity = TlsIdentity::generate();
    let distrusting = TlsIdentity::generate();
    let (conn, mut session, _listener) = connect_pair().await;

    let group = RequestGroup::new();
    let id = conn.next_message_id();
    conn.pause_reader_after(id);
    let pending = group
        .send(&conn, frames::extended_request(id), SendOptions::new())
        .await
        .expect("发送 STARTTLS 请求");
    session.read_frame().await.expect("读扩展请求帧");
    session
        .send(&frames::extended_response(id))
        .await
        .expect("应答扩展响应");
    pending
        .wait_for_reply()
        .await
        .expect("协商不应见故障")
        .expect("应有扩展响应");

    // 客户端信任的是另一套身份，证书校验必然失败。
    let upgrader = RustlsUpgrader::new(distrusting.client_config());
    let (client, _server) = tokio::join!(conn.start_tls(&upgrader), session.upgrade_tls(&identity));
    match client {
        Err(EngineError::TlsNegotiation { .. }) => {}
        other => panic!("expected handshake failure, got {other:?}"),
    }
    // 握手把套接字带进未知协议状态，连接如实转为断开。
    assert!(!conn.is_connected());
}
