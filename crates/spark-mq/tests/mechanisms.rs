//! 通过套接字驱动内置 ZMTP 引擎：PLAIN 凭据、类型不兼容、命令消息与 TOML 配置。

mod support;

use std::time::Duration;

use spark_mq::{
    CallContext, Mechanism, PlainCredentials, SendPolicy, Socket, SocketConfig, SocketError,
    SocketType,
};
use support::{LOOPBACK, within};

fn plain_socket(socket_type: SocketType, as_server: bool, user: &str, pass: &str) -> Socket {
    let config = SocketConfig {
        plain: Some(PlainCredentials::new(user, pass)),
        ..SocketConfig::default()
    };
    Socket::builder(socket_type, as_server)
        .mechanism(Mechanism::Plain)
        .config(config)
        .build()
        .expect("socket")
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_credentials_gate_the_connection() {
    let server = plain_socket(SocketType::Server, true, "admin", "secret");
    let addr = server.listen(LOOPBACK).await.expect("listen");
    let endpoint = addr.to_endpoint();

    let intruder = plain_socket(SocketType::Client, false, "admin", "guess");
    let (dialed, accepted) =
        within(async { tokio::join!(intruder.connect(&endpoint), server.accept()) })
            .await;
    assert!(matches!(dialed, Err(SocketError::Handshake { .. })));
    assert!(matches!(accepted, Err(SocketError::Handshake { .. })));
    assert_eq!(server.connection_count().await, 0);
    assert_eq!(intruder.connection_count().await, 0);

    let member = plain_socket(SocketType::Client, false, "admin", "secret");
    let (dialed, accepted) =
        within(async { tokio::join!(member.connect(&endpoint), server.accept()) }).await;
    dialed.expect("valid credentials");
    accepted.expect("valid credentials");

    member.send(b"authenticated").await.expect("send");
    let got = within(server.recv_payload()).await.expect("recv");
    assert_eq!(got.as_ref(), b"authenticated");

    for socket in [&intruder, &member, &server] {
        socket.close().await.expect("close");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_clients_cannot_pair() {
    let listener_side = Socket::new(SocketType::Client, true, Mechanism::Null);
    let addr = listener_side.listen(LOOPBACK).await.expect("listen");
    let endpoint = addr.to_endpoint();
    let dialer_side = Socket::client(Mechanism::Null);

    let (dialed, accepted) = within(async {
        tokio::join!(
            dialer_side.connect(&endpoint),
            listener_side.accept()
        )
    })
    .await;
    let err = dialed.expect_err("CLIENT to CLIENT");
    assert!(err.to_string().contains("CLIENT"), "{err}");
    assert!(accepted.is_err());

    dialer_side.close().await.expect("close");
    listener_side.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn curve_fails_the_handshake() {
    let server = Socket::server(Mechanism::Curve);
    let addr = server.listen(LOOPBACK).await.expect("listen");
    let endpoint = addr.to_endpoint();
    let client = Socket::client(Mechanism::Curve);

    let (dialed, accepted) =
        within(async { tokio::join!(client.connect(&endpoint), server.accept()) }).await;
    assert!(matches!(dialed, Err(SocketError::Handshake { .. })));
    assert!(matches!(accepted, Err(SocketError::Handshake { .. })));
    client.close().await.expect("close");
    server.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_deadline_applies_to_silent_peers() {
    let server = Socket::server(Mechanism::Null);
    let addr = server.listen(LOOPBACK).await.expect("listen");
    let target = addr.as_socket_addr().expect("tcp");

    let silent_peer = tokio::spawn(async move {
        let stream = tokio::net::TcpStream::connect(target).await.expect("raw dial");
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(stream);
    });

    let ctx = CallContext::builder()
        .with_timeout(Duration::from_millis(150))
        .build();
    let err = within(server.accept_with(&ctx))
        .await
        .expect_err("peer never greets");
    assert!(matches!(err, SocketError::Timeout { .. }), "{err:?}");
    silent_peer.abort();
    server.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn configured_handshake_timeout_bounds_accept() {
    let config = SocketConfig {
        handshake_timeout: Some(Duration::from_millis(150)),
        ..SocketConfig::default()
    };
    let server = Socket::builder(SocketType::Server, true)
        .config(config)
        .build()
        .expect("server");
    let addr = server.listen(LOOPBACK).await.expect("listen");
    let target = addr.as_socket_addr().expect("tcp");

    let silent_peer = tokio::spawn(async move {
        let stream = tokio::net::TcpStream::connect(target).await.expect("raw dial");
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(stream);
    });

    let err = within(server.accept())
        .await
        .expect_err("peer never greets");
    match err {
        SocketError::Timeout { operation } => {
            assert_eq!(operation, spark_mq::error::HANDSHAKE);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(server.connection_count().await, 0);
    silent_peer.abort();
    server.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn config_document_drives_socket_behavior() {
    let config = SocketConfig::from_toml_str(
        r#"
            retry_interval_ms = 15
            max_dial_attempts = 2
            inbound_capacity = 4
            send_policy = "round-robin"
            handshake_timeout_ms = 500

            [metadata]
            Identity = "worker-1"
        "#,
    )
    .expect("valid document");
    assert_eq!(config.send_policy, SendPolicy::RoundRobin);

    let client = Socket::builder(SocketType::Client, false)
        .config(config)
        .build()
        .expect("client");
    assert_eq!(client.retry(), Duration::from_millis(15));

    let reserved = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
    let addr = reserved.local_addr().expect("addr");
    drop(reserved);
    let err = within(client.connect(&format!("tcp://{addr}")))
        .await
        .expect_err("no listener");
    assert!(matches!(
        err,
        SocketError::DialExhausted { attempts: 2, .. }
    ));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn ipc_endpoints_use_unix_domain_sockets() {
    let dir = std::env::temp_dir().join(format!("spark-mq-ipc-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("socket");
    let _ = std::fs::remove_file(&path);
    let endpoint = format!("ipc://{}", path.display());

    let server = Socket::server(Mechanism::Null);
    let client = Socket::client(Mechanism::Null);
    server.listen(&endpoint).await.expect("listen ipc");
    let (dialed, accepted) =
        within(async { tokio::join!(client.connect(&endpoint), server.accept()) }).await;
    dialed.expect("connect ipc");
    accepted.expect("accept ipc");

    client.send(b"over ipc").await.expect("send");
    let got = within(server.recv_payload()).await.expect("recv");
    assert_eq!(got.as_ref(), b"over ipc");

    client.close().await.expect("close");
    server.close().await.expect("close");
    assert!(!path.exists(), "closing the socket removes the ipc file");

    let relisten = Socket::server(Mechanism::Null);
    relisten.listen(&endpoint).await.expect("listen on the same path again");
    relisten.close().await.expect("close");
    let _ = std::fs::remove_dir_all(&dir);
}
