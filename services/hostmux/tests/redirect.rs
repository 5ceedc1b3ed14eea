
use std::sync::Arc;
use std::time::Duration;

use harness::{closed_without_data, connect, read_n, registry, TestServer, TEST_TIMEOUT};
use hostmux::{HostName, Network, RegistryError};
use hostmux_testing::{client_hello, http_request, unused_port, wait_until};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

#[tokio::test]
async fn http_and_tls_share_a_port() {
    let plain = TestServer::echo().await.unwrap();
    let (secure, cert_der) = TestServer::tls("secure.example", b"tls-ok").await.unwrap();

    let registry = registry();
    let port = unused_port();
    let http_redirect = registry
        .add_redirect(
            Arc::new(HostName::new("plain.example")),
            port,
            "tcp",
            &plain.addr.to_string(),
        )
        .await
        .unwrap();
    let tls_redirect = registry
        .add_redirect(
            Arc::new(HostName::new("secure.example")),
            port,
            "tcp4",
            &secure.addr.to_string(),
        )
        .await
        .unwrap();
    assert_eq!(http_redirect.destination(), plain.addr);
    assert_eq!(tls_redirect.destination(), secure.addr);
    assert_eq!(registry.registrations(port), 2);

    // The echo backend sees the full request, sniffed bytes included.
    let request = http_request("plain.example");
    let mut client = connect(port).await.unwrap();
    client.write_all(&request).await.unwrap();
    assert_eq!(read_n(&mut client, request.len()).await.unwrap(), request);

    // A real handshake only completes if the ClientHello arrived intact.
    let mut tls = harness::tls_connect(port, "secure.example", &cert_der)
        .await
        .unwrap();
    tls.write_all(b"hello").await.unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"tls-ok");

    assert_eq!(plain.connection_count(), 1);
    assert_eq!(secure.connection_count(), 1);
}

#[tokio::test]
async fn destination_close_closes_client() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = destination.local_addr().unwrap();

    let registry = registry();
    let port = unused_port();
    let redirect = registry
        .add_redirect(
            Arc::new(HostName::new("a.example")),
            port,
            "tcp",
            &addr.to_string(),
        )
        .await
        .unwrap();

    let hello = client_hello("a.example");
    let mut client = connect(port).await.unwrap();
    client.write_all(&hello).await.unwrap();

    let (mut server, _) = destination.accept().await.unwrap();
    assert_eq!(read_n(&mut server, hello.len()).await.unwrap(), hello);
    server.write_all(b"bye").await.unwrap();
    drop(server);

    // The client keeps its side open; the redirect must still hang up on it.
    let mut answer = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer, b"bye");

    let redirector = Arc::clone(redirect.redirector());
    assert!(
        wait_until(TEST_TIMEOUT, || {
            let redirector = Arc::clone(&redirector);
            async move { redirector.in_flight() == 0 }
        })
        .await
    );
}

#[tokio::test]
async fn client_close_closes_destination() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = destination.local_addr().unwrap();

    let registry = registry();
    let port = unused_port();
    let redirect = registry
        .add_redirect(
            Arc::new(HostName::new("a.example")),
            port,
            "tcp",
            &addr.to_string(),
        )
        .await
        .unwrap();

    let request = http_request("a.example");
    let mut client = connect(port).await.unwrap();
    client.write_all(&request).await.unwrap();
    client.write_all(b"tail").await.unwrap();
    client.shutdown().await.unwrap();

    let (mut server, _) = destination.accept().await.unwrap();
    let mut received = Vec::new();
    timeout(TEST_TIMEOUT, server.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert!(received.starts_with(&request));
    assert!(received.ends_with(b"tail"));

    // Nothing the destination writes afterwards reaches the client.
    let _ = server.write_all(b"late").await;
    assert!(closed_without_data(&mut client).await);

    let redirector = Arc::clone(redirect.redirector());
    assert!(
        wait_until(TEST_TIMEOUT, || {
            let redirector = Arc::clone(&redirector);
            async move { redirector.in_flight() == 0 }
        })
        .await
    );
}

#[tokio::test]
async fn unreachable_destination_closes_client() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let registry = registry();
    let port = unused_port();
    let redirect = registry
        .add_redirect(
            Arc::new(HostName::new("a.example")),
            port,
            "tcp",
            &dead_addr.to_string(),
        )
        .await
        .unwrap();

    let mut client = connect(port).await.unwrap();
    client.write_all(&http_request("a.example")).await.unwrap();
    assert!(closed_without_data(&mut client).await);

    let stats = registry.stats();
    assert!(
        wait_until(Duration::from_secs(5), || async move {
            stats
                .transfer_failed
                .load(std::sync::atomic::Ordering::Relaxed)
                == 1
        })
        .await
    );
    assert_eq!(redirect.redirector().in_flight(), 0);
}

#[tokio::test]
async fn closed_redirect_releases_port() {
    let backend = TestServer::echo().await.unwrap();
    let registry = registry();
    let port = unused_port();
    let redirect = registry
        .add_redirect(
            Arc::new(HostName::new("a.example")),
            port,
            "tcp",
            &backend.addr.to_string(),
        )
        .await
        .unwrap();
    assert_eq!(redirect.status().ports, vec![port]);

    redirect.close();
    assert!(redirect.status().closing);
    assert!(registry.ports().is_empty());
}

#[tokio::test]
async fn bad_network_and_address_rejected() {
    let registry = registry();
    let port = unused_port();

    let err = registry
        .add_redirect(Arc::new(HostName::new("a.example")), port, "udp", "127.0.0.1:1")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnsupportedNetwork(_)));

    let err = registry
        .add_redirect(Arc::new(HostName::new("a.example")), port, "tcp6", "127.0.0.1:1")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Resolve { .. }));

    assert!(registry.ports().is_empty());
    assert_eq!("tcp6".parse::<Network>().unwrap(), Network::Tcp6);
}
