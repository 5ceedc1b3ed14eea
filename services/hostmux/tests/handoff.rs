
use std::sync::Arc;

use harness::{connect, read_n, registry, TEST_TIMEOUT};
use hostmux::handoff::control::{decode_port, encode_port};
use hostmux::{ControlSocket, HostName, UnixCmd, WorkerControl, WorkerError};
use hostmux_testing::{http_request, port_is_free, unused_port, wait_until};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;

async fn request(worker: &ControlSocket, port: u16) -> Vec<u8> {
    worker.send(&encode_port(port), None).await.unwrap();
    let mut buf = [0u8; 256];
    let msg = timeout(TEST_TIMEOUT, worker.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(msg.fd.is_none());
    buf[..msg.len].to_vec()
}

#[tokio::test]
async fn raw_worker_protocol() {
    let registry = registry();
    let (parent, worker) = ControlSocket::pair().unwrap();
    let cmd = UnixCmd::attach(&registry, Arc::new(HostName::new("w.example")), parent);

    // Port zero is refused with the registry's error text.
    let reply = request(&worker, 0).await;
    assert_eq!(decode_port(&reply), Some(0));
    assert_eq!(&reply[2..], b"cannot register on port 0");

    // A successful open is echoed.
    let port = unused_port();
    assert_eq!(request(&worker, port).await, encode_port(port));
    assert_eq!(registry.registrations(port), 1);
    assert_eq!(cmd.status().ports, vec![port]);

    // A matched connection arrives as a descriptor plus the sniffed bytes.
    let head = http_request("w.example");
    let mut client = connect(port).await.unwrap();
    client.write_all(&head).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let msg = timeout(TEST_TIMEOUT, worker.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..msg.len], &head[..]);
    let received = std::net::TcpStream::from(msg.fd.unwrap());
    received.set_nonblocking(true).unwrap();
    let mut received = tokio::net::TcpStream::from_std(received).unwrap();
    assert_eq!(received.local_addr().unwrap().port(), port);

    client.write_all(b"live").await.unwrap();
    assert_eq!(read_n(&mut received, 4).await.unwrap(), b"live");
    received.write_all(b"back").await.unwrap();
    assert_eq!(read_n(&mut client, 4).await.unwrap(), b"back");

    // Asking for the same port again closes it.
    assert_eq!(request(&worker, port).await, encode_port(port));
    assert_eq!(registry.registrations(port), 0);
    assert!(cmd.status().ports.is_empty());
    assert!(wait_until(TEST_TIMEOUT, || async move { port_is_free(port) }).await);
}

#[tokio::test]
async fn control_socket_close_releases_ports() {
    let registry = registry();
    let (parent, worker) = ControlSocket::pair().unwrap();
    let cmd = UnixCmd::attach(&registry, Arc::new(HostName::new("w.example")), parent);

    let first = unused_port();
    let second = unused_port();
    assert_eq!(request(&worker, first).await, encode_port(first));
    assert_eq!(request(&worker, second).await, encode_port(second));
    assert_eq!(cmd.status().ports.len(), 2);

    drop(worker);
    assert_eq!(timeout(TEST_TIMEOUT, cmd.wait()).await.unwrap(), None);
    assert!(registry.ports().is_empty());
    assert!(!cmd.status().active);
    assert!(cmd.close().is_err());
}

#[tokio::test]
async fn worker_control_end_to_end() {
    let registry = registry();
    let (parent, child) = ControlSocket::pair().unwrap();
    let cmd = UnixCmd::attach(&registry, Arc::new(HostName::new("w.example")), parent);
    let control = WorkerControl::from_socket(child);

    assert!(matches!(control.listen(0).await, Err(WorkerError::InvalidPort)));

    let port = unused_port();
    let listener = control.listen(port).await.unwrap();
    assert_eq!(listener.port(), port);
    assert!(matches!(
        control.listen(port).await,
        Err(WorkerError::AlreadyListening)
    ));

    let head = http_request("w.example");
    let mut client = connect(port).await.unwrap();
    client.write_all(&head).await.unwrap();
    client.write_all(b"more").await.unwrap();

    let mut conn = timeout(TEST_TIMEOUT, listener.accept()).await.unwrap().unwrap();
    let received = read_n(&mut conn, head.len() + 4).await.unwrap();
    assert_eq!(&received[head.len()..], b"more");
    conn.write_all(b"ok").await.unwrap();
    assert_eq!(read_n(&mut client, 2).await.unwrap(), b"ok");

    listener.close().await.unwrap();
    assert!(
        wait_until(TEST_TIMEOUT, || {
            let registry = registry.clone();
            async move { registry.registrations(port) == 0 }
        })
        .await
    );

    cmd.close().unwrap();
    assert!(
        wait_until(TEST_TIMEOUT, || {
            let control = control.clone();
            async move { control.is_exited() }
        })
        .await
    );
    assert!(matches!(control.listen(port).await, Err(WorkerError::Exited)));
}

#[tokio::test]
async fn parent_rejection_reaches_worker() {
    let registry = registry();
    let (parent, child) = ControlSocket::pair().unwrap();
    let _cmd = UnixCmd::attach(&registry, Arc::new(HostName::new("w.example")), parent);
    let control = WorkerControl::from_socket(child);

    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    match control.listen(port).await {
        Err(WorkerError::Rejected(text)) => assert!(text.contains("failed to bind")),
        other => panic!("expected rejection, got {:?}", other.map(|l| l.port())),
    }

    // The worker can still open other ports.
    let free = unused_port();
    assert!(control.listen(free).await.is_ok());
}

#[tokio::test]
async fn spawned_echo_worker_serves_connections() {
    let registry = registry();
    let port = unused_port();
    let mut command = Command::new(env!("CARGO_BIN_EXE_hostmux-echo"));
    command.arg(port.to_string());
    let cmd = UnixCmd::spawn(&registry, Arc::new(HostName::new("echo.example")), command).unwrap();
    assert!(cmd.pid().is_some());

    assert!(
        wait_until(TEST_TIMEOUT, || {
            let registry = registry.clone();
            async move { registry.registrations(port) == 1 }
        })
        .await
    );

    let head = http_request("echo.example");
    let mut client = connect(port).await.unwrap();
    client.write_all(&head).await.unwrap();
    assert_eq!(read_n(&mut client, head.len()).await.unwrap(), head);

    cmd.close().unwrap();
    let status = timeout(TEST_TIMEOUT, cmd.wait()).await.unwrap().unwrap();
    assert!(status.success());
    assert!(registry.ports().is_empty());

    let mut buf = [0u8; 1];
    assert!(matches!(client.read(&mut buf).await, Ok(0) | Err(_)));
}
