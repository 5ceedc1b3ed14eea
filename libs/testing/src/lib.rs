//! Test helpers for hostmux.
//!
//! Builders for the first bytes a client sends (HTTP request heads and TLS
//! ClientHello records), plus small utilities for tests that bind real ports.

use std::future::Future;
use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

/// A minimal HTTP/1.1 request head for `host`.
pub fn http_request(host: &str) -> Vec<u8> {
    format!("GET / HTTP/1.1\r\nHost: {host}\r\nUser-Agent: hostmux-test\r\n\r\n").into_bytes()
}

/// A TLS 1.2 ClientHello record whose only extension is `server_name`.
///
/// Layout: empty session id, one cipher suite, the null compression method,
/// and the SNI extension as the final bytes of the record.
pub fn client_hello(name: &str) -> Vec<u8> {
    client_hello_with_extensions(name, &[])
}

/// A ClientHello record with `leading` extensions placed before
/// `server_name`.
pub fn client_hello_with_extensions(name: &str, leading: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut extensions = Vec::new();
    for (ext_type, body) in leading {
        extensions.extend_from_slice(&ext_type.to_be_bytes());
        extensions.extend_from_slice(&(body.len() as u16).to_be_bytes());
        extensions.extend_from_slice(body);
    }

    let name = name.as_bytes();
    let list_len = 1 + 2 + name.len();
    extensions.extend_from_slice(&0u16.to_be_bytes());
    extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
    extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
    extensions.push(0); // host_name
    extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(name);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client version
    body.extend_from_slice(&[0x5a; 32]); // gmt_unix_time + random
    body.push(0); // session id
    body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]); // cipher suites
    body.extend_from_slice(&[0x01, 0x00]); // compression methods
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// A TCP port on the loopback interface that was free a moment ago.
pub fn unused_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|l| l.local_addr())
        .map(|addr| addr.port())
        .expect("no free loopback port")
}

/// Whether `port` can be bound on loopback right now.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Poll `check` every 10ms until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_lengths_agree() {
        let record = client_hello("example.com");
        let declared = u16::from_be_bytes([record[3], record[4]]) as usize;
        assert_eq!(record.len(), 5 + declared);

        let handshake = u32::from_be_bytes([0, record[6], record[7], record[8]]) as usize;
        assert_eq!(handshake, declared - 4);
        assert!(record.ends_with(b"example.com"));
    }

    #[test]
    fn test_leading_extensions_precede_sni() {
        let plain = client_hello("a.com");
        let padded = client_hello_with_extensions("a.com", &[(0x0015, vec![0; 7])]);
        assert_eq!(padded.len(), plain.len() + 4 + 7);
        assert!(padded.ends_with(b"a.com"));
    }

    #[test]
    fn test_http_request_head() {
        let req = http_request("host.com");
        assert!(req.starts_with(b"GET / HTTP/1.1\r\nHost: host.com\r\n"));
        assert!(req.ends_with(b"\r\n\r\n"));
    }
}
