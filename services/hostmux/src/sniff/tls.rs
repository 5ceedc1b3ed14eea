//! SNI (Server Name Indication) extraction from a TLS ClientHello.
//!
//! Only the first record is read. It must hold the complete ClientHello;
//! every declared length is checked against both the enclosing structure and
//! the bytes actually present, and any disagreement drops the connection.
//!
//! TLS record:
//! - byte 0: content type (0x16 = handshake), already read by the caller
//! - bytes 1-2: version
//! - bytes 3-4: fragment length
//!
//! ClientHello:
//! - 1 byte handshake type (0x01), 3 byte length (= fragment length - 4)
//! - 2 bytes client version, 4 bytes gmt_unix_time, 28 bytes random
//! - 1 byte session id length (<= 32), session id
//! - 2 bytes cipher suites length (> 0), cipher suites
//! - 1 byte compression methods length (>= 1), compression methods
//! - 2 bytes extensions length, extensions
//!
//! server_name extension (type 0):
//! - 2 bytes list length (= extension length - 2)
//! - 1 byte name type, 2 bytes name length, name

use tokio::io::AsyncRead;

use super::Sniffed;
use crate::buffer::PooledBuffer;
use crate::error::SniffError;

/// TLS content type for handshake records.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const MAX_SESSION_ID_LEN: u8 = 32;

/// Read one TLS record and return the SNI hostname from its ClientHello.
///
/// `buf` must hold exactly the content type byte. On success it holds the
/// whole record, header included.
pub async fn read_tls_server_name<R>(
    reader: &mut R,
    buf: &mut PooledBuffer,
) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin,
{
    if buf.filled().first() != Some(&CONTENT_TYPE_HANDSHAKE) {
        return Err(SniffError::NoHandshake);
    }

    // Version (skipped) and fragment length.
    buf.read_exact_from(reader, RECORD_HEADER_LEN - buf.len())
        .await?;
    let header = buf.filled();
    let length = u16::from_be_bytes([header[3], header[4]]) as usize;

    if buf.remaining() < length {
        return Err(SniffError::BufferTooSmall {
            needed: RECORD_HEADER_LEN + length,
            capacity: buf.capacity(),
        });
    }
    buf.read_exact_from(reader, length).await?;

    let hostname = parse_client_hello(&buf.filled()[RECORD_HEADER_LEN..])?;
    Ok(Sniffed {
        consumed: buf.len(),
        hostname,
    })
}

/// Parse a handshake fragment and return the server name.
pub(crate) fn parse_client_hello(fragment: &[u8]) -> Result<String, SniffError> {
    let mut r = Cursor::new(fragment);

    if r.u8("handshake type")? != HANDSHAKE_CLIENT_HELLO {
        return Err(SniffError::NoClientHello);
    }
    let body_len = r.u24("handshake length")? as usize;
    if fragment.len() < 4 || body_len != fragment.len() - 4 {
        return Err(SniffError::InvalidLength("handshake body"));
    }

    r.skip(2, "client version")?;
    r.skip(4, "gmt_unix_time")?;
    r.skip(28, "random")?;

    let session_id_len = r.u8("session id")?;
    if session_id_len > MAX_SESSION_ID_LEN {
        return Err(SniffError::InvalidLength("session id"));
    }
    r.skip(session_id_len as usize, "session id")?;

    let cipher_suites_len = r.u16("cipher suites")?;
    if cipher_suites_len == 0 {
        return Err(SniffError::InvalidLength("cipher suites"));
    }
    r.skip(cipher_suites_len as usize, "cipher suites")?;

    let compression_len = r.u8("compression methods")?;
    if compression_len < 1 {
        return Err(SniffError::InvalidLength("compression methods"));
    }
    r.skip(compression_len as usize, "compression methods")?;

    let extensions_len = r.u16("extensions")? as usize;
    let mut ext = Cursor::new(r.take(extensions_len, "extensions")?);

    while !ext.is_empty() {
        let ext_type = ext.u16("extension type")?;
        let ext_len = ext.u16("extension length")? as usize;
        let body = ext.take(ext_len, "extension")?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(body);
        }
    }

    Err(SniffError::NoName)
}

fn parse_server_name(body: &[u8]) -> Result<String, SniffError> {
    let mut r = Cursor::new(body);

    let list_len = r.u16("server name list")? as usize;
    if list_len != body.len() - 2 {
        return Err(SniffError::InvalidLength("server name list"));
    }
    r.skip(1, "name type")?;
    let name_len = r.u16("server name")? as usize;
    let name = r.take(name_len, "server name")?;

    String::from_utf8(name.to_vec()).map_err(|_| SniffError::InvalidName)
}

/// Bounds-checked big-endian reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SniffError> {
        if self.data.len() < n {
            return Err(SniffError::InvalidLength(what));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize, what: &'static str) -> Result<(), SniffError> {
        self.take(n, what).map(|_| ())
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, SniffError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, SniffError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<u32, SniffError> {
        let b = self.take(3, what)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use hostmux_testing::{client_hello, client_hello_with_extensions};
    use rstest::rstest;

    // A minimal TLS 1.2 ClientHello with SNI "example.com" and a padding
    // extension after it.
    const EXAMPLE_CLIENT_HELLO: &[u8] = &[
        // TLS record header
        0x16, // Handshake
        0x03, 0x01, // TLS 1.0 (for compatibility)
        0x00, 0x57, // Record length: 87 bytes
        // Handshake header
        0x01, // ClientHello
        0x00, 0x00, 0x53, // Length: 83 bytes
        // Client version
        0x03, 0x03, // TLS 1.2
        // Random (32 bytes)
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, //
        0x00, // Session ID length
        0x00, 0x02, // Cipher suites length
        0x00, 0x2f, // TLS_RSA_WITH_AES_128_CBC_SHA
        0x01, 0x00, // Compression methods: null
        0x00, 0x28, // Extensions length: 40 bytes
        // SNI extension
        0x00, 0x00, // type: SNI
        0x00, 0x10, // length: 16 bytes
        0x00, 0x0e, // list length: 14 bytes
        0x00, // name type: hostname
        0x00, 0x0b, // name length: 11 bytes
        b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm',
        // Padding extension
        0x00, 0x15, // type: padding
        0x00, 0x10, // length: 16 bytes
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];

    async fn sniff(record: &[u8], capacity: usize) -> (Result<Sniffed, SniffError>, Vec<u8>) {
        let pool = BufferPool::new(capacity, 1);
        let mut buf = pool.acquire();
        buf.push(record[0]);
        let mut reader = &record[1..];
        let result = read_tls_server_name(&mut reader, &mut buf).await;
        (result, buf.filled().to_vec())
    }

    #[tokio::test]
    async fn test_parse_sni_found() {
        let (result, consumed) = sniff(EXAMPLE_CLIENT_HELLO, 512).await;
        let sniffed = result.unwrap();
        assert_eq!(sniffed.hostname, "example.com");
        assert_eq!(sniffed.consumed, EXAMPLE_CLIENT_HELLO.len());
        assert_eq!(consumed, EXAMPLE_CLIENT_HELLO);
    }

    #[rstest]
    #[case("aaa.com")]
    #[case("example.com")]
    #[case("a-much-longer-host-name.subdomain.example.org")]
    #[tokio::test]
    async fn test_generated_client_hello(#[case] name: &str) {
        let record = client_hello(name);
        let (result, consumed) = sniff(&record, 1024).await;
        let sniffed = result.unwrap();
        assert_eq!(sniffed.hostname, name);
        let declared = u16::from_be_bytes([record[3], record[4]]) as usize;
        assert_eq!(sniffed.consumed, RECORD_HEADER_LEN + declared);
        assert_eq!(consumed, record);
    }

    #[test]
    fn test_skips_leading_extensions() {
        let record = client_hello_with_extensions(
            "skip.example",
            &[(0x000a, vec![0x00, 0x02, 0x00, 0x1d]), (0x0015, vec![0; 9])],
        );
        assert_eq!(parse_client_hello(&record[5..]).unwrap(), "skip.example");
    }

    #[tokio::test]
    async fn test_trailing_data_not_consumed() {
        let mut stream = client_hello("aaa.com");
        let record_len = stream.len();
        stream.extend_from_slice(b"ATAD");
        let (result, consumed) = sniff(&stream, 1024).await;
        assert_eq!(result.unwrap().consumed, record_len);
        assert_eq!(consumed.len(), record_len);
    }

    #[tokio::test]
    async fn test_not_handshake() {
        let pool = BufferPool::new(64, 1);
        let mut buf = pool.acquire();
        buf.push(0x17);
        let mut reader: &[u8] = &[0x03, 0x03, 0x00, 0x00];
        let result = read_tls_server_name(&mut reader, &mut buf).await;
        assert!(matches!(result, Err(SniffError::NoHandshake)));
    }

    #[tokio::test]
    async fn test_record_larger_than_buffer() {
        let record = client_hello("example.com");
        let (result, _) = sniff(&record, 32).await;
        assert!(matches!(result, Err(SniffError::BufferTooSmall { .. })));
    }

    #[tokio::test]
    async fn test_truncated_record() {
        let record = client_hello("example.com");
        let (result, _) = sniff(&record[..record.len() - 3], 1024).await;
        assert!(matches!(result, Err(SniffError::Io(_))));
    }

    #[test]
    fn test_not_client_hello() {
        let mut record = client_hello("example.com");
        record[5] = 0x02;
        assert!(matches!(
            parse_client_hello(&record[5..]),
            Err(SniffError::NoClientHello)
        ));
    }

    #[test]
    fn test_handshake_length_mismatch() {
        let mut record = client_hello("example.com");
        record[8] = record[8].wrapping_add(1);
        assert!(matches!(
            parse_client_hello(&record[5..]),
            Err(SniffError::InvalidLength("handshake body"))
        ));
    }

    #[test]
    fn test_session_id_too_long() {
        let mut record = client_hello("example.com");
        // Session id length sits after record header, handshake header,
        // version and random.
        record[5 + 4 + 2 + 32] = 33;
        assert!(matches!(
            parse_client_hello(&record[5..]),
            Err(SniffError::InvalidLength("session id"))
        ));
    }

    #[test]
    fn test_empty_cipher_suites() {
        let mut record = client_hello("example.com");
        let at = 5 + 4 + 2 + 32 + 1;
        record[at] = 0;
        record[at + 1] = 0;
        assert!(matches!(
            parse_client_hello(&record[5..]),
            Err(SniffError::InvalidLength("cipher suites"))
        ));
    }

    #[test]
    fn test_extension_overruns_block() {
        let mut record = client_hello("example.com");
        // Length field of the server_name extension: record and handshake
        // headers, version, random, session id, one cipher suite, one
        // compression method, extensions length, extension type.
        let at = 5 + 4 + 2 + 32 + 1 + (2 + 2) + (1 + 1) + 2 + 2;
        record[at] = 0xff;
        assert!(matches!(
            parse_client_hello(&record[5..]),
            Err(SniffError::InvalidLength("extension"))
        ));
    }

    #[test]
    fn test_no_server_name() {
        // ClientHello with a single non-SNI extension.
        let mut fragment = vec![0x01, 0x00, 0x00, 0x00, 0x03, 0x03];
        fragment.extend_from_slice(&[0u8; 32]);
        fragment.extend_from_slice(&[0x00, 0x00, 0x02, 0x00, 0x2f, 0x01, 0x00]);
        fragment.extend_from_slice(&[0x00, 0x05, 0x00, 0x15, 0x00, 0x01, 0x00]);
        let body_len = (fragment.len() - 4) as u32;
        fragment[1..4].copy_from_slice(&body_len.to_be_bytes()[1..]);
        assert!(matches!(parse_client_hello(&fragment), Err(SniffError::NoName)));
    }

    #[test]
    fn test_invalid_utf8_name() {
        // The server name is the last field of the generated record.
        let mut record = client_hello("example.com");
        let last = record.len() - 1;
        record[last] = 0xff;
        assert!(matches!(
            parse_client_hello(&record[5..]),
            Err(SniffError::InvalidName)
        ));
    }

    #[test]
    fn test_empty_fragment() {
        assert!(matches!(
            parse_client_hello(&[]),
            Err(SniffError::InvalidLength("handshake type"))
        ));
    }
}
