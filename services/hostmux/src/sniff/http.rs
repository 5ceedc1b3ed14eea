//! `Host` header extraction from a plain HTTP/1.x request.

use std::io;

use tokio::io::AsyncRead;

use super::Sniffed;
use crate::buffer::PooledBuffer;
use crate::error::SniffError;

const END_OF_HEADERS: &[u8] = b"\r\n\r\n";
const END_OF_LINE: &[u8] = b"\r\n";
const HOST_TOKEN: &[u8] = b"\r\nHost: ";

/// Read until the end of the request headers and return the `Host` value.
///
/// Everything read stays in `buf`, including body bytes that arrived with the
/// headers. The header block must fit in the buffer; a peer that fills it
/// without finishing its headers gets [`SniffError::InvalidHeaders`].
pub async fn read_http_server_name<R>(
    reader: &mut R,
    buf: &mut PooledBuffer,
) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin,
{
    let mut searched = 0;
    loop {
        if let Some(end) = find(&buf.filled()[searched..], END_OF_HEADERS) {
            // Keep the CRLF that terminates the last header line.
            let headers = &buf.filled()[..searched + end + END_OF_LINE.len()];
            let hostname = host_header(headers).ok_or(SniffError::NoHost)?;
            return Ok(Sniffed {
                consumed: buf.len(),
                hostname,
            });
        }
        searched = buf.len().saturating_sub(END_OF_HEADERS.len() - 1);

        if buf.remaining() == 0 {
            return Err(SniffError::InvalidHeaders);
        }
        match buf.read_from(reader).await {
            Ok(0) => return Err(SniffError::InvalidHeaders),
            Ok(_) => {}
            Err(e) if is_temporary(&e) => continue,
            Err(e) => return Err(SniffError::Io(e)),
        }
    }
}

fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Find the first `Host: ` line in a header block ending in CRLF.
fn host_header(headers: &[u8]) -> Option<String> {
    let start = find(headers, HOST_TOKEN)? + HOST_TOKEN.len();
    let len = find(&headers[start..], END_OF_LINE)?;
    let value = String::from_utf8_lossy(&headers[start..start + len]);
    Some(value.trim().to_string())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
