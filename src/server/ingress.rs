//! HTTP ingress demultiplexing
//!
//! Public connections are routed by peeking the request headers for the MUX
//! header (default `Host`) without consuming anything: the full byte stream,
//! peeked bytes included, is relayed to the agent verbatim. The scan walks
//! line by line until the header is found, the headers end, or the buffered
//! prefix exceeds the 2 KiB cap.

use crate::tunnel::PeekReader;
use crate::Error;

/// Upper bound on one header value, matching common proxy limits.
const MAX_HEADER_VALUE: usize = 512;

/// Peek the value of `Host` from the buffered request head.
pub async fn peek_host(reader: &mut PeekReader) -> Result<Vec<u8>, Error> {
    peek_header(reader, "Host").await
}

/// Peek the value of header `name` without consuming the stream.
pub async fn peek_header(reader: &mut PeekReader, name: &str) -> Result<Vec<u8>, Error> {
    let target = format!("{name}:");
    let target = target.as_bytes();
    loop {
        {
            let headers = reader.buffered_bytes();
            let mut s = 0;
            for i in 0..headers.len() {
                if headers[i] != b'\n' {
                    continue;
                }
                if i - s >= target.len() && &headers[s..s + target.len()] == target {
                    let value = headers[s + target.len()..i].trim_ascii();
                    if value.is_empty() || value.len() > MAX_HEADER_VALUE {
                        return Err(Error::InvalidHttp);
                    }
                    return Ok(value.to_vec());
                }
                // CRLF CRLF: headers ended without the target.
                if i >= 3 && &headers[i - 3..=i] == b"\r\n\r\n" {
                    return Err(Error::InvalidHttp);
                }
                s = i + 1;
            }
        }
        if reader.buffered() > crate::MAX_HTTP_HEADER_SIZE {
            return Err(Error::InvalidHttp);
        }
        reader.fill_more().await.map_err(|_| Error::InvalidHttp)?;
    }
}

/// Derive the agent id from a Host value: the substring before the first
/// dot, which must be non-empty and followed by at least `domain.tld`.
pub fn parse_id_from_host(host: &[u8]) -> Result<&[u8], Error> {
    let i = host
        .iter()
        .position(|&b| b == b'.')
        .ok_or(Error::InvalidHttp)?;
    if i == 0 || i + 1 >= host.len() {
        return Err(Error::InvalidHttp);
    }
    match host[i + 1..].iter().position(|&b| b == b'.') {
        Some(j) if j > 0 => Ok(&host[..i]),
        _ => Err(Error::InvalidHttp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn host_of(request: &'static [u8]) -> Result<Vec<u8>, Error> {
        let mut reader = PeekReader::new(request);
        peek_host(&mut reader).await
    }

    #[tokio::test]
    async fn test_peek_host() {
        let host = host_of(
            b"GET /t?hello=world HTTP/1.1\r\nHost: abc.example.com\r\nAccept: */*\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(host, b"abc.example.com");
    }

    #[tokio::test]
    async fn test_peek_host_does_not_consume() {
        let request: &[u8] = b"GET / HTTP/1.1\r\nHost: abc.example.com\r\n\r\n";
        let mut reader = PeekReader::new(request);
        peek_host(&mut reader).await.unwrap();
        assert_eq!(reader.buffered_bytes(), request);
    }

    #[tokio::test]
    async fn test_peek_host_trims_whitespace() {
        let host = host_of(b"GET / HTTP/1.1\r\nHost:   abc.example.com  \r\n\r\n")
            .await
            .unwrap();
        assert_eq!(host, b"abc.example.com");
    }

    #[tokio::test]
    async fn test_peek_header_alternate_name() {
        let request: &'static [u8] =
            b"GET / HTTP/1.1\r\nHost: ignored.example.com\r\nX-Agent: abc\r\n\r\n";
        let mut reader = PeekReader::new(request);
        let value = peek_header(&mut reader, "X-Agent").await.unwrap();
        assert_eq!(value, b"abc");
    }

    #[tokio::test]
    async fn test_peek_host_missing_header() {
        let res = host_of(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_peek_host_oversized_head() {
        // No Host line at all: the scan must give up once the cap is hit.
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        while request.len() <= crate::MAX_HTTP_HEADER_SIZE + 64 {
            request.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        let mut reader = PeekReader::new(std::io::Cursor::new(request));
        assert!(peek_host(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_peek_host_truncated_stream() {
        let res = host_of(b"GET / HT").await;
        assert!(res.is_err());
    }

    #[test]
    fn test_parse_id_from_host() {
        assert_eq!(parse_id_from_host(b"abc.example.com").unwrap(), b"abc");
        assert_eq!(
            parse_id_from_host(b"abc.example.com:8080").unwrap(),
            b"abc"
        );
    }

    #[test]
    fn test_parse_id_requires_two_labels_after_id() {
        // A single dot means there is no id label to split off.
        assert!(parse_id_from_host(b"example.com").is_err());
        assert!(parse_id_from_host(b"example").is_err());
        assert!(parse_id_from_host(b"abc.").is_err());
        assert!(parse_id_from_host(b".example.com").is_err());
        assert!(parse_id_from_host(b"abc..com").is_err());
    }
}
