//! TLS ClientHello inspection for SNI routing
//!
//! The SNI listener routes raw TLS streams without terminating them: the
//! server_name from the ClientHello picks the agent, then the bytes are
//! relayed untouched. The walk skips session id, cipher suites and
//! compression methods, then scans the extension list for server_name
//! (type 0) with a host_name entry (type 0).

use crate::tunnel::PeekReader;
use crate::Error;

/// Minimum bytes that must be buffered before the walk can even reach the
/// session id field.
const MIN_CLIENT_HELLO: usize = 42;

/// Peek the ClientHello on `reader` and extract the server_name without
/// consuming anything.
pub async fn peek_sni_host(reader: &mut PeekReader) -> Result<Vec<u8>, Error> {
    reader
        .peek(MIN_CLIENT_HELLO)
        .await
        .map_err(|_| Error::InvalidTls("short record".to_string()))?;
    let buf = reader.buffered_bytes();
    parse_sni(buf).map(|name| name.to_vec())
}

fn err(msg: &str) -> Error {
    Error::InvalidTls(msg.to_string())
}

/// Walk a buffered ClientHello and return the server_name.
pub fn parse_sni(buf: &[u8]) -> Result<&[u8], Error> {
    let len = buf.len();
    let mut i = 0;

    // Record layer: type must be handshake (22).
    if i + 1 > len {
        return Err(err("failed to read record layer type"));
    }
    if buf[i] != 22 {
        return Err(err("record layer is not handshake"));
    }
    i += 1 + 2 + 2; // type, version, record length

    // Handshake: type must be ClientHello (1).
    if i + 1 > len {
        return Err(err("failed to read handshake type"));
    }
    if buf[i] != 1 {
        return Err(err("handshake is not client hello"));
    }
    i += 1 + 3 + 2 + 32; // type, length, version, random

    if i + 1 > len {
        return Err(err("failed to read session id length"));
    }
    let session_id_len = buf[i] as usize;
    i += 1 + session_id_len;

    if i + 2 > len {
        return Err(err("failed to read cipher suites length"));
    }
    let cipher_suites_len = u16::from_be_bytes([buf[i], buf[i + 1]]) as usize;
    i += 2 + cipher_suites_len;

    if i + 1 > len {
        return Err(err("failed to read compression methods length"));
    }
    let compression_len = buf[i] as usize;
    i += 1 + compression_len;

    if i + 2 > len {
        return Err(err("failed to read extensions length"));
    }
    let mut extensions_len = u16::from_be_bytes([buf[i], buf[i + 1]]) as isize;
    i += 2;

    while extensions_len > 0 {
        if i + 2 > len {
            return Err(err("failed to read extension type"));
        }
        let ext_type = u16::from_be_bytes([buf[i], buf[i + 1]]);
        i += 2;
        extensions_len -= 2;
        if i + 2 > len {
            return Err(err("failed to read extension length"));
        }
        let ext_len = u16::from_be_bytes([buf[i], buf[i + 1]]) as usize;
        i += 2;
        extensions_len -= 2;

        if ext_type != 0 {
            i += ext_len;
            extensions_len -= ext_len as isize;
            continue;
        }

        // server_name extension: list length, then entries of (type, len, name).
        i += 2;
        extensions_len -= 2;
        if i + 1 > len {
            return Err(err("failed to read server name type"));
        }
        if buf[i] != 0 {
            return Err(err("server name type is not host_name"));
        }
        i += 1;
        if i + 2 > len {
            return Err(err("failed to read server name length"));
        }
        let name_len = u16::from_be_bytes([buf[i], buf[i + 1]]) as usize;
        i += 2;
        if i + name_len > len {
            return Err(err("failed to read server name"));
        }
        return Ok(&buf[i..i + name_len]);
    }

    Err(err("no server name indication"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal ClientHello carrying a single server_name extension.
    fn client_hello(server_name: &[u8]) -> Vec<u8> {
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&((server_name.len() + 3) as u16).to_be_bytes()); // list len
        sni_ext.push(0); // host_name
        sni_ext.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(server_name);

        let mut extensions = Vec::new();
        // A padding-ish extension first, to exercise the skip path.
        extensions.extend_from_slice(&21u16.to_be_bytes());
        extensions.extend_from_slice(&4u16.to_be_bytes());
        extensions.extend_from_slice(&[0; 4]);
        // server_name extension.
        extensions.extend_from_slice(&0u16.to_be_bytes());
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut hello = Vec::new();
        hello.push(1); // ClientHello
        let body_len = 2 + 32 + 1 + 2 + 2 + 1 + 1 + 2 + extensions.len();
        hello.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]); // 3-byte length
        hello.extend_from_slice(&[0x03, 0x03]); // version
        hello.extend_from_slice(&[0xAA; 32]); // random
        hello.push(0); // session id length
        hello.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1); // compression methods length
        hello.push(0);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut record = vec![22, 0x03, 0x01];
        record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        record.extend_from_slice(&hello);
        record
    }

    #[test]
    fn test_parse_sni() {
        let record = client_hello(b"abc.example.com");
        assert_eq!(parse_sni(&record).unwrap(), b"abc.example.com");
    }

    #[test]
    fn test_parse_sni_rejects_non_handshake() {
        let mut record = client_hello(b"abc.example.com");
        record[0] = 23; // application data
        assert!(parse_sni(&record).is_err());
    }

    #[test]
    fn test_parse_sni_rejects_non_client_hello() {
        let mut record = client_hello(b"abc.example.com");
        record[5] = 2; // ServerHello
        assert!(parse_sni(&record).is_err());
    }

    #[test]
    fn test_parse_sni_truncated() {
        let record = client_hello(b"abc.example.com");
        assert!(parse_sni(&record[..20]).is_err());
    }

    #[test]
    fn test_parse_sni_missing_extension() {
        // ClientHello with zero extensions.
        let mut hello = Vec::new();
        hello.push(1);
        let body_len = 2 + 32 + 1 + 2 + 2 + 1 + 1 + 2;
        hello.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
        hello.extend_from_slice(&[0x03, 0x03]);
        hello.extend_from_slice(&[0xAA; 32]);
        hello.push(0);
        hello.extend_from_slice(&2u16.to_be_bytes());
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1);
        hello.push(0);
        hello.extend_from_slice(&0u16.to_be_bytes());

        let mut record = vec![22, 0x03, 0x01];
        record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        record.extend_from_slice(&hello);

        assert!(parse_sni(&record).is_err());
    }

    #[tokio::test]
    async fn test_peek_sni_host_leaves_bytes_buffered() {
        let record = client_hello(b"abc.example.com");
        let mut reader = PeekReader::new(std::io::Cursor::new(record.clone()));
        let host = peek_sni_host(&mut reader).await.unwrap();
        assert_eq!(host, b"abc.example.com");
        // Nothing consumed: the whole record is still relayable.
        assert_eq!(reader.buffered(), record.len());
    }
}
