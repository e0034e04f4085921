/// TLS record layer codec
///
/// Only what the evasion path needs: read one complete record off the client
/// socket without over-reading, tell whether it carries a ClientHello, and find
/// the byte range of the SNI hostname inside it.
///
/// TLS ClientHello structure:
/// - Record Header (5 bytes): type(1), version(2), length(2)
/// - Handshake Header (4 bytes): type(1), length(3)
/// - ClientHello: version(2), random(32), session_id(1+N), cipher_suites(2+N), compression(1+N), extensions(2+N)
/// - Extensions: each is type(2), length(2), data(N)
/// - SNI extension (type 0x0000): list_length(2), type(1), name_length(2), hostname(N)
use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{EvasionError, Result};

pub const TLS_RECORD_HEADER_SIZE: usize = 5;

/// RFC 8446 §5.1: plaintext records never exceed 2^14 bytes
pub const MAX_RECORD_PAYLOAD: u16 = 16384;

const HANDSHAKE_HEADER_SIZE: usize = 4;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Unknown(u8),
}

impl From<u8> for ContentType {
    fn from(value: u8) -> Self {
        match value {
            0x14 => Self::ChangeCipherSpec,
            0x15 => Self::Alert,
            0x16 => Self::Handshake,
            0x17 => Self::ApplicationData,
            other => Self::Unknown(other),
        }
    }
}

impl From<ContentType> for u8 {
    fn from(value: ContentType) -> Self {
        match value {
            ContentType::ChangeCipherSpec => 0x14,
            ContentType::Alert => 0x15,
            ContentType::Handshake => 0x16,
            ContentType::ApplicationData => 0x17,
            ContentType::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsRecordHeader {
    pub content_type: ContentType,
    pub version: u16,
    pub payload_len: u16,
}

impl TlsRecordHeader {
    /// Parse the fixed 5-byte header, enforcing the record size limit
    pub fn parse(header: &[u8; TLS_RECORD_HEADER_SIZE]) -> Result<Self> {
        let payload_len = u16::from_be_bytes([header[3], header[4]]);
        if payload_len > MAX_RECORD_PAYLOAD {
            return Err(EvasionError::Protocol(format!(
                "TLS record payload of {payload_len} bytes exceeds {MAX_RECORD_PAYLOAD}"
            )));
        }

        Ok(Self {
            content_type: ContentType::from(header[0]),
            version: u16::from_be_bytes([header[1], header[2]]),
            payload_len,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.content_type.into());
        dst.put_u16(self.version);
        dst.put_u16(self.payload_len);
    }
}

/// One complete TLS record, header included in `raw`
#[derive(Debug, Clone)]
pub struct TlsMessage {
    header: TlsRecordHeader,
    raw: Bytes,
}

impl TlsMessage {
    pub fn header(&self) -> &TlsRecordHeader {
        &self.header
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_raw(self) -> Bytes {
        self.raw
    }

    pub fn is_client_hello(&self) -> bool {
        self.header.content_type == ContentType::Handshake
            && self.raw.len() > TLS_RECORD_HEADER_SIZE
            && self.raw[TLS_RECORD_HEADER_SIZE] == HANDSHAKE_CLIENT_HELLO
    }

    pub fn locate_sni(&self) -> Result<SniLocation> {
        locate_sni(&self.raw)
    }
}

/// Read exactly one TLS record from `stream`
///
/// Reads the 5-byte header, then exactly `payload_len` bytes. Anything the
/// client pipelined after the record stays in the stream.
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<TlsMessage> {
    let mut header_buf = [0u8; TLS_RECORD_HEADER_SIZE];
    stream.read_exact(&mut header_buf).await?;
    let header = TlsRecordHeader::parse(&header_buf)?;

    let mut raw = BytesMut::with_capacity(TLS_RECORD_HEADER_SIZE + header.payload_len as usize);
    raw.extend_from_slice(&header_buf);
    raw.resize(TLS_RECORD_HEADER_SIZE + header.payload_len as usize, 0);
    stream.read_exact(&mut raw[TLS_RECORD_HEADER_SIZE..]).await?;

    Ok(TlsMessage {
        header,
        raw: raw.freeze(),
    })
}

/// Byte range of the SNI hostname inside a ClientHello record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniLocation {
    pub start: usize,
    pub end: usize,
}

impl SniLocation {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Bounds-checked cursor over the ClientHello bytes
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn truncated(what: &str) -> EvasionError {
        EvasionError::Protocol(format!("ClientHello truncated while reading {what}"))
    }

    fn skip(&mut self, n: usize, what: &str) -> Result<()> {
        let end = self.pos.checked_add(n).ok_or_else(|| Self::truncated(what))?;
        if end > self.data.len() {
            return Err(Self::truncated(what));
        }
        self.pos = end;
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        let value = *self.data.get(self.pos).ok_or_else(|| Self::truncated(what))?;
        self.pos += 1;
        Ok(value)
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let bytes = self.data.get(self.pos..self.pos + 2).ok_or_else(|| Self::truncated(what))?;
        self.pos += 2;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// Find the SNI hostname in a raw ClientHello record
///
/// Every length field is checked against the buffer before use; a malformed
/// or truncated hello yields an error and the caller proceeds as if there were
/// no SNI.
pub fn locate_sni(data: &[u8]) -> Result<SniLocation> {
    let mut reader = Reader { data, pos: 0 };

    reader.skip(TLS_RECORD_HEADER_SIZE, "record header")?;
    if reader.u8("handshake type")? != HANDSHAKE_CLIENT_HELLO {
        return Err(EvasionError::Protocol("not a ClientHello".to_string()));
    }
    reader.skip(HANDSHAKE_HEADER_SIZE - 1, "handshake length")?;
    reader.skip(2 + 32, "version and random")?;

    let session_id_len = reader.u8("session id length")? as usize;
    reader.skip(session_id_len, "session id")?;

    let cipher_suites_len = reader.u16("cipher suites length")? as usize;
    reader.skip(cipher_suites_len, "cipher suites")?;

    let compression_len = reader.u8("compression methods length")? as usize;
    reader.skip(compression_len, "compression methods")?;

    let extensions_len = reader.u16("extensions length")? as usize;
    let extensions_end = reader.pos + extensions_len;
    if extensions_end > data.len() {
        return Err(Reader::truncated("extensions"));
    }

    while reader.pos + 4 <= extensions_end {
        let ext_type = reader.u16("extension type")?;
        let ext_len = reader.u16("extension length")? as usize;

        if ext_type != EXTENSION_SERVER_NAME {
            reader.skip(ext_len, "extension body")?;
            continue;
        }

        let ext_end = reader.pos + ext_len;
        if ext_end > extensions_end {
            return Err(Reader::truncated("server_name extension"));
        }

        // list_length(2) + name_type(1)
        reader.skip(3, "server name list")?;
        let name_len = reader.u16("server name length")? as usize;
        let start = reader.pos;
        let end = start + name_len;
        if end > ext_end {
            return Err(Reader::truncated("server name"));
        }

        return Ok(SniLocation { start, end });
    }

    Err(EvasionError::NoSni)
}

/// Check if data looks like TLS ClientHello
/// Supports TLS 1.0 through 1.3 record versions
pub fn is_tls_client_hello(data: &[u8]) -> bool {
    data.len() > TLS_RECORD_HEADER_SIZE
        && data[0] == 0x16
        && data[1] == 0x03
        && (0x01..=0x04).contains(&data[2])
        && data[TLS_RECORD_HEADER_SIZE] == HANDSHAKE_CLIENT_HELLO
}
