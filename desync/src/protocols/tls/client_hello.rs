/// Synthetic ClientHello construction
///
/// Decoy packets must look like the start of a real handshake to a censor that
/// parses them, so they carry a complete, browser-shaped ClientHello for an
/// innocuous host. The same builder produces fixtures for the fragmentation
/// tests.
///
/// GREASE values (RFC 8701) are inserted the way Chrome does it: first cipher
/// suite, first and last extension, first supported group. A hello without
/// them is an easy tell for a fingerprinting middlebox.
use bytes::{BufMut, BytesMut};
use rand::RngCore;

use crate::error::{EvasionError, Result};

use super::record::{ContentType, MAX_RECORD_PAYLOAD, TLS_RECORD_HEADER_SIZE, TlsRecordHeader};

/// Longest DNS name that fits the server_name extension of a single record
pub const MAX_HOST_NAME_LEN: usize = 253;

/// GREASE values defined in RFC 8701
/// These are reserved values that MUST be ignored by servers
const GREASE_VALUES: &[u16] = &[
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a,
    0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a,
    0x8a8a, 0x9a9a, 0xaaaa, 0xbaba,
    0xcaca, 0xdada, 0xeaea, 0xfafa,
];

/// Chrome 120 cipher suite order (after the leading GREASE value)
const CIPHER_SUITES: &[u16] = &[
    0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030,
    0xcca9, 0xcca8, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
];

const SUPPORTED_GROUPS: &[u16] = &[0x001d, 0x0017, 0x0018];

const ALPN_PROTOCOLS: &[&str] = &["h2", "http/1.1"];

const SIGNATURE_ALGORITHMS: &[u16] = &[
    0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
];

/// Select a GREASE value from a seed
pub fn select_grease_value(seed: u64) -> u16 {
    let index = (seed as usize) % GREASE_VALUES.len();
    GREASE_VALUES[index]
}

pub fn is_grease_value(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a && (value >> 8) == (value & 0xff)
}

#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    server_name: Option<String>,
    grease: bool,
}

impl ClientHelloBuilder {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: Some(server_name.into()),
            grease: true,
        }
    }

    pub fn without_sni(mut self) -> Self {
        self.server_name = None;
        self
    }

    pub fn without_grease(mut self) -> Self {
        self.grease = false;
        self
    }

    /// Serialize a complete TLS record carrying the ClientHello
    ///
    /// Fails when the server name is empty or longer than
    /// [`MAX_HOST_NAME_LEN`].
    pub fn build(&self) -> Result<Vec<u8>> {
        if let Some(name) = &self.server_name {
            if name.is_empty() || name.len() > MAX_HOST_NAME_LEN {
                return Err(EvasionError::Protocol(format!(
                    "server name must be 1..={} bytes, got {}",
                    MAX_HOST_NAME_LEN,
                    name.len()
                )));
            }
        }

        let mut rng = rand::thread_rng();
        let grease_seed = rng.next_u64();
        let grease = |n: u64| select_grease_value(grease_seed.wrapping_add(n));

        let mut body = BytesMut::with_capacity(512);
        body.put_u16(0x0303);

        let mut random = [0u8; 32];
        rng.fill_bytes(&mut random);
        body.put_slice(&random);

        let mut session_id = [0u8; 32];
        rng.fill_bytes(&mut session_id);
        body.put_u8(session_id.len() as u8);
        body.put_slice(&session_id);

        let suites_len = CIPHER_SUITES.len() + usize::from(self.grease);
        body.put_u16((suites_len * 2) as u16);
        if self.grease {
            body.put_u16(grease(0));
        }
        for suite in CIPHER_SUITES {
            body.put_u16(*suite);
        }

        // compression: null only
        body.put_u8(1);
        body.put_u8(0);

        let extensions = self.extensions(&mut rng, grease);
        body.put_u16(extensions.len() as u16);
        body.put_slice(&extensions);

        let mut handshake = BytesMut::with_capacity(body.len() + 4);
        handshake.put_u8(0x01);
        handshake.put_uint(body.len() as u64, 3);
        handshake.put_slice(&body);

        let payload_len = u16::try_from(handshake.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_PAYLOAD)
            .ok_or_else(|| EvasionError::Protocol(format!("ClientHello of {} bytes overflows a record", handshake.len())))?;

        let mut record = BytesMut::with_capacity(TLS_RECORD_HEADER_SIZE + handshake.len());
        TlsRecordHeader {
            content_type: ContentType::Handshake,
            version: 0x0301,
            payload_len,
        }
        .encode(&mut record);
        record.put_slice(&handshake);
        Ok(record.to_vec())
    }

    fn extensions(&self, rng: &mut impl RngCore, grease: impl Fn(u64) -> u16) -> BytesMut {
        let mut ext = BytesMut::with_capacity(256);

        if self.grease {
            put_extension(&mut ext, grease(1), &[]);
        }

        if let Some(name) = &self.server_name {
            let mut sni = BytesMut::with_capacity(name.len() + 5);
            sni.put_u16((name.len() + 3) as u16);
            sni.put_u8(0); // host_name
            sni.put_u16(name.len() as u16);
            sni.put_slice(name.as_bytes());
            put_extension(&mut ext, 0x0000, &sni);
        }

        // extended_master_secret, renegotiation_info
        put_extension(&mut ext, 0x0017, &[]);
        put_extension(&mut ext, 0xff01, &[0x00]);

        let mut groups = BytesMut::new();
        let groups_len = SUPPORTED_GROUPS.len() + usize::from(self.grease);
        groups.put_u16((groups_len * 2) as u16);
        if self.grease {
            groups.put_u16(grease(2));
        }
        for group in SUPPORTED_GROUPS {
            groups.put_u16(*group);
        }
        put_extension(&mut ext, 0x000a, &groups);

        // ec_point_formats: uncompressed
        put_extension(&mut ext, 0x000b, &[0x01, 0x00]);

        let mut list = BytesMut::new();
        for proto in ALPN_PROTOCOLS {
            list.put_u8(proto.len() as u8);
            list.put_slice(proto.as_bytes());
        }
        let mut alpn = BytesMut::with_capacity(list.len() + 2);
        alpn.put_u16(list.len() as u16);
        alpn.put_slice(&list);
        put_extension(&mut ext, 0x0010, &alpn);

        let mut sig_algs = BytesMut::new();
        sig_algs.put_u16((SIGNATURE_ALGORITHMS.len() * 2) as u16);
        for alg in SIGNATURE_ALGORITHMS {
            sig_algs.put_u16(*alg);
        }
        put_extension(&mut ext, 0x000d, &sig_algs);

        // key_share: one x25519 share
        let mut public_key = [0u8; 32];
        rng.fill_bytes(&mut public_key);
        let mut key_share = BytesMut::with_capacity(38);
        key_share.put_u16(36);
        key_share.put_u16(0x001d);
        key_share.put_u16(32);
        key_share.put_slice(&public_key);
        put_extension(&mut ext, 0x0033, &key_share);

        // supported_versions: TLS 1.3, TLS 1.2
        put_extension(&mut ext, 0x002b, &[0x04, 0x03, 0x04, 0x03, 0x03]);

        if self.grease {
            put_extension(&mut ext, grease(3), &[0x00]);
        }

        ext
    }
}

fn put_extension(dst: &mut BytesMut, ext_type: u16, data: &[u8]) {
    dst.put_u16(ext_type);
    dst.put_u16(data.len() as u16);
    dst.put_slice(data);
}
