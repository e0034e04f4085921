mod client_hello;
mod record;

pub use client_hello::{ClientHelloBuilder, MAX_HOST_NAME_LEN, is_grease_value, select_grease_value};
pub use record::{
    ContentType, MAX_RECORD_PAYLOAD, SniLocation, TLS_RECORD_HEADER_SIZE, TlsMessage, TlsRecordHeader,
    is_tls_client_hello, locate_sni, read_message,
};
