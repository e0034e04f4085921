pub mod packet;
pub mod tls;
