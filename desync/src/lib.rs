pub mod capture;
pub mod config;
pub mod error;
pub mod net;
pub mod protocols;
pub mod tunnel;

pub use config::{Destination, EvasionConfig, HttpsOptions};
pub use error::{EvasionError, classify_relay_error};
pub use tunnel::transport::dpi_bypass::DpiBypass;
pub use tunnel::transport::tcp_fragmentation::SplitMode;
