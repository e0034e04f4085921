pub mod disorder;
pub mod dpi_bypass;
pub mod tcp_fragmentation;

pub use disorder::{DisorderOptions, SocketControl, TtlSwitch, send_segments};
pub use dpi_bypass::DpiBypass;
pub use tcp_fragmentation::{DisorderPattern, FragmentationPlan, FragmentationStats, SplitMode, fragment};
