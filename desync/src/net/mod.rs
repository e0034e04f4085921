pub mod gateway;
pub mod hop_tracker;
pub mod injector;
pub mod interface;
