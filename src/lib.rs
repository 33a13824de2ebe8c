pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod metrics;
pub mod server;
pub mod source;
pub mod transport;
pub mod util;
pub mod wire;
pub mod test_util;
