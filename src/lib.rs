pub mod config;
pub mod heartbeat;
pub mod logging;
pub mod parq;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod utils;
pub mod wire;
