pub mod backend_client;
pub mod config;
pub mod device_client;
pub mod http_client;
pub mod services;
pub mod session;
pub mod storage;
