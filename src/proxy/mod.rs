// proxy module - caching reverse proxy service

pub mod cache;
pub mod config;
pub mod handlers;
pub mod monitor;
pub mod security;
pub mod server;
pub mod service;
pub mod store;
pub mod throttle;
pub mod upstream;

pub use cache::CacheEngine;
pub use config::ProxyConfig;
pub use monitor::ProxyMonitor;
pub use security::SecurityGate;
pub use server::AxumServer;
pub use service::CachingProxy;
pub use store::Store;
pub use throttle::ThrottleManager;
