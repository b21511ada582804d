pub mod error;
pub mod modules;
pub mod proxy;

pub use error::ProxyError;
pub use proxy::config::ProxyConfig;
pub use proxy::service::CachingProxy;
