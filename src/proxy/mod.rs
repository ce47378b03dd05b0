//! The proxy core: endpoints, config, coordinator, sessions, listeners.

pub mod acceptor;
pub mod addr;
pub mod admin;
pub mod config;
pub mod coordinator;
pub mod raw;
pub mod server;
pub mod session;
pub mod signals;

pub use addr::{AddrSpec, Incoming, Listener, Network};
pub use config::{Config, ConfigError, ConfigLoader, FileConfigLoader, StaticConfigLoader};
pub use coordinator::{
    Coordinator, ProxyError, ProxyHandle, ProxyInfo, ProxyState, Ticket, MAX_CONNECTIONS,
};
pub use raw::RawRegistry;
pub use server::Proxy;
pub use session::Session;
pub use signals::watch_signals;
