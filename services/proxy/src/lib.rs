pub mod config;
pub mod proxy;

pub use config::Config;
pub use proxy::{
    classify, DispatchError, DispatchServer, Dispatched, Handler, HandlerError, HttpProxyHandler,
    HttpProxyServer, Listener, ListenerConfig, ListenerStats, PeekedConnection, Protocol,
    SocksHandler,
};
