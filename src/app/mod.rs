//! Application Layer
//!
//! This module contains:
//! - Proxy: the session-multiplexing core (init/run/dispatch/deinit)
//! - ChannelAdapter: the callback surface handed to the engine
//! - Reactor: read-readiness registration and shutdown
//! - Metrics / StatsApi: Prometheus counters and the /metrics endpoint

mod adapter;
pub mod metrics;
mod proxy;
mod reactor;
pub mod stats_api;

pub use adapter::{ChannelAdapter, DispatchReport};
pub use proxy::{Dispatch, DropReason, Proxy, ProxyState};
pub use reactor::{Reactor, Readiness, ShutdownHandle};
