//! Read path over the two tiers: hot store first, archive fallback with
//! optional rehydration into the hot store.

pub mod proxy;
pub mod single_flight;

pub use proxy::{Lookup, ProxyConfig, ProxyError, ProxyStats, RehydrationProxy, DEFAULT_WRITE_BACK_TIMEOUT};
pub use single_flight::SingleFlight;
