pub mod client;
pub mod order_store;
pub mod rate_limiter;

pub use client::{AccountSnapshot, ExchangeClient, OrderRequest, SymbolConfig};
pub use order_store::OrderStore;
pub use rate_limiter::RateLimiter;
