//! Outbound osu! API v2 access: token lifecycle, shared rate limiting and typed
//! operations.
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod models;
pub mod token;

pub use client::{OutboundRequest, RateLimitedClient};
pub use config::{LimiterConfig, OsuApiConfig};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{OsuApi, MAX_BATCH_IDS};
pub use limiter::{Acquisition, SharedLimiter};
pub use models::{BeatmapsetListing, Page};
pub use token::{ClientCredentials, TokenManager, TokenSource};
