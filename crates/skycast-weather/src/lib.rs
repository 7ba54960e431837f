//! Forecast retrieval for SkyCast
//!
//! Resolves a city to coordinates, races an ordered chain of forecast
//! providers with hedging, and fronts the result with a single-flight,
//! fail-safe cache. Every lookup also emits a best-effort side-channel event.

pub mod cache;
pub mod deadline;
pub mod error;
pub mod geocode;
pub mod hedge;
pub mod provider;
pub mod publisher;
pub mod service;
pub mod types;

/// User agent sent by every SkyCast HTTP client.
pub const USER_AGENT: &str = concat!("SkyCast/", env!("CARGO_PKG_VERSION"));

#[cfg(test)]
mod test_support;

pub use cache::{CachePolicy, CacheStats, ResilientCache};
pub use deadline::Deadline;
pub use error::{ForecastError, GeoError, TimeoutStage};
pub use geocode::{GeoResolver, OpenMeteoGeocoder};
pub use hedge::{HedgedInvoker, ProviderOutcome};
pub use provider::{ForecastProvider, OpenMeteoProvider, ProviderChain, WeatherApiProvider};
pub use publisher::{
    EventSink, ForecastRequested, LogSink, PublishError, PublisherStats, SideChannelPublisher,
    WebhookSink,
};
pub use service::ForecastService;
pub use types::*;
