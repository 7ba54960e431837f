use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use skycast_core::Config;

use crate::cache::{CachePolicy, CacheStats, ResilientCache};
use crate::deadline::Deadline;
use crate::error::ForecastError;
use crate::geocode::{GeoResolver, OpenMeteoGeocoder};
use crate::hedge::HedgedInvoker;
use crate::provider::{ForecastProvider, OpenMeteoProvider, ProviderChain, WeatherApiProvider};
use crate::publisher::{EventSink, LogSink, PublisherStats, SideChannelPublisher, WebhookSink};
use crate::types::{ForecastDay, ForecastRequest};
use crate::USER_AGENT;

/// Entry point for forecast lookups: publisher, cache and hedged providers wired together.
pub struct ForecastService {
    chain: ProviderChain,
    invoker: HedgedInvoker,
    cache: ResilientCache<Vec<ForecastDay>>,
    policy: CachePolicy,
    publisher: SideChannelPublisher,
    request_timeout: Duration,
}

impl ForecastService {
    /// Build the service from configuration.
    ///
    /// Must be called inside a tokio runtime; the publisher worker is spawned here.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        let chain = build_chain(config, &client)?;
        let sink: Arc<dyn EventSink> = match config.publisher.webhook_url.as_deref() {
            Some(url) => Arc::new(WebhookSink::new(client.clone(), url)),
            None => Arc::new(LogSink),
        };
        let publisher = SideChannelPublisher::spawn(
            sink,
            config.publisher.queue_capacity,
            config.publisher.publish_timeout(),
        );

        tracing::info!(
            "Forecast service ready (providers: {}, hedge after {:?})",
            chain.names().join(" -> "),
            config.forecast.primary_max_duration()
        );

        Ok(Self::from_parts(
            chain,
            HedgedInvoker::new(config.forecast.primary_max_duration()),
            CachePolicy::from_config(&config.cache),
            config.cache.max_entries,
            publisher,
            config.forecast.request_timeout(),
        ))
    }

    pub fn from_parts(
        chain: ProviderChain,
        invoker: HedgedInvoker,
        policy: CachePolicy,
        max_entries: usize,
        publisher: SideChannelPublisher,
        request_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            invoker,
            cache: ResilientCache::new(max_entries),
            policy,
            publisher,
            request_timeout,
        }
    }

    /// Look up a forecast under the configured request timeout.
    pub async fn get_forecast(
        &self,
        request: &ForecastRequest,
    ) -> Result<Vec<ForecastDay>, ForecastError> {
        let deadline = Deadline::after(self.request_timeout);
        self.get_forecast_with_deadline(request, &deadline).await
    }

    /// Look up a forecast under a caller-supplied deadline and cancellation token.
    pub async fn get_forecast_with_deadline(
        &self,
        request: &ForecastRequest,
        deadline: &Deadline,
    ) -> Result<Vec<ForecastDay>, ForecastError> {
        tracing::debug!("Forecast requested for {}", request);
        self.publisher.notify(request);

        let chain = self.chain.clone();
        let invoker = self.invoker.clone();
        let owned = request.clone();
        let factory = move |scope: Deadline| async move {
            invoker.fetch(&owned, &chain, &scope).await
        };

        let result = self
            .cache
            .get_or_compute(&request.cache_key(), factory, &self.policy, deadline)
            .await;

        if let Err(e) = &result {
            tracing::warn!("Forecast for {} failed: {}", request, e);
        }
        result
    }

    pub fn providers(&self) -> Vec<&str> {
        self.chain.names()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn publisher_stats(&self) -> PublisherStats {
        self.publisher.stats()
    }

    /// Drop entries no longer servable, fresh or stale.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Flush pending side-channel events and stop the worker.
    pub async fn shutdown(self) -> PublisherStats {
        self.publisher.shutdown().await
    }
}

fn build_chain(config: &Config, client: &Client) -> Result<ProviderChain> {
    let geo: Arc<dyn GeoResolver> = Arc::new(OpenMeteoGeocoder::with_client(
        client.clone(),
        config.providers.open_meteo.geocoding_url.as_str(),
    ));

    let mut providers: Vec<Arc<dyn ForecastProvider>> = Vec::new();
    for name in config.enabled_provider_names() {
        match name {
            OpenMeteoProvider::NAME => providers.push(Arc::new(OpenMeteoProvider::new(
                client.clone(),
                config.providers.open_meteo.forecast_url.as_str(),
                Arc::clone(&geo),
            ))),
            WeatherApiProvider::NAME => {
                let weather_api = &config.providers.weather_api;
                if let Some(key) = weather_api.api_key.as_deref() {
                    providers.push(Arc::new(WeatherApiProvider::new(
                        client.clone(),
                        weather_api.base_url.as_str(),
                        key,
                        Arc::clone(&geo),
                    )));
                }
            }
            other => tracing::warn!("Skipping unknown provider: {}", other),
        }
    }

    if providers.is_empty() {
        anyhow::bail!("No forecast providers are enabled");
    }

    ProviderChain::new(providers).context("Invalid provider chain")
}
