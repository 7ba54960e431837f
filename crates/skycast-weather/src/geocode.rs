//! Forward geocoding: convert a city and country into coordinates.
//! Uses the Open-Meteo geocoding API - free, no API key required.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use skycast_core::{NetworkError, ReqwestErrorExt};

use crate::deadline::Deadline;
use crate::error::GeoError;
use crate::types::{CountryCode, GeoCoordinates};
use crate::USER_AGENT;

pub const OPEN_METEO_GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com";
const MAX_CANDIDATES: &str = "10";

/// Resolves a city to coordinates within a deadline.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(
        &self,
        city: &str,
        country: CountryCode,
        deadline: &Deadline,
    ) -> Result<GeoCoordinates, GeoError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    latitude: f64,
    longitude: f64,
    country_code: Option<String>,
    #[allow(dead_code)]
    name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenMeteoGeocoder {
    client: Client,
    base_url: String,
}

impl OpenMeteoGeocoder {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GeoError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| GeoError::Upstream(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn search(&self, city: &str, country: CountryCode) -> Result<GeoCoordinates, GeoError> {
        let url = format!("{}/v1/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("name", city),
                ("count", MAX_CANDIDATES),
                ("language", "en"),
                ("format", "json"),
                ("countryCode", country.as_str()),
            ])
            .send()
            .await
            .map_err(geo_transport_error)?;

        if !response.status().is_success() {
            tracing::debug!("Geocoding returned status {}", response.status());
            return Err(GeoError::Upstream(format!("HTTP {}", response.status())));
        }

        let body: SearchResponse = response.json().await.map_err(geo_transport_error)?;

        // The API filters by country, but it is lenient about it; check again.
        // A hit without a country code cannot be confirmed and is skipped.
        let hit = body.results.into_iter().find(|r| {
            r.country_code
                .as_deref()
                .is_some_and(|cc| cc.eq_ignore_ascii_case(country.as_str()))
        });

        match hit {
            Some(r) => Ok(GeoCoordinates {
                latitude: r.latitude,
                longitude: r.longitude,
            }),
            None => Err(GeoError::NotFound {
                city: city.to_string(),
                country: country.to_string(),
            }),
        }
    }
}

#[async_trait]
impl GeoResolver for OpenMeteoGeocoder {
    async fn resolve(
        &self,
        city: &str,
        country: CountryCode,
        deadline: &Deadline,
    ) -> Result<GeoCoordinates, GeoError> {
        let coords = deadline
            .guard(self.search(city, country), GeoError::Timeout, GeoError::Cancelled)
            .await?;
        tracing::debug!(
            "Geocoded {}, {} to {}, {}",
            city,
            country,
            coords.latitude,
            coords.longitude
        );
        Ok(coords)
    }
}

fn geo_transport_error(err: reqwest::Error) -> GeoError {
    match err.into_network_error() {
        NetworkError::Timeout => GeoError::Timeout,
        other => GeoError::Upstream(other.to_string()),
    }
}
