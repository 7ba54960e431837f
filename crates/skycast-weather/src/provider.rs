//! Forecast providers and the ordered chain the hedged invoker walks.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use skycast_core::ReqwestErrorExt;
use std::collections::HashSet;
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::error::{ForecastError, TimeoutStage};
use crate::geocode::GeoResolver;
use crate::types::{ForecastDay, ForecastRequest, GeoCoordinates, WeatherCondition};

pub const OPEN_METEO_FORECAST_URL: &str = "https://api.open-meteo.com";
pub const WEATHER_API_URL: &str = "https://api.weatherapi.com";

/// WeatherAPI error code for "No matching location found"
const WEATHER_API_NO_LOCATION: i64 = 1006;

/// A named upstream forecast source.
///
/// Implementations must check `deadline` at every I/O boundary so a losing
/// hedge leg stops promptly once its scope is cancelled.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        request: &ForecastRequest,
        deadline: &Deadline,
    ) -> Result<Vec<ForecastDay>, ForecastError>;
}

/// Ordered, immutable list of providers, highest priority first.
#[derive(Clone)]
pub struct ProviderChain {
    providers: Arc<[Arc<dyn ForecastProvider>]>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn ForecastProvider>>) -> Result<Self, ForecastError> {
        let mut names = HashSet::new();
        for provider in &providers {
            if !names.insert(provider.name().to_string()) {
                return Err(ForecastError::InvalidRequest(format!(
                    "duplicate provider name: {}",
                    provider.name()
                )));
            }
        }
        Ok(Self {
            providers: providers.into(),
        })
    }

    pub fn providers(&self) -> &[Arc<dyn ForecastProvider>] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

impl std::fmt::Debug for ProviderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderChain")
            .field("providers", &self.names())
            .finish()
    }
}

/// Order by date, drop duplicate dates, and cut to the requested length.
///
/// A provider returning fewer days than asked for has failed; partial
/// forecasts are never passed on.
pub fn normalize_days(
    provider: &str,
    days: u8,
    mut forecast: Vec<ForecastDay>,
) -> Result<Vec<ForecastDay>, ForecastError> {
    forecast.sort_by_key(|d| d.date);
    forecast.dedup_by_key(|d| d.date);

    let wanted = usize::from(days);
    if forecast.len() < wanted {
        return Err(ForecastError::upstream(
            provider,
            format!("returned {} of {} requested days", forecast.len(), wanted),
        ));
    }
    forecast.truncate(wanted);
    Ok(forecast)
}

fn provider_timeout() -> ForecastError {
    ForecastError::Timeout(TimeoutStage::Provider)
}

// ---------------------------------------------------------------------------
// Open-Meteo
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    daily: OpenMeteoDaily,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoDaily {
    time: Vec<NaiveDate>,
    #[serde(default)]
    weather_code: Vec<Option<i32>>,
    temperature_2m_max: Vec<Option<f64>>,
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_mean: Vec<Option<f64>>,
}

pub struct OpenMeteoProvider {
    client: Client,
    base_url: String,
    geo: Arc<dyn GeoResolver>,
}

impl OpenMeteoProvider {
    pub const NAME: &'static str = "open_meteo";

    pub fn new(client: Client, base_url: impl Into<String>, geo: Arc<dyn GeoResolver>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            geo,
        }
    }

    async fn fetch_daily(
        &self,
        coords: GeoCoordinates,
        days: u8,
    ) -> Result<Vec<ForecastDay>, ForecastError> {
        let url = format!("{}/v1/forecast", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("latitude", coords.latitude.to_string()),
                ("longitude", coords.longitude.to_string()),
                (
                    "daily",
                    "weather_code,temperature_2m_max,temperature_2m_min,temperature_2m_mean"
                        .to_string(),
                ),
                ("forecast_days", days.to_string()),
                ("timezone", "auto".to_string()),
            ])
            .send()
            .await
            .map_err(|e| ForecastError::from_network(Self::NAME, e.into_network_error()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForecastError::upstream(Self::NAME, format!("HTTP {}", status)));
        }

        let body: OpenMeteoResponse = response
            .json()
            .await
            .map_err(|e| ForecastError::from_network(Self::NAME, e.into_network_error()))?;

        Self::parse_daily(body.daily)
    }

    fn parse_daily(daily: OpenMeteoDaily) -> Result<Vec<ForecastDay>, ForecastError> {
        let mut forecast = Vec::with_capacity(daily.time.len());

        for (i, date) in daily.time.iter().enumerate() {
            let max = daily.temperature_2m_max.get(i).copied().flatten();
            let min = daily.temperature_2m_min.get(i).copied().flatten();
            let (Some(max), Some(min)) = (max, min) else {
                return Err(ForecastError::upstream(
                    Self::NAME,
                    format!("missing temperatures for {}", date),
                ));
            };
            let avg = daily
                .temperature_2m_mean
                .get(i)
                .copied()
                .flatten()
                .unwrap_or((max + min) / 2.0);
            let condition = daily
                .weather_code
                .get(i)
                .copied()
                .flatten()
                .map(WeatherCondition::from_wmo_code)
                .unwrap_or_default();

            forecast.push(ForecastDay {
                date: *date,
                min_temp_c: min,
                max_temp_c: max,
                avg_temp_c: avg,
                condition_text: condition.description().to_string(),
            });
        }

        Ok(forecast)
    }
}

#[async_trait]
impl ForecastProvider for OpenMeteoProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn fetch(
        &self,
        request: &ForecastRequest,
        deadline: &Deadline,
    ) -> Result<Vec<ForecastDay>, ForecastError> {
        let coords = self
            .geo
            .resolve(request.city(), request.country_code(), deadline)
            .await?;

        let forecast = deadline
            .guard(
                self.fetch_daily(coords, request.days()),
                provider_timeout(),
                ForecastError::Cancelled,
            )
            .await?;

        normalize_days(Self::NAME, request.days(), forecast)
    }
}

// ---------------------------------------------------------------------------
// WeatherAPI
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WeatherApiResponse {
    forecast: WeatherApiForecast,
}

#[derive(Debug, Deserialize)]
struct WeatherApiForecast {
    forecastday: Vec<WeatherApiDay>,
}

#[derive(Debug, Deserialize)]
struct WeatherApiDay {
    date: NaiveDate,
    day: WeatherApiDaySummary,
}

#[derive(Debug, Deserialize)]
struct WeatherApiDaySummary {
    maxtemp_c: f64,
    mintemp_c: f64,
    avgtemp_c: f64,
    condition: WeatherApiCondition,
}

#[derive(Debug, Deserialize)]
struct WeatherApiCondition {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WeatherApiErrorBody {
    error: WeatherApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WeatherApiErrorDetail {
    code: i64,
    message: String,
}

pub struct WeatherApiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    geo: Arc<dyn GeoResolver>,
}

impl WeatherApiProvider {
    pub const NAME: &'static str = "weather_api";

    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        geo: Arc<dyn GeoResolver>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            geo,
        }
    }

    async fn fetch_daily(
        &self,
        request: &ForecastRequest,
        coords: GeoCoordinates,
    ) -> Result<Vec<ForecastDay>, ForecastError> {
        let url = format!("{}/v1/forecast.json", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("key", self.api_key.clone()),
                ("q", format!("{},{}", coords.latitude, coords.longitude)),
                ("days", request.days().to_string()),
                ("aqi", "no".to_string()),
                ("alerts", "no".to_string()),
            ])
            .send()
            .await
            .map_err(|e| ForecastError::from_network(Self::NAME, e.into_network_error()))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let detail = response.json::<WeatherApiErrorBody>().await.ok();
            return Err(match detail {
                Some(body) if body.error.code == WEATHER_API_NO_LOCATION => {
                    ForecastError::CityNotFound {
                        city: request.city().to_string(),
                        country: request.country_code().to_string(),
                    }
                }
                Some(body) => ForecastError::upstream(
                    Self::NAME,
                    format!("API error {}: {}", body.error.code, body.error.message),
                ),
                None => ForecastError::upstream(Self::NAME, "HTTP 400"),
            });
        }
        if !status.is_success() {
            return Err(ForecastError::upstream(Self::NAME, format!("HTTP {}", status)));
        }

        let body: WeatherApiResponse = response
            .json()
            .await
            .map_err(|e| ForecastError::from_network(Self::NAME, e.into_network_error()))?;

        Ok(body
            .forecast
            .forecastday
            .into_iter()
            .map(|d| ForecastDay {
                date: d.date,
                min_temp_c: d.day.mintemp_c,
                max_temp_c: d.day.maxtemp_c,
                avg_temp_c: d.day.avgtemp_c,
                condition_text: d.day.condition.text.trim().to_string(),
            })
            .collect())
    }
}

#[async_trait]
impl ForecastProvider for WeatherApiProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn fetch(
        &self,
        request: &ForecastRequest,
        deadline: &Deadline,
    ) -> Result<Vec<ForecastDay>, ForecastError> {
        let coords = self
            .geo
            .resolve(request.city(), request.country_code(), deadline)
            .await?;

        let forecast = deadline
            .guard(
                self.fetch_daily(request, coords),
                provider_timeout(),
                ForecastError::Cancelled,
            )
            .await?;

        normalize_days(Self::NAME, request.days(), forecast)
    }
}
