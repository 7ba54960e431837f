//! Forecast pipeline error types.

use skycast_core::NetworkError;
use std::fmt;
use thiserror::Error;

/// Where a deadline ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Geocoding,
    Provider,
    Factory,
    Request,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Geocoding => "geocoding",
            Self::Provider => "provider call",
            Self::Factory => "factory hard timeout",
            Self::Request => "request deadline",
        };
        f.write_str(stage)
    }
}

/// Errors from [`GeoResolver`](crate::geocode::GeoResolver) implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeoError {
    #[error("No location matches {city}, {country}")]
    NotFound { city: String, country: String },

    #[error("Geocoding timed out")]
    Timeout,

    #[error("Geocoding cancelled")]
    Cancelled,

    #[error("Geocoding failed: {0}")]
    Upstream(String),
}

/// Errors surfaced by the forecast pipeline.
///
/// `Clone` so a single in-flight computation can hand the same outcome to
/// every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForecastError {
    #[error("City not found: {city}, {country}")]
    CityNotFound { city: String, country: String },

    #[error("Timed out during {0}")]
    Timeout(TimeoutStage),

    #[error("All forecast providers unavailable: {0}")]
    UpstreamUnavailable(Box<ForecastError>),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Provider {provider} failed: {message}")]
    Upstream { provider: String, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ForecastError {
    pub fn upstream(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Map a transport failure from `provider` into the pipeline taxonomy.
    pub fn from_network(provider: &str, err: NetworkError) -> Self {
        match err {
            NetworkError::Timeout => Self::Timeout(TimeoutStage::Provider),
            other => Self::upstream(provider, other.to_string()),
        }
    }

    /// Errors that no amount of retrying or stale data can fix.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CityNotFound { .. } | Self::InvalidRequest(_))
    }

    /// User-friendly error message for display.
    pub fn user_message(&self) -> String {
        match self {
            Self::CityNotFound { city, country } => {
                format!("We couldn't find {} in {}.", city, country)
            }
            Self::Timeout(_) => "The forecast took too long. Please try again.".to_string(),
            Self::UpstreamUnavailable(_) => {
                "Forecast service unavailable. Please try again later.".to_string()
            }
            Self::Cancelled => "The request was cancelled.".to_string(),
            Self::Upstream { .. } => "Forecast provider error. Please try again.".to_string(),
            Self::InvalidRequest(msg) => format!("Invalid request: {}", msg),
        }
    }
}

impl From<GeoError> for ForecastError {
    fn from(err: GeoError) -> Self {
        match err {
            GeoError::NotFound { city, country } => Self::CityNotFound { city, country },
            GeoError::Timeout => Self::Timeout(TimeoutStage::Geocoding),
            GeoError::Cancelled => Self::Cancelled,
            GeoError::Upstream(msg) => Self::upstream("geocoder", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_not_found_becomes_city_not_found() {
        let err: ForecastError = GeoError::NotFound {
            city: "Atlantis".into(),
            country: "GR".into(),
        }
        .into();
        assert!(matches!(err, ForecastError::CityNotFound { ref city, .. } if city == "Atlantis"));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_geo_timeout_keeps_kind() {
        let err: ForecastError = GeoError::Timeout.into();
        assert_eq!(err, ForecastError::Timeout(TimeoutStage::Geocoding));
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_network_timeout_maps_to_provider_timeout() {
        let err = ForecastError::from_network("open_meteo", NetworkError::Timeout);
        assert_eq!(err, ForecastError::Timeout(TimeoutStage::Provider));

        let err = ForecastError::from_network(
            "open_meteo",
            NetworkError::Unreachable("refused".into()),
        );
        assert!(matches!(err, ForecastError::Upstream { ref provider, .. } if provider == "open_meteo"));
    }

    #[test]
    fn test_upstream_unavailable_wraps_source() {
        let err = ForecastError::UpstreamUnavailable(Box::new(ForecastError::upstream(
            "weather_api",
            "HTTP 503",
        )));
        assert!(err.to_string().contains("HTTP 503"));
        assert!(err.user_message().contains("unavailable"));
    }
}
