//! End-to-end tests for ForecastService against mocked Open-Meteo and WeatherAPI endpoints.

use std::time::{Duration, Instant};

use skycast_core::Config;
use skycast_weather::{ForecastError, ForecastRequest, ForecastService, USER_AGENT};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.providers.open_meteo.forecast_url = server.uri();
    config.providers.open_meteo.geocoding_url = server.uri();
    config.providers.weather_api.base_url = server.uri();
    config.providers.weather_api.api_key = Some("test-key".to_string());
    config
}

fn request(city: &str, days: u8) -> ForecastRequest {
    ForecastRequest::new(city, "cz".parse().unwrap(), days).unwrap()
}

/// Helper to create an Open-Meteo geocoding hit
fn geocode_hit(name: &str, lat: f64, lon: f64) -> serde_json::Value {
    serde_json::json!({
        "results": [
            {"name": name, "latitude": lat, "longitude": lon, "country_code": "CZ"}
        ]
    })
}

/// Helper to create an Open-Meteo daily forecast body
fn open_meteo_daily(max: &[f64]) -> serde_json::Value {
    let time: Vec<String> = (0..max.len())
        .map(|i| format!("2026-04-{:02}", i + 1))
        .collect();
    let min: Vec<f64> = max.iter().map(|t| t - 8.0).collect();
    serde_json::json!({
        "daily": {
            "time": time,
            "weather_code": vec![2; max.len()],
            "temperature_2m_max": max,
            "temperature_2m_min": min
        }
    })
}

/// Helper to create a WeatherAPI forecast body
fn weather_api_days(max: &[f64]) -> serde_json::Value {
    let days: Vec<serde_json::Value> = max
        .iter()
        .enumerate()
        .map(|(i, t)| {
            serde_json::json!({
                "date": format!("2026-04-{:02}", i + 1),
                "day": {
                    "maxtemp_c": t,
                    "mintemp_c": t - 6.0,
                    "avgtemp_c": t - 3.0,
                    "condition": {"text": "Sunny"}
                }
            })
        })
        .collect();
    serde_json::json!({ "forecast": { "forecastday": days } })
}

async fn mount_geocoder(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/search"))
        .and(query_param("name", "Prague"))
        .respond_with(ResponseTemplate::new(200).set_body_json(geocode_hit("Prague", 50.08, 14.42)))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_forecast_is_fetched_then_cached() {
    let server = MockServer::start().await;
    mount_geocoder(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .and(query_param("forecast_days", "2"))
        .and(header("user-agent", USER_AGENT))
        .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_daily(&[21.0, 19.5])))
        .expect(1)
        .mount(&server)
        .await;

    let service = ForecastService::from_config(&config_for(&server)).unwrap();

    let first = service.get_forecast(&request("Prague", 2)).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].max_temp_c, 21.0);
    assert_eq!(first[0].min_temp_c, 13.0);
    assert_eq!(first[0].condition_text, "Partly cloudy");

    let second = service.get_forecast(&request("PRAGUE", 2)).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(service.cache_stats().hits, 1);

    let published = service.shutdown().await;
    assert_eq!(published.published, 2);
}

#[tokio::test]
async fn test_unknown_city_reports_city_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let service = ForecastService::from_config(&config_for(&server)).unwrap();

    for _ in 0..2 {
        let err = service
            .get_forecast(&request("Atlantis", 1))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ForecastError::CityNotFound { ref city, .. } if city == "Atlantis"),
            "unexpected error: {:?}",
            err
        );
    }
    assert_eq!(service.cache_stats().misses, 2);
}

#[tokio::test]
async fn test_slow_primary_is_hedged_to_secondary() {
    let server = MockServer::start().await;
    mount_geocoder(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(open_meteo_daily(&[10.0]))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast.json"))
        .and(query_param("key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(weather_api_days(&[25.0])))
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.forecast.primary_max_duration_ms = 100;
    let service = ForecastService::from_config(&config).unwrap();

    let started = Instant::now();
    let days = service.get_forecast(&request("Prague", 1)).await.unwrap();

    assert_eq!(days[0].max_temp_c, 25.0);
    assert_eq!(days[0].condition_text, "Sunny");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_all_providers_failing_is_upstream_unavailable() {
    let server = MockServer::start().await;
    mount_geocoder(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast.json"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let service = ForecastService::from_config(&config_for(&server)).unwrap();
    let err = service.get_forecast(&request("Prague", 1)).await.unwrap_err();

    assert!(
        matches!(err, ForecastError::UpstreamUnavailable(_)),
        "unexpected error: {:?}",
        err
    );
}

#[tokio::test]
async fn test_short_provider_answer_falls_back() {
    let server = MockServer::start().await;
    mount_geocoder(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_daily(&[12.0])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(weather_api_days(&[14.0, 15.0, 16.0])))
        .mount(&server)
        .await;

    let service = ForecastService::from_config(&config_for(&server)).unwrap();
    let days = service.get_forecast(&request("Prague", 3)).await.unwrap();

    assert_eq!(days.len(), 3);
    assert_eq!(days[2].max_temp_c, 16.0);
}

#[tokio::test]
async fn test_service_requires_an_enabled_provider() {
    let server = MockServer::start().await;
    let mut config = config_for(&server);
    config.providers.open_meteo.enabled = false;
    config.providers.weather_api.api_key = None;

    assert!(ForecastService::from_config(&config).is_err());
}
