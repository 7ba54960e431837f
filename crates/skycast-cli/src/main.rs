use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use skycast_core::Config;
use skycast_weather::{CountryCode, ForecastRequest, ForecastService};

/// Look up a daily forecast for a city
#[derive(Parser)]
#[command(name = "skycast", version, about = "Resilient multi-provider weather forecasts")]
struct Cli {
    /// City name, e.g. "Prague"
    city: String,

    /// ISO 3166-1 alpha-2 country code, e.g. "CZ"
    country: CountryCode,

    /// Number of days to forecast (1-14)
    #[arg(default_value_t = 3)]
    days: u8,

    /// Read configuration from this file instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    skycast_core::init()?;

    let (config, _validation) = Config::load_validated(cli.config.as_deref())?;
    let request = ForecastRequest::new(&cli.city, cli.country, cli.days)?;

    let service = ForecastService::from_config(&config)?;
    let result = service.get_forecast(&request).await;
    service.shutdown().await;

    let forecast = match result {
        Ok(forecast) => forecast,
        Err(e) => {
            tracing::error!("Forecast lookup failed: {}", e);
            anyhow::bail!(e.user_message());
        }
    };

    let output =
        serde_json::to_string_pretty(&forecast).context("Failed to serialize forecast")?;
    println!("{}", output);

    Ok(())
}
