use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use fish_price_forecast::calendar::{self, CALENDARIFIC_KEY_VAR};
use fish_price_forecast::predictor::{EntityQuery, Venue};
use fish_price_forecast::{
    excel, pipeline, server, table, weather, Config, ModelArtifact, Predictor,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "fishprice",
    version,
    about = "Fish price feature pipeline, trainer and prediction server"
)]
struct Cli {
    /// TOML configuration; built-in defaults apply when the file is absent.
    #[arg(long, global = true, env = "FISHPRICE_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert weekly Excel workbooks into CSV sheets.
    ConvertExcel,
    /// Build the festival calendar (Calendarific is used when an API key is set).
    Festivals,
    /// Fetch port weather from Open-Meteo into the raw weather table.
    Weather {
        /// Fetch the upcoming forecast used at prediction time instead.
        #[arg(long)]
        forecast: bool,
    },
    /// Run ingestion through feature engineering.
    Pipeline,
    /// Train the ensemble on the feature table and save the artifact.
    Train {
        /// Run the pipeline first.
        #[arg(long)]
        refresh: bool,
    },
    /// Predict one fish price with a trend series around the date.
    Predict {
        #[arg(long, conflicts_with = "name")]
        fish_id: Option<i64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        date: NaiveDate,
        /// Market the price is quoted at; defaults to the fish's usual market.
        #[arg(long)]
        market: Option<String>,
        #[arg(long)]
        region: Option<String>,
        /// Days on each side of `date` in the trend series.
        #[arg(long)]
        radius: Option<i64>,
    },
    /// Predict every known fish over a date range and write a CSV.
    Forecast {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value = "forecast.csv")]
        output: PathBuf,
    },
    /// Serve predictions over HTTP.
    Serve,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    debug!(?config, "Config loaded successfully");

    match cli.command {
        Command::ConvertExcel => {
            let paths = &config.paths;
            let report = excel::convert_directory(&paths.excel_dir, &paths.raw_price_dir)
                .context("Excel conversion failed")?;
            info!(
                converted = report.converted,
                skipped = report.skipped,
                failed = report.failed,
                "Processed {} workbooks",
                report.total()
            );
        }
        Command::Festivals => {
            let api_key = std::env::var(CALENDARIFIC_KEY_VAR).ok();
            let events = calendar::generate_calendar(&config.festival, api_key.as_deref());
            let path = &config.paths.festival_calendar;
            calendar::write_calendar(&events, path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {} festivals to {}", events.len(), path.display());
        }
        Command::Weather { forecast: false } => {
            let rows = weather::refresh_raw_weather(&config.weather, &config.paths.raw_weather)
                .context("Weather refresh failed")?;
            info!("Fetched {rows} weather observations");
        }
        Command::Weather { forecast: true } => {
            let rows = weather::refresh_forecast(&config.weather, &config.paths.weather_forecast)
                .context("Forecast weather refresh failed")?;
            info!("Fetched {rows} forecast weather observations");
        }
        Command::Pipeline => {
            let report = pipeline::run_pipeline(&config)?;
            info!("Features written to {}", report.features_path.display());
        }
        Command::Train { refresh } => {
            let artifact = if refresh {
                pipeline::retrain(&config)?
            } else {
                pipeline::train_model(&config)?
            };
            for m in &artifact.report.models {
                println!(
                    "{:<18} MAE {:>10.2}  RMSE {:>10.2}  R2 {:>7.4}",
                    m.model, m.mae, m.rmse, m.r_squared
                );
            }
        }
        Command::Predict {
            fish_id,
            name,
            date,
            market,
            region,
            radius,
        } => {
            let query = match (fish_id, name) {
                (Some(id), _) => EntityQuery::Id(id),
                (None, Some(name)) => EntityQuery::Name(name),
                (None, None) => anyhow::bail!("pass --fish-id or --name"),
            };
            let date = config.server.check_date(date)?;
            let radius = config
                .server
                .check_radius(radius.unwrap_or(config.server.series_radius_days))?;
            let artifact = ModelArtifact::load(&config.paths.model_path)?;
            let forecast = weather::load_forecast(&config.paths.weather_forecast, &config.weather)?;
            let venue = Venue { market, region };
            let result = Predictor::new(&artifact)
                .with_forecast(&forecast)
                .predict(&query, &venue, date, radius)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Forecast { start, end, output } => {
            config.server.check_range(start, end)?;
            let artifact = ModelArtifact::load(&config.paths.model_path)?;
            let forecast = weather::load_forecast(&config.paths.weather_forecast, &config.weather)?;
            let mut df = Predictor::new(&artifact)
                .with_forecast(&forecast)
                .forecast(start, end)?;
            table::write_csv(&mut df, &output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Wrote {} forecast rows to {}", df.height(), output.display());
        }
        Command::Serve => {
            let runtime =
                tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
            runtime.block_on(server::serve(config))?;
        }
    }
    Ok(())
}
