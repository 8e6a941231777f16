//! HTTP prediction service with a background ingest/retrain worker.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::artifact::ModelArtifact;
use crate::config::{Config, ServerConfig};
use crate::data_loader::{self, DataLoader, Observation};
use crate::error::PipelineError;
use crate::pipeline;
use crate::predictor::{EntityQuery, PredictionResult, Predictor, Venue};
use crate::table;
use crate::weather::{self, WeatherDay};

type Forecast = BTreeMap<NaiveDate, WeatherDay>;

const ROUTES: [&str; 5] = [
    "/ (GET)",
    "/fish (GET)",
    "/predict (POST)",
    "/update_data (POST file)",
    "/retrain (GET)",
];

/// The artifact and forecast weather currently served. Each is replaced
/// wholesale by a pointer swap.
#[derive(Default)]
pub struct ModelStore {
    current: RwLock<Option<Arc<ModelArtifact>>>,
    forecast: RwLock<Arc<Forecast>>,
}

impl ModelStore {
    pub fn get(&self) -> Option<Arc<ModelArtifact>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn publish(&self, artifact: ModelArtifact) {
        let artifact = Arc::new(artifact);
        match self.current.write() {
            Ok(mut guard) => *guard = Some(artifact),
            Err(poisoned) => *poisoned.into_inner() = Some(artifact),
        }
    }

    pub fn forecast(&self) -> Arc<Forecast> {
        match self.forecast.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn publish_forecast(&self, forecast: Forecast) {
        let forecast = Arc::new(forecast);
        match self.forecast.write() {
            Ok(mut guard) => *guard = forecast,
            Err(poisoned) => *poisoned.into_inner() = forecast,
        }
    }

    /// Reloads forecast weather from disk, keeping the old one on failure.
    pub fn reload_forecast(&self, config: &Config) {
        match weather::load_forecast(&config.paths.weather_forecast, &config.weather) {
            Ok(forecast) => {
                debug!("Loaded forecast weather for {} days", forecast.len());
                self.publish_forecast(forecast);
            }
            Err(e) => warn!("Failed to load forecast weather, keeping the previous one: {e}"),
        }
    }
}

#[derive(Debug)]
pub enum Job {
    Ingest(Vec<Observation>),
    Retrain,
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    model: Arc<ModelStore>,
    jobs: mpsc::Sender<Job>,
}

impl AppState {
    pub fn new(config: Arc<Config>, model: Arc<ModelStore>, jobs: mpsc::Sender<Job>) -> Self {
        Self { config, model, jobs }
    }

    fn model(&self) -> Result<Arc<ModelArtifact>, ApiError> {
        self.model.get().ok_or(ApiError::ModelMissing)
    }

    fn enqueue(&self, job: Job) -> Result<(), ApiError> {
        self.jobs.try_send(job).map_err(queue_full)
    }

    /// Queues the ingest and the retrain after it, or neither.
    fn enqueue_upload(&self, rows: Vec<Observation>) -> Result<(), ApiError> {
        let ingest = self.jobs.try_reserve().map_err(queue_full)?;
        let retrain = self.jobs.try_reserve().map_err(queue_full)?;
        ingest.send(Job::Ingest(rows));
        retrain.send(Job::Retrain);
        Ok(())
    }
}

fn queue_full<T>(e: TrySendError<T>) -> ApiError {
    warn!("Rejected job: {e}");
    ApiError::QueueFull
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid date '{0}': expected YYYY-MM-DD between {1} and {2}")]
    InvalidDate(String, NaiveDate, NaiveDate),
    #[error("Model not found. Train first.")]
    ModelMissing,
    #[error("{0}")]
    BadRequest(String),
    #[error("Job queue is full, try again later")]
    QueueFull,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidDate(..) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ModelMissing | ApiError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pipeline(PipelineError::UnknownEntity(_)) => StatusCode::NOT_FOUND,
            ApiError::Pipeline(
                PipelineError::MissingColumn { .. }
                | PipelineError::InvalidInput(_)
                | PipelineError::DataLoading(_),
            ) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!("Request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub fish_id: Option<i64>,
    #[serde(alias = "sinhala_name", alias = "fish", alias = "fish_type")]
    pub name: Option<String>,
    pub date: String,
    pub market: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FishEntry {
    pub fish_id: Option<i64>,
    pub name: String,
    pub common_name: Option<String>,
    pub code: u32,
    pub last_date: Option<String>,
}

/// Parses `raw` as `YYYY-MM-DD` and checks it against the served range.
pub fn validate_date(raw: &str, server: &ServerConfig) -> Result<NaiveDate, ApiError> {
    let invalid = || ApiError::InvalidDate(raw.to_string(), server.min_date, server.max_date);
    let date = NaiveDate::parse_from_str(raw.trim(), table::DATE_FORMAT).map_err(|_| invalid())?;
    if date < server.min_date || date > server.max_date {
        return Err(invalid());
    }
    Ok(date)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/fish", get(list_fish))
        .route("/predict", post(predict))
        .route("/update_data", post(update_data))
        .route("/retrain", get(retrain).post(retrain))
        .with_state(state)
}

pub async fn root(State(state): State<AppState>) -> Json<Value> {
    let model = state.model.get();
    Json(json!({
        "status": "Fish Price Prediction API running",
        "model_loaded": model.is_some(),
        "trained_at": model.map(|m| m.trained_at.to_rfc3339()),
        "routes": ROUTES,
    }))
}

pub async fn list_fish(State(state): State<AppState>) -> Result<Json<Vec<FishEntry>>, ApiError> {
    let model = state.model()?;
    Ok(Json(
        model
            .profiles
            .iter()
            .map(|p| FishEntry {
                fish_id: p.entity_id,
                name: p.name.clone(),
                common_name: p.common_name.clone(),
                code: p.code,
                last_date: p.last_date.map(table::format_date),
            })
            .collect(),
    ))
}

pub async fn predict(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictionResult>, ApiError> {
    debug!(fish_id = ?request.fish_id, name = ?request.name, "Predict for {}", request.date);
    let date = validate_date(&request.date, &state.config.server)?;
    let model = state.model()?;
    let query = match (request.fish_id, request.name) {
        (Some(id), _) => EntityQuery::Id(id),
        (None, Some(name)) if !name.trim().is_empty() => EntityQuery::Name(name),
        _ => return Err(ApiError::BadRequest("fish_id or name is required".to_string())),
    };
    let venue = Venue {
        market: request.market,
        region: request.region,
    };
    let forecast = state.model.forecast();
    let radius = state.config.server.series_radius_days;
    let result = Predictor::new(&model)
        .with_forecast(&forecast)
        .predict(&query, &venue, date, radius)?;
    Ok(Json(result))
}

/// Normalizes an uploaded CSV into observations.
pub fn parse_upload(
    config: &Config,
    bytes: Vec<u8>,
    file_name: &str,
) -> Result<Vec<Observation>, ApiError> {
    let df = table::read_csv_bytes(bytes)?;
    let (rows, report) = DataLoader::new(&config.ingest).parse_price_frame(&df, file_name)?;
    if rows.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "{file_name} has no usable price rows ({} dropped)",
            report.rows_dropped
        )));
    }
    info!(
        dropped = report.rows_dropped,
        "Parsed {} uploaded rows from {file_name}",
        rows.len()
    );
    Ok(rows)
}

pub async fn update_data(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload.csv").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let rows = parse_upload(&state.config, bytes.to_vec(), &file_name)?;
        let added = rows.len();
        state.enqueue_upload(rows)?;
        let body = json!({
            "status": "Dataset update queued; retraining follows",
            "records_added": added,
        });
        return Ok((StatusCode::ACCEPTED, Json(body)));
    }
    Err(ApiError::BadRequest("Please upload CSV file under `file`".to_string()))
}

pub async fn retrain(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.enqueue(Job::Retrain)?;
    let body = json!({ "status": "Retraining queued" });
    Ok((StatusCode::ACCEPTED, Json(body)))
}

/// Runs one job to completion. Blocking; call from `spawn_blocking`.
pub fn execute(config: &Config, store: &ModelStore, job: Job) -> anyhow::Result<()> {
    match job {
        Job::Ingest(rows) => {
            let loader = DataLoader::new(&config.ingest);
            let added = data_loader::append_to_store(&config.paths.uploads, rows, &loader)?;
            info!("Ingested {added} uploaded records");
        }
        Job::Retrain => {
            let artifact = pipeline::retrain(config)?;
            store.publish(artifact);
            store.reload_forecast(config);
            info!("Retrained model published");
        }
    }
    Ok(())
}

/// Consumes jobs one at a time until every sender is dropped.
pub async fn run_worker(
    config: Arc<Config>,
    store: Arc<ModelStore>,
    mut jobs: mpsc::Receiver<Job>,
) {
    while let Some(job) = jobs.recv().await {
        let config = Arc::clone(&config);
        let store = Arc::clone(&store);
        let label = match &job {
            Job::Ingest(rows) => format!("ingest of {} rows", rows.len()),
            Job::Retrain => "retrain".to_string(),
        };
        match tokio::task::spawn_blocking(move || execute(&config, &store, job)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Job {label} failed: {e:#}"),
            Err(e) => error!("Job {label} panicked: {e}"),
        }
    }
    info!("Job queue closed");
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let store = Arc::new(ModelStore::default());

    let model_path = config.paths.model_path.clone();
    match tokio::task::spawn_blocking(move || ModelArtifact::load(&model_path)).await? {
        Ok(artifact) => store.publish(artifact),
        Err(PipelineError::ModelArtifactMissing(path)) => {
            warn!("No model at {}; /predict answers 503 until a retrain", path.display())
        }
        Err(e) => return Err(e).context("Failed to load model artifact"),
    }
    let forecast_store = Arc::clone(&store);
    let forecast_config = Arc::clone(&config);
    tokio::task::spawn_blocking(move || forecast_store.reload_forecast(&forecast_config)).await?;

    let (sender, receiver) = mpsc::channel(config.server.job_queue_capacity.max(1));
    tokio::spawn(run_worker(Arc::clone(&config), Arc::clone(&store), receiver));

    let app = router(AppState::new(Arc::clone(&config), store, sender));
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
