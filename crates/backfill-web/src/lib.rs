//! Axum HTTP surface for the back-fill pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use backfill_core::{parse_column_ref, ConfigurationError, Identifier};
use backfill_pipeline::{Pipeline, PipelineConfig, RunReport};
use backfill_resolver::{BatchResolver, DatabaseConfig, LookupError, ResolverConfig, SqlLookup, Tier};
use backfill_storage::{default_output_path, SourceFormatError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "backfill-web";

const UPLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

pub struct AppState {
    pub database: RwLock<Option<DatabaseConfig>>,
    pub pipeline: PipelineConfig,
    pub output_dir: PathBuf,
}

impl AppState {
    pub fn new(pipeline: PipelineConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            database: RwLock::new(None),
            pipeline,
            output_dir: output_dir.into(),
        }
    }

    /// Environment-driven state. A database given through the environment is
    /// pre-configured; otherwise it must be set through `/configure-database`.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let pipeline = PipelineConfig::from_env()?;
        let output_dir = std::env::var("BACKFILL_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("backfill"));
        let database = pipeline.database.validate().ok().map(|_| pipeline.database.clone());
        Ok(Self {
            database: RwLock::new(database),
            pipeline,
            output_dir,
        })
    }

    async fn database(&self) -> Result<DatabaseConfig, ApiError> {
        self.database
            .read()
            .await
            .clone()
            .ok_or_else(|| ApiError::bad_request("database not configured"))
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn unavailable(err: LookupError) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, format!("database connection failed: {err}"))
    }
}

impl From<ConfigurationError> for ApiError {
    fn from(err: ConfigurationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(source_err) = err.downcast_ref::<SourceFormatError>() {
            return Self::new(StatusCode::UNPROCESSABLE_ENTITY, source_err.to_string());
        }
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "detail": self.detail }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/configure-database", post(configure_database_handler))
        .route("/process-csv", post(process_csv_handler))
        .route("/propuesta/{id}", get(proposal_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("BACKFILL_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::from_env()?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, output_dir = %state.output_dir.display(), "serving");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn open_lookup(config: &DatabaseConfig) -> Result<SqlLookup, LookupError> {
    let lookup = SqlLookup::connect(config).await?;
    lookup.ping().await?;
    Ok(lookup)
}

async fn release(lookup: SqlLookup) {
    if let Err(err) = lookup.close().await {
        warn!(error = %err, "closing database connection failed");
    }
}

async fn configure_database_handler(
    State(state): State<Arc<AppState>>,
    Json(config): Json<DatabaseConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    config.validate()?;
    let lookup = open_lookup(&config).await.map_err(ApiError::unavailable)?;
    let dialect = format!("{:?}", lookup.dialect()).to_lowercase();
    release(lookup).await;

    *state.database.write().await = Some(config);
    info!(%dialect, "database configured");
    Ok(Json(serde_json::json!({
        "message": "database configured",
        "dialect": dialect,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct ProcessQuery {
    source_column: Option<String>,
    client_column: Option<String>,
    data_start_row: Option<usize>,
    batch_size: Option<usize>,
    overwrite: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    success: bool,
    processed_count: usize,
    matched_count: usize,
    errors: Vec<String>,
    file_path: String,
    execution_time: f64,
    report: RunReport,
}

fn upload_config(
    base: &PipelineConfig,
    database: DatabaseConfig,
    query: &ProcessQuery,
) -> Result<PipelineConfig, ConfigurationError> {
    let mut config = base.clone();
    config.database = database;
    config.reports_dir = None;
    if let Some(raw) = &query.source_column {
        config.layout.source_column = parse_column_ref(raw)?;
    }
    if let Some(raw) = &query.client_column {
        config.layout.client_column = parse_column_ref(raw)?;
    }
    if let Some(row) = query.data_start_row {
        config.data_start_row = row;
    }
    if let Some(size) = query.batch_size {
        config.batch_size = size;
    }
    if let Some(overwrite) = query.overwrite {
        config.overwrite = overwrite;
    }
    Ok(config)
}

async fn process_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProcessQuery>,
    mut multipart: Multipart,
) -> Result<Json<ProcessResponse>, ApiError> {
    let database = state.database().await?;

    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload.csv").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        upload = Some((file_name, bytes.to_vec()));
    }
    let Some((file_name, bytes)) = upload else {
        return Err(ApiError::bad_request("multipart field `file` is required"));
    };
    let base_name = Path::new(&file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.csv".to_string());
    if !base_name.to_ascii_lowercase().ends_with(".csv") {
        return Err(ApiError::bad_request("only CSV files are accepted"));
    }

    let pipeline = Pipeline::new(upload_config(&state.pipeline, database.clone(), &query)?)?;
    let output = state.output_dir.join(Uuid::new_v4().to_string()).join(
        default_output_path(Path::new(&base_name))
            .file_name()
            .unwrap_or_default(),
    );

    let lookup = open_lookup(&database).await.map_err(ApiError::unavailable)?;
    let result = pipeline.run_bytes(&bytes, &base_name, &output, &lookup).await;
    release(lookup).await;
    let report = result?;

    Ok(Json(ProcessResponse {
        success: true,
        processed_count: report.summary.extracted,
        matched_count: report.summary.resolved,
        errors: report.summary.warnings.clone(),
        file_path: report.output_path.clone(),
        execution_time: report.execution_time_secs,
        report,
    }))
}

#[derive(Debug, Serialize)]
struct ProposalResponse {
    identifier: Identifier,
    client_name: String,
    holder_role: String,
    amount: Option<f64>,
    contract_date: Option<String>,
    tier: Option<Tier>,
}

async fn proposal_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(raw): AxumPath<String>,
) -> Result<Json<ProposalResponse>, ApiError> {
    let identifier = Identifier::parse(&raw)
        .ok_or_else(|| ApiError::bad_request(format!("invalid proposal identifier {raw:?}")))?;
    let database = state.database().await?;

    let lookup = open_lookup(&database).await.map_err(ApiError::unavailable)?;
    let resolution = BatchResolver::new(ResolverConfig { batch_size: 1 })
        .resolve(&lookup, std::slice::from_ref(&identifier))
        .await;
    release(lookup).await;

    if let Some(failed) = resolution.failed_batches.first() {
        return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, failed.error.clone()));
    }
    let record = resolution
        .records
        .get(&identifier)
        .cloned()
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("proposal {identifier} not found")))?;

    Ok(Json(ProposalResponse {
        identifier,
        client_name: record.client_name,
        holder_role: record.holder_role,
        amount: record.amount,
        contract_date: record.contract_date,
        tier: resolution.tier_counts.keys().next().copied(),
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let database = state.database.read().await.clone();
    let mut body = serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "database_configured": database.is_some(),
    });
    if let Some(config) = database {
        let connection = match open_lookup(&config).await {
            Ok(lookup) => {
                release(lookup).await;
                "ok".to_string()
            }
            Err(err) => {
                warn!(error = %err, "health check connection failed");
                format!("error: {err}")
            }
        };
        body["database_connection"] = serde_json::Value::String(connection);
    }
    Json(body)
}
