//! HTTP API endpoints

use crate::protocol::{self, ProtocolError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use hyperchunk_core::catalog::{Catalog, DataNode, MetadataStore};
use hyperchunk_core::chunk::Chunk;
use hyperchunk_core::dimension::{Dimension, DimensionSpec};
use hyperchunk_core::hypertable::{EngineConfig, HypertableManager, HypertableRecord, HypertablesStat};
use hyperchunk_core::subspace::CacheStats;
use hyperchunk_core::{ChunkId, HyperError, HypertableId, HypertableType, NodeId, Tablespace};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Application state
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub manager: HypertableManager,
}

impl AppState {
    pub fn new(catalog: Arc<Catalog>, config: EngineConfig) -> Self {
        Self {
            manager: HypertableManager::new(catalog.clone(), config),
            catalog,
        }
    }
}

pub type SharedState = Arc<AppState>;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Hypertable DDL
        .route("/hypertables", get(list_hypertables).post(create_hypertable))
        .route("/hypertables/:id", get(get_hypertable).delete(drop_hypertable))
        .route("/hypertables/:id/rename", post(rename_hypertable))
        .route("/hypertables/:id/dimensions", post(add_dimension))
        .route("/hypertables/:id/interval", put(set_chunk_time_interval))
        .route("/hypertables/:id/tablespaces/:name", post(attach_tablespace).delete(detach_tablespace))

        // Insert routing and chunks
        .route("/hypertables/:id/rows", post(insert_rows))
        .route("/hypertables/:id/chunks", get(list_chunks))
        .route("/hypertables/:id/drop_chunks", post(drop_chunks))
        .route("/chunks/:id", delete(drop_chunk))

        // Data nodes
        .route("/data_nodes", get(list_data_nodes))
        .route("/data_nodes/:name", post(add_data_node))
        .route("/data_nodes/:name/availability", put(set_data_node_availability))

        // Stats
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateHypertableRequest {
    pub table: String,
    pub time_column: String,
    /// Defaults to the engine's chunk time interval
    pub chunk_time_interval: Option<i64>,
    #[serde(default)]
    pub space_dimensions: Vec<SpaceDimensionRequest>,
    #[serde(default)]
    pub replication_factor: i16,
    pub data_nodes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct SpaceDimensionRequest {
    pub column: String,
    pub partitions: u16,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    pub interval: i64,
}

#[derive(Debug, Deserialize)]
pub struct DropChunksRequest {
    /// Microseconds or an RFC 3339 timestamp
    pub older_than: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: i32,
}

#[derive(Debug, Serialize)]
pub struct HypertableResponse {
    #[serde(flatten)]
    pub record: HypertableRecord,
    pub hypertable_type: HypertableType,
}

impl From<HypertableRecord> for HypertableResponse {
    fn from(record: HypertableRecord) -> Self {
        Self {
            hypertable_type: record.hypertable_type(),
            record,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InsertResponse {
    pub rows: usize,
    /// Chunk each row was routed to, in request order
    pub chunks: Vec<ChunkAssignment>,
}

#[derive(Debug, Serialize)]
pub struct ChunkAssignment {
    pub chunk_id: i32,
    pub relation: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub hypertables: HypertablesStat,
    pub chunks_total: usize,
    pub data_nodes_total: usize,
    pub data_nodes_available: usize,
    pub caches: Vec<HypertableCacheStats>,
}

#[derive(Debug, Serialize)]
pub struct HypertableCacheStats {
    pub hypertable_id: i32,
    pub name: String,
    pub chunks: usize,
    pub cache: CacheStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error returned by handlers
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<HyperError> for ApiError {
    fn from(e: HyperError) -> Self {
        let status = match &e {
            HyperError::Validation(_) => StatusCode::BAD_REQUEST,
            HyperError::NotFound(_) => StatusCode::NOT_FOUND,
            HyperError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            HyperError::Placement { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Request failed: {}", e);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

/// Run synchronous engine work off the async runtime
async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: hyperchunk_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn list_hypertables(State(state): State<SharedState>) -> Result<Json<Vec<HypertableResponse>>, ApiError> {
    let records = state.manager.hypertables()?;
    Ok(Json(records.into_iter().map(HypertableResponse::from).collect()))
}

async fn create_hypertable(
    State(state): State<SharedState>,
    Json(req): Json<CreateHypertableRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = run_blocking(move || {
        let mut dimensions = vec![match req.chunk_time_interval {
            Some(interval) => DimensionSpec::time(req.time_column, interval),
            None => state.manager.default_time_dimension(req.time_column),
        }];
        dimensions.extend(
            req.space_dimensions
                .into_iter()
                .map(|d| DimensionSpec::space(d.column, d.partitions)),
        );
        let data_nodes = req
            .data_nodes
            .map(|nodes| nodes.into_iter().map(NodeId::new).collect());

        Ok(state
            .manager
            .create_hypertable(&req.table, dimensions, req.replication_factor, data_nodes)?)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(CreatedResponse { id: id.0 })))
}

async fn get_hypertable(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
) -> Result<Json<HypertableResponse>, ApiError> {
    let record = run_blocking(move || Ok(state.catalog.hypertable(HypertableId(id))?)).await?;
    Ok(Json(record.into()))
}

async fn drop_hypertable(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
) -> Result<Json<Vec<Chunk>>, ApiError> {
    let removed = run_blocking(move || Ok(state.manager.drop_hypertable(HypertableId(id))?)).await?;
    Ok(Json(removed))
}

async fn rename_hypertable(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
    Json(req): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    run_blocking(move || Ok(state.manager.rename_hypertable(HypertableId(id), &req.name)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_dimension(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
    Json(req): Json<SpaceDimensionRequest>,
) -> Result<(StatusCode, Json<Dimension>), ApiError> {
    let dimension = run_blocking(move || {
        let spec = DimensionSpec::space(req.column, req.partitions);
        Ok(state.manager.add_dimension(HypertableId(id), spec)?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(dimension)))
}

async fn set_chunk_time_interval(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
    Json(req): Json<IntervalRequest>,
) -> Result<StatusCode, ApiError> {
    run_blocking(move || Ok(state.manager.set_chunk_time_interval(HypertableId(id), req.interval)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn attach_tablespace(
    State(state): State<SharedState>,
    Path((id, name)): Path<(i32, String)>,
) -> Result<StatusCode, ApiError> {
    let attached = run_blocking(move || {
        Ok(state.manager.attach_tablespace(HypertableId(id), Tablespace::new(name))?)
    })
    .await?;
    Ok(if attached { StatusCode::CREATED } else { StatusCode::OK })
}

async fn detach_tablespace(
    State(state): State<SharedState>,
    Path((id, name)): Path<(i32, String)>,
) -> Result<StatusCode, ApiError> {
    run_blocking(move || {
        Ok(state.manager.detach_tablespace(HypertableId(id), &Tablespace::new(name))?)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn insert_rows(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<InsertResponse>, ApiError> {
    let response = run_blocking(move || {
        let id = HypertableId(id);
        let time_column = state
            .manager
            .hypertable(id)?
            .record()
            .space
            .time_dimension()
            .column
            .clone();
        let rows = protocol::rows_from_json(&body, &time_column)?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = state.manager.insert_row(id, row)?;
            chunks.push(ChunkAssignment {
                chunk_id: chunk.id.0,
                relation: chunk.relation_name(),
            });
        }
        Ok(InsertResponse {
            rows: rows.len(),
            chunks,
        })
    })
    .await?;

    Ok(Json(response))
}

async fn list_chunks(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
) -> Result<Json<Vec<Chunk>>, ApiError> {
    let chunks = run_blocking(move || Ok(state.manager.chunks(HypertableId(id))?)).await?;
    Ok(Json(chunks))
}

async fn drop_chunks(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
    Json(req): Json<DropChunksRequest>,
) -> Result<Json<Vec<Chunk>>, ApiError> {
    let older_than = protocol::time_from_json("older_than", &req.older_than)?
        .as_time()
        .ok_or_else(|| ProtocolError::UnsupportedValue("older_than".into()))?;
    let dropped = run_blocking(move || {
        Ok(state.manager.drop_chunks_before(HypertableId(id), older_than)?)
    })
    .await?;
    Ok(Json(dropped))
}

async fn drop_chunk(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
) -> Result<Json<Chunk>, ApiError> {
    let chunk = run_blocking(move || Ok(state.manager.drop_chunk(ChunkId(id))?)).await?;
    Ok(Json(chunk))
}

async fn list_data_nodes(State(state): State<SharedState>) -> Json<Vec<DataNode>> {
    Json(state.catalog.data_nodes())
}

async fn add_data_node(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    run_blocking(move || Ok(state.catalog.add_data_node(NodeId::new(name))?)).await?;
    Ok(StatusCode::CREATED)
}

async fn set_data_node_availability(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(req): Json<AvailabilityRequest>,
) -> Result<StatusCode, ApiError> {
    run_blocking(move || {
        Ok(state
            .catalog
            .set_data_node_available(&NodeId::new(name), req.available)?)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stats(State(state): State<SharedState>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(run_blocking(move || collect_stats(&state)).await?))
}

fn collect_stats(state: &AppState) -> Result<StatsResponse, ApiError> {
    let mut caches = Vec::new();
    let mut chunks_total = 0;
    for record in state.manager.hypertables()? {
        let chunks = state.manager.chunks(record.id)?.len();
        chunks_total += chunks;
        caches.push(HypertableCacheStats {
            hypertable_id: record.id.0,
            name: record.qualified_name(),
            chunks,
            cache: state.manager.cache_stats(record.id)?,
        });
    }

    let data_nodes = state.catalog.data_nodes();
    Ok(StatsResponse {
        hypertables: state.manager.hypertable_stats()?,
        chunks_total,
        data_nodes_total: data_nodes.len(),
        data_nodes_available: data_nodes.iter().filter(|n| n.available).count(),
        caches,
    })
}

async fn metrics(State(state): State<SharedState>) -> Result<String, ApiError> {
    let stats = run_blocking(move || collect_stats(&state)).await?;

    // Prometheus format
    let mut output = String::new();
    output.push_str("# HELP hyperchunk_hypertables_total Total number of hypertables\n");
    output.push_str("# TYPE hyperchunk_hypertables_total gauge\n");
    output.push_str(&format!("hyperchunk_hypertables_total {}\n", stats.hypertables.num_hypertables_total));

    output.push_str("# HELP hyperchunk_chunks_total Total number of live chunks\n");
    output.push_str("# TYPE hyperchunk_chunks_total gauge\n");
    output.push_str(&format!("hyperchunk_chunks_total {}\n", stats.chunks_total));

    output.push_str("# HELP hyperchunk_data_nodes_available Data nodes accepting new chunks\n");
    output.push_str("# TYPE hyperchunk_data_nodes_available gauge\n");
    output.push_str(&format!("hyperchunk_data_nodes_available {}\n", stats.data_nodes_available));

    output.push_str("# HELP hyperchunk_chunk_cache_hits_total Boundary cache hits\n");
    output.push_str("# TYPE hyperchunk_chunk_cache_hits_total counter\n");
    for ht in &stats.caches {
        output.push_str(&format!(
            "hyperchunk_chunk_cache_hits_total{{hypertable=\"{}\"}} {}\n",
            ht.name, ht.cache.hits
        ));
    }

    output.push_str("# HELP hyperchunk_chunk_cache_misses_total Boundary cache misses\n");
    output.push_str("# TYPE hyperchunk_chunk_cache_misses_total counter\n");
    for ht in &stats.caches {
        output.push_str(&format!(
            "hyperchunk_chunk_cache_misses_total{{hypertable=\"{}\"}} {}\n",
            ht.name, ht.cache.misses
        ));
    }

    Ok(output)
}
