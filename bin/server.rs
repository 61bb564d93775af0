// Waterfall - Web Server
// REST API over the merge engine (Axum)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use waterfall::config::DEFAULT_CONFIG_FILE;
use waterfall::{
    get_events_for_entity, open_database, record_merge, Config, Event, ForeignKeyRelation,
    MergeEngine, MergeReport, MergeStage, SqliteStore, Value,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    engine: Arc<MergeEngine>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<MergeStage>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            stage: None,
        }
    }

    fn err(message: String, stage: Option<MergeStage>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            stage,
        }
    }
}

/// Body of POST /api/merge
#[derive(Deserialize)]
struct MergeRequest {
    entity_type: String,
    obsolete_id: Value,
    surviving_id: Value,
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/relations/:table - Relations that reference a table
async fn get_relations(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> impl IntoResponse {
    let table = decode(&table);
    let relations: Vec<ForeignKeyRelation> =
        state.engine.index().relations_referencing(&table).to_vec();

    Json(ApiResponse::ok(relations))
}

/// POST /api/merge - Merge obsolete_id into surviving_id
async fn merge_records(
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> impl IntoResponse {
    let conn = match state.db.lock() {
        Ok(conn) => conn,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<MergeReport>::err("database lock poisoned".to_string(), None)),
            )
                .into_response()
        }
    };
    let store = SqliteStore::new(&conn);

    match state.engine.merge_by_identity(
        &store,
        &request.entity_type,
        &request.obsolete_id,
        &request.surviving_id,
    ) {
        Ok(report) => {
            if let Err(e) = record_merge(&conn, &report, "waterfall-server") {
                tracing::warn!(error = %e, "failed to log merge event");
            }
            (StatusCode::OK, Json(ApiResponse::ok(report))).into_response()
        }
        Err(e) => {
            tracing::error!(stage = e.stage().as_str(), error = %e, "merge failed");
            let status = match e.stage() {
                MergeStage::Lookup => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(ApiResponse::<MergeReport>::err(e.to_string(), Some(e.stage()))),
            )
                .into_response()
        }
    }
}

/// GET /api/events/:table/:id - Merge history of one record
async fn get_events(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> impl IntoResponse {
    let conn = match state.db.lock() {
        Ok(conn) => conn,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<Vec<Event>>::err("database lock poisoned".to_string(), None)),
            )
                .into_response()
        }
    };

    match get_events_for_entity(&conn, &decode(&table), &decode(&id)) {
        Ok(events) => (StatusCode::OK, Json(ApiResponse::ok(events))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to load events");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<Vec<Event>>::err(e.to_string(), None)),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load(std::path::Path::new(DEFAULT_CONFIG_FILE))?;
    waterfall::logging::init_logging(&config.log_level, config.log_format)?;

    println!("🌐 Waterfall - Merge Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !config.database.exists() {
        eprintln!("❌ Database not found at {:?}", config.database);
        eprintln!("   Set {} or \"database\" in {}", waterfall::config::ENV_DATABASE, DEFAULT_CONFIG_FILE);
        std::process::exit(1);
    }

    let conn = open_database(&config.database)?;
    let engine = MergeEngine::for_sqlite(&conn, config.merge.clone())?;
    println!("✓ Database opened: {:?}", config.database);
    println!("✓ {} referenced entity type(s) indexed", engine.index().len());

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        engine: Arc::new(engine),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/relations/:table", get(get_relations))
        .route("/merge", post(merge_records))
        .route("/events/:table/:id", get(get_events))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;

    println!("\n🚀 Server running on http://{}", config.server_addr);
    println!("   API: POST http://{}/api/merge", config.server_addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
