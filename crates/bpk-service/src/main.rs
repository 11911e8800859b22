use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bpk_api::{
    BatchRequest, BatchResult, BpkApi, MergeRequest, MigrateResult, PersonView, ReplayLookup,
    ResetRequest, ResetResult, API_CONTRACT_VERSION,
};
use bpk_core::{BpkQuery, BpkQueryResult, MergeOutcome, PersonId};
use bpk_store_sqlite::SchemaStatus;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: BpkApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "bpk-service")]
#[command(about = "Local HTTP service for bPK lookups and merges")]
struct Args {
    #[arg(long, default_value = "./bpk.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// JSON file of canned registry responses; lookups run offline without it.
    #[arg(long)]
    responses: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(err: &anyhow::Error) -> ServiceError {
        warn!(error = %format!("{err:#}"), "request failed");
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: format!("{err:#}"),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/lookup/batch", post(lookup_batch))
        .route("/v1/lookup/query", post(lookup_query))
        .route("/v1/merge", post(merge))
        .route("/v1/reset", post(reset))
        .route("/v1/persons/:person_id/bpk", get(person_bpk))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut api = BpkApi::new(args.db);
    if let Some(path) = &args.responses {
        api = api.with_lookup(ReplayLookup::from_file(path)?);
    }
    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(
        bind = %args.bind,
        db = %state.api.db_path().display(),
        "bPK service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn lookup_batch(
    State(state): State<ServiceState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<ServiceEnvelope<BatchResult>>, ServiceError> {
    let result = state.api.run_lookup_batch(request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn lookup_query(
    State(state): State<ServiceState>,
    Json(request): Json<BpkQuery>,
) -> Result<Json<ServiceEnvelope<BpkQueryResult>>, ServiceError> {
    let result = state.api.query(&request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn merge(
    State(state): State<ServiceState>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<ServiceEnvelope<MergeOutcome>>, ServiceError> {
    let outcome = state.api.resolve_merge(&request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(outcome)))
}

async fn reset(
    State(state): State<ServiceState>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<ServiceEnvelope<ResetResult>>, ServiceError> {
    let result = state.api.reset(&request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn person_bpk(
    State(state): State<ServiceState>,
    Path(person_id): Path<PersonId>,
) -> Result<Json<ServiceEnvelope<PersonView>>, ServiceError> {
    let view = state.api.show_person(person_id).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(view)))
}
