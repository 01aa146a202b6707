use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use caselog_api::{CaselogApi, MutationOutcome, API_CONTRACT_VERSION};
use caselog_core::{RecordDraft, RecordFilter, RecordId, RecordPatch};
use clap::Parser;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const UI_TEMPLATE: &str = include_str!("../assets/index.html");
const DEFAULT_IDENTITY_HEADER: &str = "x-authenticated-user-email";

#[derive(Debug, Clone)]
struct ServiceState {
    api: CaselogApi,
    identity_header: String,
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

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorBody {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct MeResponse {
    email: String,
    authorized: bool,
}

#[derive(Debug, Parser)]
#[command(name = "caselog-service")]
#[command(about = "HTTP entry point for the Caselog record register")]
struct Args {
    #[arg(long, default_value = "./caselog.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Header carrying the authenticated caller's email, set by the
    /// reverse proxy in front of this service.
    #[arg(long, default_value = DEFAULT_IDENTITY_HEADER)]
    identity_header: String,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn internal(err: &anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = ServiceErrorBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
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

/// Listing parameters. All filter needles arrive as plain query-string
/// values; unknown keys are dropped.
#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
    status: Option<String>,
    system: Option<String>,
    process_number: Option<String>,
    interested_party: Option<String>,
    entry_date: Option<String>,
    situation: Option<String>,
    asymmetry: Option<String>,
    observation: Option<String>,
    origin_unit: Option<String>,
    subject: Option<String>,
    sub_subject: Option<String>,
    responsible_unit: Option<String>,
    destination: Option<String>,
    exit_date: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    10
}

impl ListQuery {
    fn into_filter(self) -> RecordFilter {
        RecordFilter {
            status: self.status,
            system: self.system,
            process_number: self.process_number,
            interested_party: self.interested_party,
            entry_date: self.entry_date,
            situation: self.situation,
            asymmetry: self.asymmetry,
            observation: self.observation,
            origin_unit: self.origin_unit,
            subject: self.subject,
            sub_subject: self.sub_subject,
            responsible_unit: self.responsible_unit,
            destination: self.destination,
            exit_date: self.exit_date,
        }
    }
}

fn caller_email(state: &ServiceState, headers: &HeaderMap) -> Result<String, ServiceError> {
    let value = headers
        .get(state.identity_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if value.is_empty() {
        return Err(ServiceError::new(
            StatusCode::UNAUTHORIZED,
            format!("missing identity header {}", state.identity_header),
        ));
    }
    Ok(value.to_string())
}

/// The allowlist gate run on every data request; there is no session state,
/// so edits to the allowlist take effect immediately.
fn authorize(state: &ServiceState, headers: &HeaderMap) -> Result<String, ServiceError> {
    let email = caller_email(state, headers)?;
    let allowed = state.api.is_authorized(&email).map_err(|err| ServiceError::internal(&err))?;
    if allowed {
        Ok(email)
    } else {
        Err(ServiceError::new(
            StatusCode::FORBIDDEN,
            format!("{email} is not authorized to access this application"),
        ))
    }
}

fn parse_record_id(raw: &str) -> Result<RecordId, ServiceError> {
    Ulid::from_string(raw)
        .map(RecordId)
        .map_err(|_| ServiceError::new(StatusCode::BAD_REQUEST, format!("invalid record id: {raw}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/v1/health", get(health))
        .route("/v1/me", get(me))
        .route("/v1/records", get(list_records).post(create_record))
        .route("/v1/records/:record_id", patch(update_record).delete(delete_record))
        .route("/v1/dashboard", get(dashboard))
        .route("/v1/taxonomy", get(taxonomy))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,caselog=debug".into()),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState {
        api: CaselogApi::new(args.db),
        identity_header: args.identity_header.to_lowercase(),
    };
    tracing::info!(bind = %args.bind, "caselog service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

fn denial_page(email: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html><body style=\"font-family: sans-serif; text-align: center; \
         margin-top: 50px;\"><h1 style=\"color: #ef4444;\">Access Denied</h1>\
         <p>Your email <strong>{email}</strong> is not authorized to access this application. \
         Please contact the register administrator.</p></body></html>"
    ))
}

async fn index(State(state): State<ServiceState>, headers: HeaderMap) -> Response {
    let email = match caller_email(&state, &headers) {
        Ok(email) => email,
        Err(err) => return err.into_response(),
    };
    match state.api.is_authorized(&email) {
        Ok(true) => Html(UI_TEMPLATE.replace("{{user_email}}", &email)).into_response(),
        Ok(false) => (StatusCode::FORBIDDEN, denial_page(&email)).into_response(),
        Err(err) => ServiceError::internal(&err).into_response(),
    }
}

async fn me(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<MeResponse>>, ServiceError> {
    let email = caller_email(&state, &headers)?;
    let authorized = state.api.is_authorized(&email).map_err(|err| ServiceError::internal(&err))?;
    Ok(Json(envelope(MeResponse { email, authorized })))
}

async fn list_records(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<ServiceEnvelope<caselog_core::QueryPage>>, ServiceError> {
    let _email = authorize(&state, &headers)?;
    let page_number = query.page;
    let page_size = query.page_size;
    let filter = query.into_filter();
    let page = state
        .api
        .query_records(page_number, page_size, &filter)
        .map_err(|err| ServiceError::internal(&err))?;
    Ok(Json(envelope(page)))
}

async fn create_record(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(draft): Json<RecordDraft>,
) -> Result<Json<ServiceEnvelope<MutationOutcome>>, ServiceError> {
    let _email = authorize(&state, &headers)?;
    Ok(Json(envelope(state.api.create_record(draft))))
}

async fn update_record(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(record_id): Path<String>,
    Json(patch): Json<RecordPatch>,
) -> Result<Json<ServiceEnvelope<MutationOutcome>>, ServiceError> {
    let _email = authorize(&state, &headers)?;
    let id = parse_record_id(&record_id)?;
    Ok(Json(envelope(state.api.update_record(id, &patch))))
}

async fn delete_record(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(record_id): Path<String>,
) -> Result<Json<ServiceEnvelope<MutationOutcome>>, ServiceError> {
    let _email = authorize(&state, &headers)?;
    let id = parse_record_id(&record_id)?;
    Ok(Json(envelope(state.api.delete_record(id))))
}

async fn dashboard(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<caselog_core::DashboardSummary>>, ServiceError> {
    let _email = authorize(&state, &headers)?;
    let summary = state.api.dashboard().map_err(|err| ServiceError::internal(&err))?;
    Ok(Json(envelope(summary)))
}

async fn taxonomy(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<
    Json<ServiceEnvelope<std::collections::BTreeMap<String, Vec<String>>>>,
    ServiceError,
> {
    let _email = authorize(&state, &headers)?;
    let map = state.api.taxonomy().map_err(|err| ServiceError::internal(&err))?;
    Ok(Json(envelope(map)))
}
